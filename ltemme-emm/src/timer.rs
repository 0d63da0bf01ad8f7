//! EMM Timer Management
//!
//! This module implements the retransmission timers used by the MME-side
//! EMM procedures, per 3GPP TS 24.301 Table 10.2.1:
//!
//! - T3450: Attach Accept / GUTI reallocation retransmission
//! - T3460: Authentication Request / Security Mode Command retransmission
//! - T3470: Identity Request retransmission
//!
//! # Generation guard
//!
//! Every timer carries a monotonically increasing generation counter, bumped
//! on each start. A `TimerExpiryEvent` snapshots the generation at expiry;
//! the router discards events whose generation no longer matches the live
//! timer, so a stale expiry from before a stop/restart can never reach a
//! procedure. This makes stop-then-restart atomic with respect to the
//! per-UE event stream.

use std::time::{Duration, Instant};

/// Timer code for T3450 (Attach Accept retransmission)
pub const TIMER_T3450: u16 = 3450;
/// Timer code for T3460 (Authentication / Security Mode retransmission)
pub const TIMER_T3460: u16 = 3460;
/// Timer code for T3470 (Identity Request retransmission)
pub const TIMER_T3470: u16 = 3470;
/// Timer code for T3422 (network-initiated Detach Request retransmission)
pub const TIMER_T3422: u16 = 3422;

/// Default T3450 interval: 6 seconds
pub const DEFAULT_T3450_INTERVAL: u32 = 6;
/// Default T3460 interval: 6 seconds
pub const DEFAULT_T3460_INTERVAL: u32 = 6;
/// Default T3470 interval: 6 seconds
pub const DEFAULT_T3470_INTERVAL: u32 = 6;
/// Default T3422 interval: 6 seconds
pub const DEFAULT_T3422_INTERVAL: u32 = 6;

/// Maximum request retransmissions before a procedure is aborted.
///
/// Applies uniformly to T3450, T3460 and T3470 per TS 24.301 Section 5.4/5.5
/// ("on the fifth expiry ... abort the procedure").
pub const MAX_RETRANSMISSION: u32 = 5;

/// EMM retransmission timer.
///
/// Tick-driven: call [`EmmTimer::perform_tick`] periodically; an expiry
/// stops the timer and increments the expiry count so retry bookkeeping
/// survives restarts that do not clear it.
#[derive(Debug, Clone)]
pub struct EmmTimer {
    /// Timer code (e.g. 3460 for T3460)
    code: u16,
    /// Timer interval in seconds
    interval_secs: u32,
    /// When the timer was started
    start_time: Option<Instant>,
    /// Whether the timer is currently running
    running: bool,
    /// Number of times the timer has expired
    expiry_count: u32,
    /// Incremented on every start; stale expiries carry an older value
    generation: u64,
}

impl EmmTimer {
    /// Creates a new timer with the given code and interval.
    pub fn new(code: u16, interval_secs: u32) -> Self {
        Self {
            code,
            interval_secs,
            start_time: None,
            running: false,
            expiry_count: 0,
            generation: 0,
        }
    }

    /// Starts (or restarts) the timer.
    ///
    /// # Arguments
    /// * `clear_expiry_count` - Whether to reset the expiry count
    pub fn start(&mut self, clear_expiry_count: bool) {
        if clear_expiry_count {
            self.expiry_count = 0;
        }
        self.generation += 1;
        self.start_time = Some(Instant::now());
        self.running = true;
    }

    /// Stops the timer.
    ///
    /// # Arguments
    /// * `clear_expiry_count` - Whether to reset the expiry count
    pub fn stop(&mut self, clear_expiry_count: bool) {
        if clear_expiry_count {
            self.expiry_count = 0;
        }
        if self.running {
            self.generation += 1;
            self.start_time = None;
            self.running = false;
        }
    }

    /// Checks for expiry; returns an event if the timer just expired.
    pub fn perform_tick(&mut self) -> Option<TimerExpiryEvent> {
        if !self.running {
            return None;
        }
        let start = self.start_time?;
        if start.elapsed() < Duration::from_secs(u64::from(self.interval_secs)) {
            return None;
        }
        let generation = self.generation;
        self.start_time = None;
        self.running = false;
        self.expiry_count += 1;
        Some(TimerExpiryEvent {
            code: self.code,
            generation,
            expiry_count: self.expiry_count,
        })
    }

    /// Forces an immediate expiry (test-driven timer advance).
    ///
    /// Used where the engine is driven synchronously and wall-clock waits
    /// are undesirable; semantics match a real expiry tick.
    pub fn force_expire(&mut self) -> Option<TimerExpiryEvent> {
        if !self.running {
            return None;
        }
        let generation = self.generation;
        self.start_time = None;
        self.running = false;
        self.expiry_count += 1;
        Some(TimerExpiryEvent {
            code: self.code,
            generation,
            expiry_count: self.expiry_count,
        })
    }

    /// Returns true if the timer is currently running.
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Returns the timer code.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Returns the timer interval in seconds.
    pub fn interval(&self) -> u32 {
        self.interval_secs
    }

    /// Returns the number of times the timer has expired.
    pub fn expiry_count(&self) -> u32 {
        self.expiry_count
    }

    /// Returns the current generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true if the event belongs to this timer's live arming.
    ///
    /// A stopped or restarted timer invalidates all previously emitted
    /// events.
    pub fn accepts(&self, event: &TimerExpiryEvent) -> bool {
        event.code == self.code && event.generation == self.generation
    }
}

impl std::fmt::Display for EmmTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.running {
            write!(f, "T{}: int[{}] exp[{}]", self.code, self.interval_secs, self.expiry_count)
        } else {
            write!(f, "T{}: .", self.code)
        }
    }
}

/// Event generated when an EMM timer expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerExpiryEvent {
    /// Timer code (e.g. 3460 for T3460)
    pub code: u16,
    /// Generation the timer was armed with when it expired
    pub generation: u64,
    /// Number of times the timer has expired (for retry logic)
    pub expiry_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_timer_creation() {
        let timer = EmmTimer::new(TIMER_T3460, 6);
        assert_eq!(timer.code(), 3460);
        assert_eq!(timer.interval(), 6);
        assert!(!timer.is_running());
        assert_eq!(timer.expiry_count(), 0);
    }

    #[test]
    fn test_timer_start_stop() {
        let mut timer = EmmTimer::new(TIMER_T3450, 6);
        timer.start(true);
        assert!(timer.is_running());
        timer.stop(true);
        assert!(!timer.is_running());
        assert_eq!(timer.expiry_count(), 0);
    }

    #[test]
    fn test_timer_expiry_via_tick() {
        let mut timer = EmmTimer::new(TIMER_T3460, 1);
        timer.start(true);
        assert!(timer.perform_tick().is_none());
        sleep(Duration::from_millis(1100));
        let event = timer.perform_tick().unwrap();
        assert_eq!(event.code, TIMER_T3460);
        assert_eq!(event.expiry_count, 1);
        assert!(!timer.is_running());
    }

    #[test]
    fn test_expiry_count_preserved_across_restart() {
        let mut timer = EmmTimer::new(TIMER_T3460, 1);
        timer.start(true);
        timer.force_expire().unwrap();
        timer.start(false);
        let event = timer.force_expire().unwrap();
        assert_eq!(event.expiry_count, 2);

        timer.start(true);
        assert_eq!(timer.expiry_count(), 0);
    }

    #[test]
    fn test_stale_expiry_rejected_after_restart() {
        let mut timer = EmmTimer::new(TIMER_T3460, 6);
        timer.start(true);
        let stale = TimerExpiryEvent {
            code: TIMER_T3460,
            generation: timer.generation(),
            expiry_count: 1,
        };
        // restart invalidates the old arming
        timer.start(false);
        assert!(!timer.accepts(&stale));
    }

    #[test]
    fn test_stale_expiry_rejected_after_stop() {
        let mut timer = EmmTimer::new(TIMER_T3450, 6);
        timer.start(true);
        let event = TimerExpiryEvent {
            code: TIMER_T3450,
            generation: timer.generation(),
            expiry_count: 1,
        };
        assert!(timer.accepts(&event));
        timer.stop(false);
        assert!(!timer.accepts(&event));
    }

    #[test]
    fn test_force_expire_only_when_running() {
        let mut timer = EmmTimer::new(TIMER_T3470, 6);
        assert!(timer.force_expire().is_none());
        timer.start(true);
        assert!(timer.force_expire().is_some());
        assert!(timer.force_expire().is_none());
    }

    #[test]
    fn test_expiry_event_accepted_until_restart() {
        let mut timer = EmmTimer::new(TIMER_T3460, 6);
        timer.start(true);
        let event = timer.force_expire().unwrap();
        // the event of the live arming is accepted even after expiry
        assert!(timer.accepts(&event));
        timer.start(false);
        assert!(!timer.accepts(&event));
    }
}
