//! EMM procedures
//!
//! Per-UE procedure registry and the procedure implementations:
//!
//! - `common` — shared lifecycle for the common procedures
//! - `authentication`, `identification`, `security_mode` — the common
//!   procedure instances
//! - `attach`, `detach` — the specific procedures
//!
//! The [`ProcedureStore`] enforces the concurrency invariant of TS 24.301:
//! at most one specific procedure and at most one instance per common
//! procedure kind per EMM context. Creation collides instead of replacing;
//! deletion always stops the owned timer first and detaches children.

pub mod attach;
pub mod authentication;
pub mod common;
pub mod detach;
pub mod identification;
pub mod security_mode;

use std::collections::HashMap;
use std::fmt;

use crate::timer::{TimerExpiryEvent, TIMER_T3460, TIMER_T3470};

use attach::AttachProcedure;
use common::CommonProcedure;
use detach::DetachProcedure;

/// Common procedure kinds instantiated by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommonProcKind {
    /// EPS AKA authentication
    Authentication,
    /// Identity retrieval
    Identification,
    /// Security mode control
    SecurityModeControl,
}

impl CommonProcKind {
    /// Returns the retransmission timer code for this kind.
    pub fn timer_code(&self) -> u16 {
        match self {
            CommonProcKind::Authentication | CommonProcKind::SecurityModeControl => TIMER_T3460,
            CommonProcKind::Identification => TIMER_T3470,
        }
    }
}

impl fmt::Display for CommonProcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommonProcKind::Authentication => write!(f, "AUTHENTICATION"),
            CommonProcKind::Identification => write!(f, "IDENTIFICATION"),
            CommonProcKind::SecurityModeControl => write!(f, "SECURITY-MODE-CONTROL"),
        }
    }
}

/// Specific procedure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecificProcKind {
    /// Attach (TS 24.301 Section 5.5.1)
    Attach,
    /// Detach (TS 24.301 Section 5.5.2)
    Detach,
}

impl fmt::Display for SpecificProcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecificProcKind::Attach => write!(f, "ATTACH"),
            SpecificProcKind::Detach => write!(f, "DETACH"),
        }
    }
}

/// Core-network procedure kinds, used to correlate asynchronous CN answers
/// back to the specific procedure that triggered them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CnProcKind {
    /// Authentication vector fetch from the HSS
    AuthInfoRequest,
}

impl fmt::Display for CnProcKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CnProcKind::AuthInfoRequest => write!(f, "AUTH-INFO-REQUEST"),
        }
    }
}

/// The one specific procedure a context may run.
#[derive(Debug, Clone)]
pub enum SpecificProcedure {
    /// Attach in progress
    Attach(AttachProcedure),
    /// Detach in progress
    Detach(DetachProcedure),
}

impl SpecificProcedure {
    /// Returns the kind of this procedure.
    pub fn kind(&self) -> SpecificProcKind {
        match self {
            SpecificProcedure::Attach(_) => SpecificProcKind::Attach,
            SpecificProcedure::Detach(_) => SpecificProcKind::Detach,
        }
    }

    /// Stops the procedure's retransmission timer.
    pub fn stop_timer(&mut self) {
        match self {
            SpecificProcedure::Attach(p) => p.timer.stop(true),
            SpecificProcedure::Detach(p) => p.timer.stop(true),
        }
    }

    fn perform_tick(&mut self) -> Option<TimerExpiryEvent> {
        match self {
            SpecificProcedure::Attach(p) => p.timer.perform_tick(),
            SpecificProcedure::Detach(p) => p.timer.perform_tick(),
        }
    }
}

/// Pending core-network exchange.
#[derive(Debug, Clone)]
pub struct CnProcedure {
    /// Kind of the exchange
    pub kind: CnProcKind,
    /// Specific procedure awaiting the answer, if any
    pub parent: Option<SpecificProcKind>,
}

/// Procedure creation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// A specific procedure is already running
    #[error("specific procedure {0} already running")]
    SpecificCollision(SpecificProcKind),
    /// A common procedure of this kind is already running
    #[error("common procedure {0} already running")]
    CommonCollision(CommonProcKind),
    /// A CN procedure of this kind is already pending
    #[error("CN procedure {0} already pending")]
    CnCollision(CnProcKind),
}

/// Per-UE procedure registry.
#[derive(Debug, Clone, Default)]
pub struct ProcedureStore {
    specific: Option<SpecificProcedure>,
    common: HashMap<CommonProcKind, CommonProcedure>,
    cn: HashMap<CnProcKind, CnProcedure>,
}

impl ProcedureStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no procedure of any kind is running.
    pub fn is_empty(&self) -> bool {
        self.specific.is_none() && self.common.is_empty() && self.cn.is_empty()
    }

    // ========================================================================
    // Specific procedures
    // ========================================================================

    /// Installs a specific procedure.
    ///
    /// Fails on collision without touching the running procedure; the caller
    /// decides between rejecting the new attempt and aborting the old one.
    pub fn create_specific(
        &mut self,
        procedure: SpecificProcedure,
    ) -> Result<&mut SpecificProcedure, StoreError> {
        if let Some(existing) = &self.specific {
            return Err(StoreError::SpecificCollision(existing.kind()));
        }
        Ok(self.specific.insert(procedure))
    }

    /// Returns the running specific procedure.
    pub fn get_specific(&self) -> Option<&SpecificProcedure> {
        self.specific.as_ref()
    }

    /// Returns the running specific procedure mutably.
    pub fn get_specific_mut(&mut self) -> Option<&mut SpecificProcedure> {
        self.specific.as_mut()
    }

    /// Removes the specific procedure for out-of-store processing.
    ///
    /// The caller must either reinstall it via [`Self::restore_specific`] or
    /// let it drop; its timer was not stopped.
    pub fn take_specific(&mut self) -> Option<SpecificProcedure> {
        self.specific.take()
    }

    /// Reinstalls a procedure taken with [`Self::take_specific`].
    pub fn restore_specific(&mut self, procedure: SpecificProcedure) {
        self.specific = Some(procedure);
    }

    /// Deletes the specific procedure and its children.
    ///
    /// Timers are stopped before anything is dropped; child common
    /// procedures and correlated CN procedures go first.
    pub fn delete_specific(&mut self) -> Option<SpecificProcedure> {
        let mut procedure = self.specific.take()?;
        let kind = procedure.kind();
        procedure.stop_timer();
        self.common.retain(|_, child| {
            if child.parent == Some(kind) {
                child.stop_timer();
                false
            } else {
                true
            }
        });
        self.cn.retain(|_, child| child.parent != Some(kind));
        Some(procedure)
    }

    // ========================================================================
    // Common procedures
    // ========================================================================

    /// Installs a common procedure, failing on a same-kind collision.
    pub fn create_common(
        &mut self,
        procedure: CommonProcedure,
    ) -> Result<&mut CommonProcedure, StoreError> {
        let kind = procedure.kind();
        if self.common.contains_key(&kind) {
            return Err(StoreError::CommonCollision(kind));
        }
        Ok(self.common.entry(kind).or_insert(procedure))
    }

    /// Returns the common procedure of the given kind.
    pub fn get_common(&self, kind: CommonProcKind) -> Option<&CommonProcedure> {
        self.common.get(&kind)
    }

    /// Returns the common procedure of the given kind mutably.
    pub fn get_common_mut(&mut self, kind: CommonProcKind) -> Option<&mut CommonProcedure> {
        self.common.get_mut(&kind)
    }

    /// Removes a common procedure for out-of-store processing.
    pub fn take_common(&mut self, kind: CommonProcKind) -> Option<CommonProcedure> {
        self.common.remove(&kind)
    }

    /// Reinstalls a procedure taken with [`Self::take_common`].
    pub fn restore_common(&mut self, procedure: CommonProcedure) {
        self.common.insert(procedure.kind(), procedure);
    }

    /// Deletes a common procedure, stopping its timer first.
    pub fn delete_common(&mut self, kind: CommonProcKind) -> Option<CommonProcedure> {
        let mut procedure = self.common.remove(&kind)?;
        procedure.stop_timer();
        Some(procedure)
    }

    /// Links a common procedure as a child of the running specific one.
    pub fn link_child(&mut self, child: CommonProcKind) {
        let parent = self.specific.as_ref().map(SpecificProcedure::kind);
        if let Some(proc) = self.common.get_mut(&child) {
            proc.parent = parent;
        }
    }

    /// Clears the parent link of a common procedure.
    pub fn unlink_child(&mut self, child: CommonProcKind) {
        if let Some(proc) = self.common.get_mut(&child) {
            proc.parent = None;
        }
    }

    /// Returns the common procedure whose outstanding request carries the
    /// given delivery digest.
    pub fn find_common_by_digest(&self, digest: u64) -> Option<CommonProcKind> {
        self.common
            .values()
            .find(|p| p.owns_digest(digest))
            .map(CommonProcedure::kind)
    }

    // ========================================================================
    // Core-network procedures
    // ========================================================================

    /// Installs a CN procedure, failing on a same-kind collision.
    pub fn create_cn(&mut self, procedure: CnProcedure) -> Result<&mut CnProcedure, StoreError> {
        let kind = procedure.kind;
        if self.cn.contains_key(&kind) {
            return Err(StoreError::CnCollision(kind));
        }
        Ok(self.cn.entry(kind).or_insert(procedure))
    }

    /// Returns the pending CN procedure of the given kind.
    pub fn get_cn(&self, kind: CnProcKind) -> Option<&CnProcedure> {
        self.cn.get(&kind)
    }

    /// Deletes a CN procedure.
    pub fn delete_cn(&mut self, kind: CnProcKind) -> Option<CnProcedure> {
        self.cn.remove(&kind)
    }

    // ========================================================================
    // Bulk operations
    // ========================================================================

    /// Deletes every procedure, stopping all timers first (lower-layer
    /// release, context teardown).
    pub fn delete_all(&mut self) {
        if let Some(procedure) = &mut self.specific {
            procedure.stop_timer();
        }
        self.specific = None;
        for procedure in self.common.values_mut() {
            procedure.stop_timer();
        }
        self.common.clear();
        self.cn.clear();
    }

    /// Ticks every owned timer, collecting expiry events.
    pub fn perform_tick(&mut self) -> Vec<TimerExpiryEvent> {
        let mut events = Vec::new();
        if let Some(procedure) = &mut self.specific {
            events.extend(procedure.perform_tick());
        }
        for procedure in self.common.values_mut() {
            events.extend(procedure.timer.perform_tick());
        }
        events
    }

    /// Checks a timer expiry against the live arming of the timer that
    /// emitted it; stale events are discarded by the router.
    pub fn accepts_expiry(&self, event: &TimerExpiryEvent) -> bool {
        match event.code {
            TIMER_T3460 | TIMER_T3470 => self
                .common
                .values()
                .any(|p| p.timer.accepts(event)),
            _ => match &self.specific {
                Some(SpecificProcedure::Attach(p)) => p.timer.accepts(event),
                Some(SpecificProcedure::Detach(p)) => p.timer.accepts(event),
                None => false,
            },
        }
    }
}
