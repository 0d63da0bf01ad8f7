//! EMM State Machine
//!
//! This module defines the network-side EMM state machine per 3GPP TS 24.301
//! Section 5.1.3.4.
//!
//! # EMM States
//!
//! - EMM-DEREGISTERED: no EMM context or no valid location information
//! - EMM-COMMON-PROCEDURE-INITIATED: a common procedure has been started
//! - EMM-REGISTERED: the UE is attached and has a valid EMM context
//!
//! # State Machine Manager
//!
//! The `EmmStateMachine` struct manages transitions and preserves the state
//! from which EMM-COMMON-PROCEDURE-INITIATED was entered, so a completed
//! common procedure returns to it.

use std::fmt;

/// Main EMM state (network side).
///
/// 3GPP TS 24.301 Section 5.1.3.4
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmmState {
    /// EMM-DEREGISTERED
    #[default]
    Deregistered,
    /// EMM-COMMON-PROCEDURE-INITIATED
    CommonProcedureInitiated,
    /// EMM-REGISTERED
    Registered,
}

impl fmt::Display for EmmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmmState::Deregistered => write!(f, "EMM-DEREGISTERED"),
            EmmState::CommonProcedureInitiated => write!(f, "EMM-COMMON-PROCEDURE-INITIATED"),
            EmmState::Registered => write!(f, "EMM-REGISTERED"),
        }
    }
}

/// State transition record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmmStateTransition {
    /// State before the transition
    pub from: EmmState,
    /// State after the transition
    pub to: EmmState,
}

/// EMM state machine.
///
/// Entering EMM-COMMON-PROCEDURE-INITIATED saves the state it was entered
/// from; a confirmed or aborted common procedure restores it, a rejected one
/// falls back to EMM-DEREGISTERED.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmmStateMachine {
    state: EmmState,
    /// State to return to when the running common procedure completes
    saved: Option<EmmState>,
}

impl EmmStateMachine {
    /// Creates a new state machine in EMM-DEREGISTERED.
    pub fn new() -> Self {
        Self {
            state: EmmState::Deregistered,
            saved: None,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> EmmState {
        self.state
    }

    /// Returns true if a common procedure is running.
    pub fn in_common_procedure(&self) -> bool {
        self.state == EmmState::CommonProcedureInitiated
    }

    /// Returns true if the UE is registered.
    pub fn is_registered(&self) -> bool {
        self.state == EmmState::Registered
    }

    /// Enters EMM-COMMON-PROCEDURE-INITIATED, saving the current state.
    ///
    /// Returns `None` if already in a common procedure (the saved state is
    /// not overwritten).
    pub fn enter_common_procedure(&mut self) -> Option<EmmStateTransition> {
        if self.state == EmmState::CommonProcedureInitiated {
            return None;
        }
        let from = self.state;
        self.saved = Some(from);
        self.state = EmmState::CommonProcedureInitiated;
        Some(EmmStateTransition {
            from,
            to: self.state,
        })
    }

    /// Leaves EMM-COMMON-PROCEDURE-INITIATED back to the saved state
    /// (confirmed or aborted common procedure).
    pub fn leave_common_procedure(&mut self) -> Option<EmmStateTransition> {
        if self.state != EmmState::CommonProcedureInitiated {
            return None;
        }
        let from = self.state;
        self.state = self.saved.take().unwrap_or(EmmState::Deregistered);
        Some(EmmStateTransition {
            from,
            to: self.state,
        })
    }

    /// Transitions to EMM-REGISTERED (attach completion).
    pub fn enter_registered(&mut self) -> EmmStateTransition {
        let from = self.state;
        self.saved = None;
        self.state = EmmState::Registered;
        EmmStateTransition {
            from,
            to: self.state,
        }
    }

    /// Transitions to EMM-DEREGISTERED (detach, reject, connection release).
    pub fn enter_deregistered(&mut self) -> EmmStateTransition {
        let from = self.state;
        self.saved = None;
        self.state = EmmState::Deregistered;
        EmmStateTransition {
            from,
            to: self.state,
        }
    }
}

impl Default for EmmStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
