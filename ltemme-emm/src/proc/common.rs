//! Generic common-procedure engine
//!
//! Authentication, Identification and Security Mode Control share one
//! lifecycle (3GPP TS 24.301 Section 5.4): send a request, arm the
//! retransmission timer, resend on expiry up to [`MAX_RETRANSMISSION`],
//! abort on exhaustion. This module implements that shared shape; the
//! procedure-specific request contents and response handling live in the
//! instance modules.

use ltemme_common::OctetString;

use crate::proc::{CommonProcKind, SpecificProcKind};
use crate::sap::{message_digest, EmmAction, NasMessageType};
use crate::timer::{EmmTimer, TimerExpiryEvent, MAX_RETRANSMISSION};
use crate::UeId;

use super::authentication::AuthenticationPayload;
use super::identification::IdentificationPayload;
use super::security_mode::SecurityModePayload;

/// Procedure-specific payload, tagged by kind.
#[derive(Debug, Clone)]
pub enum CommonProcPayload {
    /// Authentication (TS 24.301 Section 5.4.2)
    Authentication(AuthenticationPayload),
    /// Identification (TS 24.301 Section 5.4.4)
    Identification(IdentificationPayload),
    /// Security mode control (TS 24.301 Section 5.4.3)
    SecurityModeControl(SecurityModePayload),
}

impl CommonProcPayload {
    /// Returns the kind matching this payload.
    pub fn kind(&self) -> CommonProcKind {
        match self {
            CommonProcPayload::Authentication(_) => CommonProcKind::Authentication,
            CommonProcPayload::Identification(_) => CommonProcKind::Identification,
            CommonProcPayload::SecurityModeControl(_) => CommonProcKind::SecurityModeControl,
        }
    }
}

/// The downlink request a procedure has outstanding, kept for
/// retransmission and delivery correlation.
#[derive(Debug, Clone)]
pub struct StoredRequest {
    /// Message type of the request
    pub msg_type: NasMessageType,
    /// Encoded request payload
    pub payload: OctetString,
    /// Correlation digest of the payload
    pub digest: u64,
}

/// Decision taken on a retransmission timer expiry.
#[derive(Debug, Clone)]
pub enum RetransmitDecision {
    /// Resend the stored request (action already built, timer re-armed)
    Retransmit(EmmAction),
    /// The retransmission budget is spent; abort the procedure
    Exhausted,
}

/// One running common procedure.
///
/// Owns its retransmission timer; the timer never outlives the procedure
/// because deletion goes through the store, which stops it first.
#[derive(Debug, Clone)]
pub struct CommonProcedure {
    kind: CommonProcKind,
    /// Retransmission timer (T3460 or T3470)
    pub timer: EmmTimer,
    /// Procedure-specific payload
    pub payload: CommonProcPayload,
    /// Specific procedure this one is a child of, if any
    pub parent: Option<SpecificProcKind>,
    /// Whether a lower-layer failure must abort this procedure
    pub notify_on_failure: bool,
    last_request: Option<StoredRequest>,
}

impl CommonProcedure {
    /// Creates a procedure in its idle state (no request sent yet).
    pub fn new(payload: CommonProcPayload, timer_interval_secs: u32) -> Self {
        let kind = payload.kind();
        Self {
            kind,
            timer: EmmTimer::new(kind.timer_code(), timer_interval_secs),
            payload,
            parent: None,
            notify_on_failure: true,
            last_request: None,
        }
    }

    /// Returns the kind of this procedure.
    pub fn kind(&self) -> CommonProcKind {
        self.kind
    }

    /// Returns the outstanding request, if one was sent.
    pub fn last_request(&self) -> Option<&StoredRequest> {
        self.last_request.as_ref()
    }

    /// Returns true if the given digest identifies this procedure's
    /// outstanding request.
    pub fn owns_digest(&self, digest: u64) -> bool {
        self.last_request
            .as_ref()
            .is_some_and(|req| req.digest == digest)
    }

    /// Sends (or replaces) the procedure's request: stores it, arms the
    /// timer with a fresh retransmission budget, returns the send action.
    pub fn send_request(
        &mut self,
        ue_id: UeId,
        msg_type: NasMessageType,
        payload: OctetString,
    ) -> EmmAction {
        let digest = message_digest(payload.as_slice());
        self.last_request = Some(StoredRequest {
            msg_type,
            payload: payload.clone(),
            digest,
        });
        self.timer.start(true);
        EmmAction::SendNasMessage {
            ue_id,
            msg_type,
            payload,
            digest,
        }
    }

    /// Resends the stored request without touching the retransmission
    /// budget (non-delivery recovery).
    pub fn resend_request(&mut self, ue_id: UeId) -> Option<EmmAction> {
        let req = self.last_request.as_ref()?;
        let action = EmmAction::SendNasMessage {
            ue_id,
            msg_type: req.msg_type,
            payload: req.payload.clone(),
            digest: req.digest,
        };
        self.timer.start(false);
        Some(action)
    }

    /// Handles an expiry of the procedure's own timer.
    ///
    /// Expiries 1..=[`MAX_RETRANSMISSION`] resend the request and re-arm;
    /// the next one exhausts the budget.
    pub fn handle_timer_expiry(
        &mut self,
        ue_id: UeId,
        event: &TimerExpiryEvent,
    ) -> RetransmitDecision {
        if event.expiry_count > MAX_RETRANSMISSION {
            return RetransmitDecision::Exhausted;
        }
        match self.resend_request(ue_id) {
            Some(action) => RetransmitDecision::Retransmit(action),
            // nothing was ever sent; treat as exhausted rather than spin
            None => RetransmitDecision::Exhausted,
        }
    }

    /// Stops the retransmission timer.
    pub fn stop_timer(&mut self) {
        self.timer.stop(true);
    }
}
