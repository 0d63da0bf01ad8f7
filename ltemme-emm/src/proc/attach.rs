//! Attach procedure (MME side)
//!
//! 3GPP TS 24.301 Section 5.5.1: the registration procedure. The run is an
//! explicit step chain driven by the router:
//!
//! ```text
//! Idle -> AwaitingIdentity (optional)
//!      -> AwaitingAuthentication (optional)
//!      -> AwaitingSecurityMode (optional)
//!      -> AwaitingCnResponse
//!      -> AcceptSent
//!      -> Complete
//! ```
//!
//! Identification/Authentication/SMC run as child common procedures; a UE
//! holding a valid full native context skips straight to the CN step.
//! ATTACH ACCEPT is retransmitted under T3450 up to the shared budget;
//! exhaustion means implicit detach.

use std::fmt;

use ltemme_common::{Guti, OctetString, TaiList};

use crate::sap::{message_digest, AttachRequestIes, EmmAction, NasMessageType};
use crate::timer::{EmmTimer, TimerExpiryEvent, MAX_RETRANSMISSION, TIMER_T3450};
use crate::UeId;

use super::common::{RetransmitDecision, StoredRequest};

/// Position of an attach run in its step chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachStep {
    /// Request received, chain not started
    #[default]
    Idle,
    /// Identification child running
    AwaitingIdentity,
    /// Authentication child running (or vector fetch pending)
    AwaitingAuthentication,
    /// Security mode control child running
    AwaitingSecurityMode,
    /// Default bearer establishment pending at the session layer
    AwaitingCnResponse,
    /// ATTACH ACCEPT sent, T3450 running
    AcceptSent,
    /// ATTACH COMPLETE received
    Complete,
}

impl fmt::Display for AttachStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachStep::Idle => write!(f, "IDLE"),
            AttachStep::AwaitingIdentity => write!(f, "AWAITING-IDENTITY"),
            AttachStep::AwaitingAuthentication => write!(f, "AWAITING-AUTHENTICATION"),
            AttachStep::AwaitingSecurityMode => write!(f, "AWAITING-SECURITY-MODE"),
            AttachStep::AwaitingCnResponse => write!(f, "AWAITING-CN-RESPONSE"),
            AttachStep::AcceptSent => write!(f, "ACCEPT-SENT"),
            AttachStep::Complete => write!(f, "COMPLETE"),
        }
    }
}

/// One attach run.
#[derive(Debug, Clone)]
pub struct AttachProcedure {
    step: AttachStep,
    /// Request IEs this run is serving; equality against a repeated
    /// ATTACH REQUEST classifies it as a retransmission
    pub ies: AttachRequestIes,
    /// T3450 (ATTACH ACCEPT retransmission)
    pub timer: EmmTimer,
    /// Context implicitly detached to make room for this run, if any
    pub old_ue_id: Option<UeId>,
    /// ATTACH ACCEPTs sent (initial send plus retransmissions)
    pub accept_sent: u32,
    /// ATTACH COMPLETEs received
    pub complete_received: u32,
    last_accept: Option<StoredRequest>,
}

impl AttachProcedure {
    /// Creates a run in its idle step.
    pub fn new(ies: AttachRequestIes, t3450_interval_secs: u32) -> Self {
        Self {
            step: AttachStep::Idle,
            ies,
            timer: EmmTimer::new(TIMER_T3450, t3450_interval_secs),
            old_ue_id: None,
            accept_sent: 0,
            complete_received: 0,
            last_accept: None,
        }
    }

    /// Returns the current step.
    pub fn step(&self) -> AttachStep {
        self.step
    }

    /// Advances to the given step.
    pub fn set_step(&mut self, step: AttachStep) {
        self.step = step;
    }

    /// Returns true if the run reached a terminal step.
    pub fn is_terminal(&self) -> bool {
        self.step == AttachStep::Complete
    }

    /// Returns true if a repeated ATTACH REQUEST carries the exact IEs of
    /// this run (retransmission, not a new attempt).
    pub fn is_duplicate_request(&self, ies: &AttachRequestIes) -> bool {
        self.ies == *ies
    }

    /// Sends ATTACH ACCEPT: stores it for retransmission, arms T3450 with
    /// a fresh budget and moves to [`AttachStep::AcceptSent`].
    pub fn send_accept(&mut self, ue_id: UeId, payload: OctetString) -> EmmAction {
        let digest = message_digest(payload.as_slice());
        self.last_accept = Some(StoredRequest {
            msg_type: NasMessageType::AttachAccept,
            payload: payload.clone(),
            digest,
        });
        self.timer.start(true);
        self.step = AttachStep::AcceptSent;
        self.accept_sent += 1;
        EmmAction::EstablishCnf {
            ue_id,
            payload,
            digest,
        }
    }

    /// Resends the stored ATTACH ACCEPT and re-arms T3450 without clearing
    /// the expiry count.
    pub fn retransmit_accept(&mut self, ue_id: UeId) -> Option<EmmAction> {
        let accept = self.last_accept.as_ref()?;
        let action = EmmAction::EstablishCnf {
            ue_id,
            payload: accept.payload.clone(),
            digest: accept.digest,
        };
        self.timer.start(false);
        self.accept_sent += 1;
        Some(action)
    }

    /// Handles a T3450 expiry with the shared retransmission discipline.
    pub fn handle_t3450_expiry(
        &mut self,
        ue_id: UeId,
        event: &TimerExpiryEvent,
    ) -> RetransmitDecision {
        if event.expiry_count > MAX_RETRANSMISSION {
            return RetransmitDecision::Exhausted;
        }
        match self.retransmit_accept(ue_id) {
            Some(action) => RetransmitDecision::Retransmit(action),
            None => RetransmitDecision::Exhausted,
        }
    }

    /// Returns the digest of the outstanding ATTACH ACCEPT, if one is out.
    pub fn accept_digest(&self) -> Option<u64> {
        self.last_accept.as_ref().map(|accept| accept.digest)
    }

    /// Returns true if the digest identifies the outstanding ATTACH ACCEPT.
    pub fn owns_digest(&self, digest: u64) -> bool {
        self.last_accept
            .as_ref()
            .is_some_and(|accept| accept.digest == digest)
    }

    /// Completes the run: stops T3450 and moves to
    /// [`AttachStep::Complete`].
    pub fn complete(&mut self) {
        self.timer.stop(true);
        self.step = AttachStep::Complete;
        self.complete_received += 1;
    }
}

/// Builds the ATTACH ACCEPT container handed to the EMM-AS boundary:
/// message type, attach result, the served TAI list, the assigned GUTI and
/// the piggybacked ESM container.
pub fn build_accept(guti: &Guti, tai_list: &TaiList, esm_container: &OctetString) -> OctetString {
    let mut payload = OctetString::new();
    payload.append_octet(NasMessageType::AttachAccept.code());
    payload.append_octet(0x01); // EPS only
    payload.append_slice(&tai_list.encode());
    payload.append_slice(&guti.encode());
    payload.append_slice(esm_container.as_slice());
    payload
}
