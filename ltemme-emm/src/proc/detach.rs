//! Detach procedure (MME side)
//!
//! 3GPP TS 24.301 Section 5.5.2. Two directions:
//!
//! - UE-initiated: the MME answers DETACH ACCEPT (unless the UE is
//!   switching off) and tears the context down
//! - network-initiated: the MME sends DETACH REQUEST under T3422 with the
//!   shared retransmission budget; exhaustion falls back to implicit
//!   detach, which is also the path taken by collision resolution and
//!   T3450 exhaustion

use ltemme_common::OctetString;

use crate::sap::{message_digest, EmmAction, NasMessageType};
use crate::timer::{EmmTimer, TimerExpiryEvent, MAX_RETRANSMISSION, TIMER_T3422};
use crate::UeId;

use super::common::{RetransmitDecision, StoredRequest};

/// Direction of a detach run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachKind {
    /// The UE asked to detach
    UeInitiated {
        /// True if the UE is switching off; no DETACH ACCEPT is sent
        switch_off: bool,
    },
    /// The network is detaching the UE
    NetworkInitiated,
}

/// One detach run.
#[derive(Debug, Clone)]
pub struct DetachProcedure {
    /// Direction of this run
    pub kind: DetachKind,
    /// T3422 (DETACH REQUEST retransmission, network-initiated only)
    pub timer: EmmTimer,
    last_request: Option<StoredRequest>,
}

impl DetachProcedure {
    /// Creates a run for a UE-initiated detach.
    pub fn ue_initiated(switch_off: bool, t3422_interval_secs: u32) -> Self {
        Self {
            kind: DetachKind::UeInitiated { switch_off },
            timer: EmmTimer::new(TIMER_T3422, t3422_interval_secs),
            last_request: None,
        }
    }

    /// Starts a network-initiated detach: sends DETACH REQUEST and arms
    /// T3422.
    pub fn start_network_initiated(
        ue_id: UeId,
        t3422_interval_secs: u32,
    ) -> (Self, EmmAction) {
        let mut payload = OctetString::new();
        payload.append_octet(NasMessageType::DetachRequest.code());
        payload.append_octet(0x02); // re-attach not required
        let digest = message_digest(payload.as_slice());

        let mut procedure = Self {
            kind: DetachKind::NetworkInitiated,
            timer: EmmTimer::new(TIMER_T3422, t3422_interval_secs),
            last_request: Some(StoredRequest {
                msg_type: NasMessageType::DetachRequest,
                payload: payload.clone(),
                digest,
            }),
        };
        procedure.timer.start(true);
        let action = EmmAction::SendNasMessage {
            ue_id,
            msg_type: NasMessageType::DetachRequest,
            payload,
            digest,
        };
        (procedure, action)
    }

    /// Handles a T3422 expiry with the shared retransmission discipline.
    pub fn handle_t3422_expiry(
        &mut self,
        ue_id: UeId,
        event: &TimerExpiryEvent,
    ) -> RetransmitDecision {
        if event.expiry_count > MAX_RETRANSMISSION {
            return RetransmitDecision::Exhausted;
        }
        let Some(request) = self.last_request.as_ref() else {
            return RetransmitDecision::Exhausted;
        };
        let action = EmmAction::SendNasMessage {
            ue_id,
            msg_type: request.msg_type,
            payload: request.payload.clone(),
            digest: request.digest,
        };
        self.timer.start(false);
        RetransmitDecision::Retransmit(action)
    }

    /// Handles DETACH ACCEPT for a network-initiated run.
    pub fn handle_accept(&mut self) {
        self.timer.stop(true);
    }

    /// Returns true if the digest identifies the outstanding request.
    pub fn owns_digest(&self, digest: u64) -> bool {
        self.last_request
            .as_ref()
            .is_some_and(|request| request.digest == digest)
    }
}
