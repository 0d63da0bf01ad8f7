//! Security mode control procedure (MME side)
//!
//! 3GPP TS 24.301 Section 5.4.3: takes a partial native security context
//! into use. The MME selects the NAS algorithms, snapshots the parameters
//! it is about to replace, sends SECURITY MODE COMMAND (replaying the UE's
//! capabilities against bidding-down) under T3460, and:
//!
//! - SECURITY MODE COMPLETE makes the context full native
//! - SECURITY MODE REJECT restores the snapshot exactly, leaving the UE's
//!   prior context usable

use ltemme_common::OctetString;

use crate::sap::{EmmAction, EmmCause, NasMessageType};
use crate::security::{NasSecurityAlgorithms, SecurityContext, SecuritySnapshot};
use crate::UeId;

use super::common::{CommonProcPayload, CommonProcedure};

/// Per-run security mode control state.
#[derive(Debug, Clone)]
pub struct SecurityModePayload {
    /// Algorithms selected for the new context
    pub selected: NasSecurityAlgorithms,
    /// UE capability IE replayed verbatim in the command
    pub replayed_capability: OctetString,
    /// Parameters replaced by this run, restored on reject
    pub snapshot: SecuritySnapshot,
}

/// Outcome of an inbound security mode answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmcOutcome {
    /// The new context is in use (full native)
    Success,
    /// The UE rejected the command; prior parameters were restored
    Reject(EmmCause),
}

/// Starts a security mode run: snapshots the replaced parameters, applies
/// the selected algorithms, sends SECURITY MODE COMMAND and arms T3460.
pub fn start(
    ue_id: UeId,
    security: &mut SecurityContext,
    selected: NasSecurityAlgorithms,
    replayed_capability: OctetString,
    timer_interval_secs: u32,
) -> (CommonProcedure, EmmAction) {
    let snapshot = security.snapshot();
    security.algorithms = selected;

    let payload = SecurityModePayload {
        selected,
        replayed_capability,
        snapshot,
    };
    let request = build_request(security, &payload);
    let mut procedure = CommonProcedure::new(
        CommonProcPayload::SecurityModeControl(payload),
        timer_interval_secs,
    );
    let action = procedure.send_request(ue_id, NasMessageType::SecurityModeCommand, request);
    (procedure, action)
}

/// Handles SECURITY MODE COMPLETE: stops T3460 and takes the new context
/// into use.
pub fn handle_complete(
    procedure: &mut CommonProcedure,
    security: &mut SecurityContext,
) -> SmcOutcome {
    let CommonProcPayload::SecurityModeControl(payload) = &procedure.payload else {
        return SmcOutcome::Reject(EmmCause::ProtocolErrorUnspecified);
    };
    let selected = payload.selected;
    procedure.stop_timer();
    security.mark_in_use(selected);
    SmcOutcome::Success
}

/// Handles SECURITY MODE REJECT: stops T3460 and rolls the security
/// parameters back to the pre-run snapshot.
pub fn handle_reject(
    procedure: &mut CommonProcedure,
    security: &mut SecurityContext,
    _cause: u8,
) -> SmcOutcome {
    let CommonProcPayload::SecurityModeControl(payload) = &procedure.payload else {
        return SmcOutcome::Reject(EmmCause::ProtocolErrorUnspecified);
    };
    let snapshot = payload.snapshot;
    procedure.stop_timer();
    security.restore(snapshot);
    SmcOutcome::Reject(EmmCause::SecurityModeRejectedUnspecified)
}

fn build_request(security: &SecurityContext, payload: &SecurityModePayload) -> OctetString {
    let mut request = OctetString::new();
    request.append_octet(NasMessageType::SecurityModeCommand.code());
    request.append_octet(payload.selected.encode());
    request.append_octet(security.eksi.ksi);
    request.append_slice(payload.replayed_capability.as_slice());
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{
        EeaAlgorithm, EiaAlgorithm, KeySetIdentifier, NasCount, SecurityContextKind,
    };

    fn partial_security() -> SecurityContext {
        let mut security = SecurityContext::new();
        security.mark_authenticated(KeySetIdentifier::new(1));
        security.dl_count = NasCount { overflow: 0, sqn: 4 };
        security
    }

    fn selected() -> NasSecurityAlgorithms {
        NasSecurityAlgorithms::new(EeaAlgorithm::Eea2, EiaAlgorithm::Eia2)
    }

    #[test]
    fn test_start_builds_command_and_arms_t3460() {
        let mut security = partial_security();
        let capability = OctetString::from_slice(&[0xF0, 0x70]);
        let (procedure, action) = start(4, &mut security, selected(), capability, 6);

        assert!(procedure.timer.is_running());
        assert_eq!(procedure.timer.code(), 3460);
        match action {
            EmmAction::SendNasMessage { msg_type, payload, .. } => {
                assert_eq!(msg_type, NasMessageType::SecurityModeCommand);
                // type, algorithms, eksi, replayed capability
                assert_eq!(payload.as_slice(), &[0x5D, 0x22, 0x01, 0xF0, 0x70]);
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_complete_takes_context_into_use() {
        let mut security = partial_security();
        let (mut procedure, _) = start(4, &mut security, selected(), OctetString::new(), 6);

        let outcome = handle_complete(&mut procedure, &mut security);
        assert_eq!(outcome, SmcOutcome::Success);
        assert_eq!(security.kind, SecurityContextKind::FullNative);
        assert_eq!(security.algorithms, selected());
        assert!(!procedure.timer.is_running());
    }

    #[test]
    fn test_reject_restores_pre_run_parameters_exactly() {
        let mut security = partial_security();
        let before = security.snapshot();
        let (mut procedure, _) = start(4, &mut security, selected(), OctetString::new(), 6);
        assert_ne!(security.snapshot(), before);

        let outcome = handle_reject(&mut procedure, &mut security, 24);
        assert_eq!(
            outcome,
            SmcOutcome::Reject(EmmCause::SecurityModeRejectedUnspecified)
        );
        assert_eq!(security.snapshot(), before);
        assert!(!procedure.timer.is_running());
    }
}
