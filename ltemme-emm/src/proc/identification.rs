//! Identification procedure (MME side)
//!
//! 3GPP TS 24.301 Section 5.4.4: the MME requests a specific identity
//! (IMSI or IMEI) under T3470 and records the disclosed value. Typically a
//! corrective child of Attach when the UE presented only a GUTI the MME
//! cannot resolve, or after a MAC failure with an unconfirmed identity.

use ltemme_common::OctetString;

use crate::sap::{EmmAction, IdentityType, MobileIdentity, NasMessageType};
use crate::UeId;

use super::common::{CommonProcPayload, CommonProcedure};

/// Per-run identification state.
#[derive(Debug, Clone)]
pub struct IdentificationPayload {
    /// Identity type requested from the UE
    pub identity_type: IdentityType,
}

/// Outcome of an inbound IDENTITY RESPONSE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentOutcome {
    /// The UE disclosed the requested identity
    Success(MobileIdentity),
    /// The response did not carry the requested identity type
    Ignored,
}

/// Starts an identification run: builds IDENTITY REQUEST and arms T3470.
pub fn start(
    ue_id: UeId,
    identity_type: IdentityType,
    timer_interval_secs: u32,
) -> (CommonProcedure, EmmAction) {
    let payload = IdentificationPayload { identity_type };
    let request = build_request(&payload);
    let mut procedure = CommonProcedure::new(
        CommonProcPayload::Identification(payload),
        timer_interval_secs,
    );
    let action = procedure.send_request(ue_id, NasMessageType::IdentityRequest, request);
    (procedure, action)
}

/// Handles IDENTITY RESPONSE; stops T3470 when the answer matches the
/// requested type.
pub fn handle_response(
    procedure: &mut CommonProcedure,
    identity: MobileIdentity,
) -> IdentOutcome {
    let CommonProcPayload::Identification(payload) = &procedure.payload else {
        return IdentOutcome::Ignored;
    };
    let matches = matches!(
        (payload.identity_type, &identity),
        (IdentityType::Imsi, MobileIdentity::Imsi(_))
            | (IdentityType::Imei, MobileIdentity::Imei(_))
    );
    if !matches {
        return IdentOutcome::Ignored;
    }
    procedure.stop_timer();
    IdentOutcome::Success(identity)
}

fn build_request(payload: &IdentificationPayload) -> OctetString {
    let mut request = OctetString::new();
    request.append_octet(NasMessageType::IdentityRequest.code());
    request.append_octet(payload.identity_type as u8);
    request
}
