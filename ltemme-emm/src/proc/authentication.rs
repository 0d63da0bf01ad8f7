//! Authentication procedure (MME side)
//!
//! EPS AKA per 3GPP TS 24.301 Section 5.4.2: the MME selects an unused
//! authentication vector, sends AUTHENTICATION REQUEST (eKSI, RAND, AUTN)
//! under T3460, and compares the returned RES against the stored XRES.
//!
//! Failure handling follows Section 5.4.2.6/5.4.2.7:
//!
//! - synch failure: discard the vectors and fetch a resynchronized batch
//!   from the HSS, bounded by [`MAX_SYNC_FAILURES`]
//! - MAC failure / non-EPS authentication with an unconfirmed identity:
//!   escalate to an Identification run before deciding
//! - RES mismatch: reject a confirmed subscriber, otherwise escalate

use ltemme_common::OctetString;

use crate::sap::{AuthFailureCause, EmmAction, EmmCause, NasMessageType};
use crate::security::{KeySetIdentifier, SecurityContext, MAX_SYNC_FAILURES};
use crate::UeId;

use super::common::{CommonProcPayload, CommonProcedure};

/// Per-run authentication state.
#[derive(Debug, Clone)]
pub struct AuthenticationPayload {
    /// eKSI assigned to this AKA run
    pub eksi: KeySetIdentifier,
    /// RAND of the vector in use
    pub rand: [u8; 16],
    /// AUTN of the vector in use
    pub autn: [u8; 16],
}

/// Outcome of an inbound authentication message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// RES matched XRES; a partial native context now exists
    Success,
    /// Terminal failure; reject the UE with the given cause
    Reject(EmmCause),
    /// Identity is unconfirmed; run Identification before deciding
    NeedIdentification,
    /// Fetch a resynchronized vector batch (RAND + AUTS) from the HSS
    ResyncVectors {
        /// RAND of the challenged vector
        rand: Vec<u8>,
        /// AUTS token supplied by the UE
        auts: Vec<u8>,
    },
    /// Message did not apply; log and leave the procedure untouched
    Ignored,
}

/// Authentication start failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// All stored vectors are consumed
    #[error("no unused authentication vector available")]
    NoVectorAvailable,
}

/// Starts an authentication run: consumes the next vector, builds the
/// AUTHENTICATION REQUEST and arms T3460.
pub fn start(
    ue_id: UeId,
    security: &mut SecurityContext,
    timer_interval_secs: u32,
) -> Result<(CommonProcedure, EmmAction), AuthError> {
    let eksi = security.eksi.next();
    let (rand, autn) = {
        let vector = security
            .select_next_vector()
            .ok_or(AuthError::NoVectorAvailable)?;
        (vector.rand, vector.autn)
    };

    let payload = AuthenticationPayload { eksi, rand, autn };
    let request = build_request(&payload);
    let mut procedure =
        CommonProcedure::new(CommonProcPayload::Authentication(payload), timer_interval_secs);
    let action = procedure.send_request(ue_id, NasMessageType::AuthenticationRequest, request);
    Ok((procedure, action))
}

/// Re-issues the request from a fresh (resynchronized) vector batch,
/// keeping the same procedure and eKSI.
pub fn resume_with_vectors(
    procedure: &mut CommonProcedure,
    security: &mut SecurityContext,
    ue_id: UeId,
) -> Result<EmmAction, AuthError> {
    let (rand, autn) = {
        let vector = security
            .select_next_vector()
            .ok_or(AuthError::NoVectorAvailable)?;
        (vector.rand, vector.autn)
    };
    let Some(payload) = payload_mut(procedure) else {
        return Err(AuthError::NoVectorAvailable);
    };
    payload.rand = rand;
    payload.autn = autn;
    let request = build_request(payload);
    Ok(procedure.send_request(ue_id, NasMessageType::AuthenticationRequest, request))
}

/// Handles AUTHENTICATION RESPONSE.
///
/// Stops T3460 in every branch that consumes the message; on success the
/// security context becomes partial native under the run's eKSI.
pub fn handle_response(
    procedure: &mut CommonProcedure,
    security: &mut SecurityContext,
    identity_confirmed: bool,
    res: &[u8],
) -> AuthOutcome {
    let Some(payload) = payload(procedure) else {
        return AuthOutcome::Ignored;
    };
    let eksi = payload.eksi;

    let matches = security
        .selected_vector()
        .is_some_and(|vector| vector.xres == res);
    procedure.stop_timer();

    if matches {
        security.mark_authenticated(eksi);
        AuthOutcome::Success
    } else if identity_confirmed {
        AuthOutcome::Reject(EmmCause::IllegalUe)
    } else {
        AuthOutcome::NeedIdentification
    }
}

/// Handles AUTHENTICATION FAILURE.
pub fn handle_failure(
    procedure: &mut CommonProcedure,
    security: &mut SecurityContext,
    identity_confirmed: bool,
    cause: AuthFailureCause,
    auts: Option<&[u8]>,
) -> AuthOutcome {
    let Some(payload) = payload(procedure) else {
        return AuthOutcome::Ignored;
    };
    let rand = payload.rand;

    match cause {
        AuthFailureCause::SynchFailure => {
            let Some(auts) = auts else {
                // synch failure without AUTS cannot be resynchronized
                return AuthOutcome::Ignored;
            };
            procedure.stop_timer();
            security.sync_failure_count += 1;
            if security.sync_failure_count >= MAX_SYNC_FAILURES {
                return AuthOutcome::Reject(EmmCause::IllegalUe);
            }
            security.clear_vectors();
            AuthOutcome::ResyncVectors {
                rand: rand.to_vec(),
                auts: auts.to_vec(),
            }
        }
        AuthFailureCause::MacFailure => {
            procedure.stop_timer();
            if identity_confirmed {
                AuthOutcome::Reject(EmmCause::IllegalUe)
            } else {
                AuthOutcome::NeedIdentification
            }
        }
        AuthFailureCause::NonEpsAuthUnacceptable => {
            procedure.stop_timer();
            AuthOutcome::NeedIdentification
        }
        AuthFailureCause::Unknown(_) => AuthOutcome::Ignored,
    }
}

fn build_request(payload: &AuthenticationPayload) -> OctetString {
    let mut request = OctetString::new();
    request.append_octet(NasMessageType::AuthenticationRequest.code());
    request.append_octet(payload.eksi.ksi);
    request.append_slice(&payload.rand);
    request.append_slice(&payload.autn);
    request
}

fn payload(procedure: &CommonProcedure) -> Option<&AuthenticationPayload> {
    match &procedure.payload {
        CommonProcPayload::Authentication(p) => Some(p),
        _ => None,
    }
}

fn payload_mut(procedure: &mut CommonProcedure) -> Option<&mut AuthenticationPayload> {
    match &mut procedure.payload {
        CommonProcPayload::Authentication(p) => Some(p),
        _ => None,
    }
}
