//! Shared fixtures and drivers for the integration tests.

use ltemme_common::config::{MmeConfig, TimerConfig};
use ltemme_common::{Imsi, OctetString};

use ltemme_emm::sap::{
    AttachRequestIes, AttachType, CnResponse, EmmAction, EmmEvent, MobileIdentity, NasMessage,
    NasMessageType,
};
use ltemme_emm::security::{AuthVector, KeySetIdentifier, KASME_SIZE};
use ltemme_emm::{EmmRouter, UeContextManager, UeId};

use tracing_subscriber::{fmt, EnvFilter};

/// IMSI used by the single-UE scenarios.
pub const TEST_IMSI: &str = "001010123456789";

/// Initializes logging for tests; honors RUST_LOG, defaults to "info".
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Builds an engine with the default configuration.
pub fn test_router() -> EmmRouter {
    EmmRouter::new(MmeConfig::default()).expect("default config must validate")
}

/// Builds an empty context manager with the default timer intervals.
pub fn ue_manager() -> UeContextManager {
    UeContextManager::new(TimerConfig::default())
}

/// The fixture IMSI as a typed value.
pub fn test_imsi() -> Imsi {
    Imsi::new(TEST_IMSI).expect("fixture IMSI is well-formed")
}

/// ATTACH REQUEST IEs presenting the given identity.
pub fn attach_ies(identity: MobileIdentity) -> AttachRequestIes {
    AttachRequestIes {
        attach_type: AttachType::EpsAttach,
        eksi: KeySetIdentifier::no_key(),
        identity,
        ue_network_capability: OctetString::from_slice(&[0xF0, 0xF0]),
        esm_container: OctetString::from_slice(&[0x52, 0x01]),
        last_visited_tai: None,
    }
}

/// A batch of distinguishable authentication vectors.
///
/// Vector `k` (1-based) carries XRES `[k; 8]`, so the matching UE answer
/// for the first challenge of a fresh batch is `vec![1u8; 8]`.
pub fn vectors(n: u8) -> Vec<AuthVector> {
    (1..=n)
        .map(|tag| AuthVector {
            rand: [tag; 16],
            autn: [tag; 16],
            xres: vec![tag; 8],
            kasme: [tag; KASME_SIZE],
        })
        .collect()
}

/// Drives a fresh IMSI attach through authentication and security mode
/// control up to the point where ATTACH ACCEPT is outstanding.
pub fn drive_to_accept(router: &EmmRouter, ues: &mut UeContextManager) -> UeId {
    let (ue_id, actions) =
        router.handle_attach_request(ues, attach_ies(MobileIdentity::Imsi(test_imsi())));
    assert!(
        matches!(actions[0], EmmAction::RequestAuthVectors { resync: None, .. }),
        "fresh attach must start with a vector fetch, got {actions:?}"
    );

    let actions = router.handle_event(
        ues,
        ue_id,
        EmmEvent::Cn(CnResponse::AuthVectors { vectors: vectors(2) }),
    );
    assert_nas(&actions, NasMessageType::AuthenticationRequest);

    let actions = router.handle_event(
        ues,
        ue_id,
        EmmEvent::Nas(NasMessage::AuthenticationResponse { res: vec![1u8; 8] }),
    );
    assert_nas(&actions, NasMessageType::SecurityModeCommand);

    let actions = router.handle_event(ues, ue_id, EmmEvent::Nas(NasMessage::SecurityModeComplete));
    assert!(
        matches!(actions[0], EmmAction::RequestSessionEstablishment { .. }),
        "security setup done, session must be requested, got {actions:?}"
    );

    let actions = router.handle_event(
        ues,
        ue_id,
        EmmEvent::Cn(CnResponse::SessionEstablished {
            esm_container: OctetString::from_slice(&[0xC1]),
        }),
    );
    assert!(matches!(actions[0], EmmAction::NotifyNewGuti { .. }));
    assert!(matches!(actions[1], EmmAction::EstablishCnf { .. }));
    ue_id
}

/// Runs a full registration: [`drive_to_accept`] plus ATTACH COMPLETE.
pub fn complete_attach(router: &EmmRouter, ues: &mut UeContextManager) -> UeId {
    let ue_id = drive_to_accept(router, ues);
    let actions = router.handle_event(ues, ue_id, EmmEvent::Nas(NasMessage::AttachComplete));
    assert!(actions.is_empty(), "completion has no side effects, got {actions:?}");
    ue_id
}

/// Asserts that the first action sends the given downlink message type.
pub fn assert_nas(actions: &[EmmAction], expected: NasMessageType) {
    match actions.first() {
        Some(EmmAction::SendNasMessage { msg_type, .. }) if *msg_type == expected => {}
        other => panic!("expected {expected}, got {other:?}"),
    }
}
