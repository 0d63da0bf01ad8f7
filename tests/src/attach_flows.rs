//! Attach flow integration tests
//!
//! Walks complete registrations through the engine: identity resolution,
//! the authentication / security-mode chain, GUTI assignment and the
//! detach paths that end a registration.

use integration_tests::{
    assert_nas, attach_ies, complete_attach, drive_to_accept, init_test_logging, test_imsi,
    test_router, ue_manager, vectors,
};
use ltemme_common::{Guti, Imsi, OctetString, Plmn};
use ltemme_emm::sap::{
    CnResponse, EmmAction, EmmEvent, MobileIdentity, NasMessage, NasMessageType,
};
use ltemme_emm::EmmState;

#[test]
fn test_imsi_attach_end_to_end() {
    init_test_logging();
    let router = test_router();
    let mut ues = ue_manager();

    let ue_id = complete_attach(&router, &mut ues);

    let ctx = ues.get(ue_id).expect("context survives registration");
    assert_eq!(ctx.fsm.state(), EmmState::Registered);
    assert!(ctx.identity.imsi_confirmed());
    assert!(ctx.identity.guti_valid);
    assert!(ctx.security.is_full_native());
    assert!(ctx.procedures.is_empty());

    // the assigned GUTI is indexed for the next contact
    let guti = ctx.identity.guti.expect("GUTI was assigned");
    assert_eq!(ues.find_by_guti(&guti), Some(ue_id));
    assert_eq!(ues.find_by_imsi(&test_imsi()), Some(ue_id));
}

#[test]
fn test_guti_attach_runs_identification_then_registers() {
    init_test_logging();
    let router = test_router();
    let mut ues = ue_manager();

    // GUTI from a previous MME: unknown here, identity must be requested
    let foreign = Guti::new(Plmn::new(9, 99, false), 7, 7, 0x0101_0101);
    let (ue_id, actions) =
        router.handle_attach_request(&mut ues, attach_ies(MobileIdentity::Guti(foreign)));
    assert_nas(&actions, NasMessageType::IdentityRequest);
    assert_eq!(
        ues.get(ue_id).unwrap().fsm.state(),
        EmmState::CommonProcedureInitiated
    );

    let actions = router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Nas(NasMessage::IdentityResponse {
            identity: MobileIdentity::Imsi(test_imsi()),
        }),
    );
    assert!(matches!(actions[0], EmmAction::RequestAuthVectors { .. }));
    assert!(ues.get(ue_id).unwrap().identity.imsi_confirmed());

    // the rest of the chain is the ordinary one
    let actions = router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Cn(CnResponse::AuthVectors { vectors: vectors(1) }),
    );
    assert_nas(&actions, NasMessageType::AuthenticationRequest);
    let actions = router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Nas(NasMessage::AuthenticationResponse { res: vec![1u8; 8] }),
    );
    assert_nas(&actions, NasMessageType::SecurityModeCommand);
    let actions =
        router.handle_event(&mut ues, ue_id, EmmEvent::Nas(NasMessage::SecurityModeComplete));
    assert!(matches!(actions[0], EmmAction::RequestSessionEstablishment { .. }));

    router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Cn(CnResponse::SessionEstablished {
            esm_container: OctetString::from_slice(&[0xC1]),
        }),
    );
    router.handle_event(&mut ues, ue_id, EmmEvent::Nas(NasMessage::AttachComplete));
    assert_eq!(ues.get(ue_id).unwrap().fsm.state(), EmmState::Registered);
}

#[test]
fn test_new_attach_for_registered_ue_replaces_old_context() {
    init_test_logging();
    let router = test_router();
    let mut ues = ue_manager();
    let old_ue = complete_attach(&router, &mut ues);

    // the UE lost its state and starts over with a fresh ATTACH REQUEST;
    // the old registration is implicitly detached
    let (new_ue, actions) =
        router.handle_attach_request(&mut ues, attach_ies(MobileIdentity::Imsi(test_imsi())));
    assert_ne!(new_ue, old_ue);
    assert!(ues.get(old_ue).is_none());
    assert!(actions
        .iter()
        .any(|a| matches!(a, EmmAction::NotifySessionRelease { ue_id } if *ue_id == old_ue)));
    assert!(actions
        .iter()
        .any(|a| matches!(a, EmmAction::RequestAuthVectors { ue_id, .. } if *ue_id == new_ue)));

    // the IMSI index follows the new context
    assert_eq!(ues.find_by_imsi(&test_imsi()), Some(new_ue));
}

#[test]
fn test_detach_then_fresh_attach_starts_clean() {
    init_test_logging();
    let router = test_router();
    let mut ues = ue_manager();
    let old_ue = complete_attach(&router, &mut ues);

    let actions = router.initiate_detach(&mut ues, old_ue);
    assert_nas(&actions, NasMessageType::DetachRequest);
    router.handle_event(&mut ues, old_ue, EmmEvent::Nas(NasMessage::DetachAccept));
    assert!(ues.is_empty());

    // nothing of the old registration leaks into the new one
    let (new_ue, actions) =
        router.handle_attach_request(&mut ues, attach_ies(MobileIdentity::Imsi(test_imsi())));
    assert_ne!(new_ue, old_ue);
    assert!(matches!(
        actions[0],
        EmmAction::RequestAuthVectors { resync: None, .. }
    ));
    let ctx = ues.get(new_ue).unwrap();
    assert!(!ctx.security.is_full_native());
    assert!(ctx.identity.guti.is_none());
}

#[test]
fn test_two_ues_register_independently() {
    init_test_logging();
    let router = test_router();
    let mut ues = ue_manager();

    let first = drive_to_accept(&router, &mut ues);

    // a second subscriber interleaves while the first accept is pending
    let other_imsi = Imsi::new("001019876543210").unwrap();
    let (second, actions) =
        router.handle_attach_request(&mut ues, attach_ies(MobileIdentity::Imsi(other_imsi.clone())));
    assert_ne!(first, second);
    assert!(matches!(actions[0], EmmAction::RequestAuthVectors { .. }));

    // first completes, second continues unharmed
    router.handle_event(&mut ues, first, EmmEvent::Nas(NasMessage::AttachComplete));
    let actions = router.handle_event(
        &mut ues,
        second,
        EmmEvent::Cn(CnResponse::AuthVectors { vectors: vectors(1) }),
    );
    assert_nas(&actions, NasMessageType::AuthenticationRequest);

    assert_eq!(ues.len(), 2);
    assert_eq!(ues.get(first).unwrap().fsm.state(), EmmState::Registered);
    assert_eq!(
        ues.get(second).unwrap().fsm.state(),
        EmmState::CommonProcedureInitiated
    );
    assert_eq!(ues.find_by_imsi(&other_imsi), Some(second));
}
