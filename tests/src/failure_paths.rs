//! Failure path integration tests
//!
//! Exercises the unhappy endings: authentication mismatches and their
//! escalation through identification, resynchronization, core-network
//! refusals, retransmission exhaustion and the rollback on SECURITY MODE
//! REJECT.

use integration_tests::{
    assert_nas, attach_ies, complete_attach, init_test_logging, test_imsi, test_router,
    ue_manager, vectors,
};
use ltemme_common::OctetString;
use ltemme_emm::proc::CommonProcKind;
use ltemme_emm::sap::{
    AuthFailureCause, CnResponse, EmmAction, EmmCause, EmmEvent, MobileIdentity, NasMessage,
    NasMessageType,
};
use ltemme_emm::timer::MAX_RETRANSMISSION;
use ltemme_emm::EmmState;

fn start_attach(
    router: &ltemme_emm::EmmRouter,
    ues: &mut ltemme_emm::UeContextManager,
) -> ltemme_emm::UeId {
    let (ue_id, actions) =
        router.handle_attach_request(ues, attach_ies(MobileIdentity::Imsi(test_imsi())));
    assert!(matches!(actions[0], EmmAction::RequestAuthVectors { .. }));
    ue_id
}

#[test]
fn test_hss_refusal_rejects_attach() {
    init_test_logging();
    let router = test_router();
    let mut ues = ue_manager();
    let ue_id = start_attach(&router, &mut ues);

    let actions = router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Cn(CnResponse::AuthVectorsFailure {
            cause: EmmCause::ImsiUnknownInHss,
        }),
    );
    assert!(actions
        .iter()
        .any(|a| matches!(a, EmmAction::EstablishRej { cause, .. }
            if *cause == EmmCause::ImsiUnknownInHss)));
    assert!(ues.get(ue_id).is_none());
}

#[test]
fn test_session_setup_failure_rejects_attach() {
    init_test_logging();
    let router = test_router();
    let mut ues = ue_manager();
    let ue_id = start_attach(&router, &mut ues);

    router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Cn(CnResponse::AuthVectors { vectors: vectors(1) }),
    );
    router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Nas(NasMessage::AuthenticationResponse { res: vec![1u8; 8] }),
    );
    router.handle_event(&mut ues, ue_id, EmmEvent::Nas(NasMessage::SecurityModeComplete));

    let actions = router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Cn(CnResponse::SessionFailed {
            cause: EmmCause::NetworkFailure,
        }),
    );
    assert!(actions
        .iter()
        .any(|a| matches!(a, EmmAction::EstablishRej { .. })));
    assert!(ues.get(ue_id).is_none());
}

#[test]
fn test_res_mismatch_escalates_through_identification() {
    init_test_logging();
    let router = test_router();
    let mut ues = ue_manager();
    let ue_id = start_attach(&router, &mut ues);
    router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Cn(CnResponse::AuthVectors { vectors: vectors(2) }),
    );

    // wrong RES while the presented IMSI is still unconfirmed: the
    // identity is requested instead of rejecting outright
    let actions = router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Nas(NasMessage::AuthenticationResponse { res: vec![0xEE; 8] }),
    );
    assert_nas(&actions, NasMessageType::IdentityRequest);
    assert!(ues.get(ue_id).is_some());

    // the UE confirms the same IMSI; authentication restarts
    let actions = router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Nas(NasMessage::IdentityResponse {
            identity: MobileIdentity::Imsi(test_imsi()),
        }),
    );
    assert_nas(&actions, NasMessageType::AuthenticationRequest);

    // a second mismatch against the confirmed identity is final
    let actions = router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Nas(NasMessage::AuthenticationResponse { res: vec![0xEE; 8] }),
    );
    assert_nas(&actions, NasMessageType::AuthenticationReject);
    assert!(ues.get(ue_id).is_none());
}

#[test]
fn test_sync_failure_resynchronizes_and_recovers() {
    init_test_logging();
    let router = test_router();
    let mut ues = ue_manager();
    let ue_id = start_attach(&router, &mut ues);
    router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Cn(CnResponse::AuthVectors { vectors: vectors(2) }),
    );

    let actions = router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Nas(NasMessage::AuthenticationFailure {
            cause: AuthFailureCause::SynchFailure,
            auts: Some(vec![0x5A; 14]),
        }),
    );
    // stale vectors are discarded, the fetch carries RAND and AUTS
    match &actions[0] {
        EmmAction::RequestAuthVectors { resync: Some((rand, auts)), .. } => {
            assert_eq!(rand.len(), 16);
            assert_eq!(auts, &vec![0x5A; 14]);
        }
        other => panic!("expected resynchronized fetch, got {other:?}"),
    }
    assert_eq!(ues.get(ue_id).unwrap().security.vector_count(), 0);

    // the resynchronized batch succeeds
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
}

#[test]
fn test_smc_reject_leaves_reusable_deregistered_context() {
    init_test_logging();
    let router = test_router();
    let mut ues = ue_manager();
    let ue_id = start_attach(&router, &mut ues);
    router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Cn(CnResponse::AuthVectors { vectors: vectors(1) }),
    );
    router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Nas(NasMessage::AuthenticationResponse { res: vec![1u8; 8] }),
    );
    let before = ues.get(ue_id).unwrap().security.snapshot();

    let actions = router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Nas(NasMessage::SecurityModeReject { cause: 23 }),
    );
    assert!(actions
        .iter()
        .any(|a| matches!(a, EmmAction::EstablishRej { .. })));

    // the context survives with the pre-command parameters restored
    let ctx = ues.get(ue_id).expect("context is kept after SMC reject");
    assert_eq!(ctx.security.snapshot(), before);
    assert_eq!(ctx.fsm.state(), EmmState::Deregistered);
    assert!(ctx.procedures.is_empty());
}

#[test]
fn test_t3460_exhaustion_aborts_the_attach() {
    init_test_logging();
    let router = test_router();
    let mut ues = ue_manager();
    let ue_id = start_attach(&router, &mut ues);
    router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::Cn(CnResponse::AuthVectors { vectors: vectors(1) }),
    );

    for round in 1..=(MAX_RETRANSMISSION + 1) {
        let event = {
            let ctx = ues.get_mut(ue_id).unwrap();
            let proc = ctx
                .procedures
                .get_common_mut(CommonProcKind::Authentication)
                .expect("authentication is running");
            proc.timer.force_expire().expect("timer is armed")
        };
        let actions = router.handle_event(&mut ues, ue_id, EmmEvent::TimerExpiry(event));
        if round <= MAX_RETRANSMISSION {
            assert_nas(&actions, NasMessageType::AuthenticationRequest);
        } else {
            assert!(actions
                .iter()
                .any(|a| matches!(a, EmmAction::ReleaseConnection { .. })));
        }
    }
    // an aborted authentication takes the attach attempt down with it
    assert!(ues.get(ue_id).is_none());
}

#[test]
fn test_t3422_exhaustion_implicitly_detaches() {
    init_test_logging();
    let router = test_router();
    let mut ues = ue_manager();
    let ue_id = complete_attach(&router, &mut ues);

    let actions = router.initiate_detach(&mut ues, ue_id);
    assert_nas(&actions, NasMessageType::DetachRequest);

    for _ in 1..=(MAX_RETRANSMISSION + 1) {
        let event = {
            let ctx = ues.get_mut(ue_id).unwrap();
            let Some(ltemme_emm::proc::SpecificProcedure::Detach(p)) =
                ctx.procedures.get_specific_mut()
            else {
                panic!("detach is running");
            };
            p.timer.force_expire().expect("T3422 is armed")
        };
        router.handle_event(&mut ues, ue_id, EmmEvent::TimerExpiry(event));
    }
    assert!(ues.get(ue_id).is_none());
}

#[test]
fn test_delivery_failure_of_accept_aborts_attach() {
    init_test_logging();
    let router = test_router();
    let mut ues = ue_manager();
    let ue_id = integration_tests::drive_to_accept(&router, &mut ues);
    let digest = {
        let Some(ltemme_emm::proc::SpecificProcedure::Attach(p)) =
            ues.get(ue_id).unwrap().procedures.get_specific()
        else {
            panic!("attach is running");
        };
        p.accept_digest().expect("ATTACH ACCEPT is outstanding")
    };

    let actions = router.handle_event(
        &mut ues,
        ue_id,
        EmmEvent::LowerLayer(ltemme_emm::sap::LowerLayerEvent::Failure { digest }),
    );
    assert!(actions
        .iter()
        .any(|a| matches!(a, EmmAction::NotifySessionRelease { .. })));
    assert!(ues.get(ue_id).is_none());
}
