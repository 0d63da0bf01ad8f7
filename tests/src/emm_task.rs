//! EMM task integration tests
//!
//! Drives a registration through the async actor instead of calling the
//! engine directly: events go in through the task handle, side effects
//! come back on the action channel.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use integration_tests::{attach_ies, init_test_logging, test_imsi, vectors};
use ltemme_common::config::MmeConfig;
use ltemme_common::OctetString;
use ltemme_emm::sap::{CnResponse, EmmAction, MobileIdentity, NasMessage, NasMessageType};
use ltemme_emm::task::{EmmMessage, Task};
use ltemme_emm::{EmmTask, UeId};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn next_action(rx: &mut mpsc::Receiver<EmmAction>) -> EmmAction {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for an action")
        .expect("action channel closed")
}

fn expect_nas(action: EmmAction, expected: NasMessageType) -> UeId {
    match action {
        EmmAction::SendNasMessage { ue_id, msg_type, .. } if msg_type == expected => ue_id,
        other => panic!("expected {expected}, got {other:?}"),
    }
}

#[tokio::test]
async fn test_registration_and_detach_through_the_task() {
    init_test_logging();
    let (action_tx, mut actions) = mpsc::channel(64);
    let (mut task, handle, rx) = EmmTask::new(MmeConfig::default(), action_tx).unwrap();
    let runner = tokio::spawn(async move { task.run(rx).await });

    handle
        .send(EmmMessage::InitialAttach {
            ies: attach_ies(MobileIdentity::Imsi(test_imsi())),
        })
        .await
        .unwrap();
    let ue_id = match next_action(&mut actions).await {
        EmmAction::RequestAuthVectors { ue_id, imsi, .. } => {
            assert_eq!(imsi, test_imsi());
            ue_id
        }
        other => panic!("expected a vector fetch, got {other:?}"),
    };

    handle
        .send(EmmMessage::CnAnswer {
            ue_id,
            response: CnResponse::AuthVectors { vectors: vectors(1) },
        })
        .await
        .unwrap();
    expect_nas(
        next_action(&mut actions).await,
        NasMessageType::AuthenticationRequest,
    );

    handle
        .send(EmmMessage::UplinkNas {
            ue_id,
            message: NasMessage::AuthenticationResponse { res: vec![1u8; 8] },
        })
        .await
        .unwrap();
    expect_nas(
        next_action(&mut actions).await,
        NasMessageType::SecurityModeCommand,
    );

    handle
        .send(EmmMessage::UplinkNas {
            ue_id,
            message: NasMessage::SecurityModeComplete,
        })
        .await
        .unwrap();
    match next_action(&mut actions).await {
        EmmAction::RequestSessionEstablishment { .. } => {}
        other => panic!("expected a session request, got {other:?}"),
    }

    handle
        .send(EmmMessage::CnAnswer {
            ue_id,
            response: CnResponse::SessionEstablished {
                esm_container: OctetString::from_slice(&[0xC1]),
            },
        })
        .await
        .unwrap();
    match next_action(&mut actions).await {
        EmmAction::NotifyNewGuti { .. } => {}
        other => panic!("expected the GUTI notification, got {other:?}"),
    }
    match next_action(&mut actions).await {
        EmmAction::EstablishCnf { payload, .. } => assert!(!payload.is_empty()),
        other => panic!("expected ATTACH ACCEPT, got {other:?}"),
    }

    handle
        .send(EmmMessage::UplinkNas {
            ue_id,
            message: NasMessage::AttachComplete,
        })
        .await
        .unwrap();

    // registration holds; now take it down again
    handle
        .send(EmmMessage::InitiateDetach { ue_id })
        .await
        .unwrap();
    expect_nas(next_action(&mut actions).await, NasMessageType::DetachRequest);

    handle
        .send(EmmMessage::UplinkNas {
            ue_id,
            message: NasMessage::DetachAccept,
        })
        .await
        .unwrap();
    match next_action(&mut actions).await {
        EmmAction::NotifySessionRelease { ue_id: released } => assert_eq!(released, ue_id),
        other => panic!("expected the session release, got {other:?}"),
    }

    handle.shutdown().await.unwrap();
    runner.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_tick_retransmits_outstanding_request() {
    init_test_logging();
    // a zero interval makes T3460 due on the first tick
    let mut config = MmeConfig::default();
    config.timers.t3460_secs = 0;

    let (action_tx, mut actions) = mpsc::channel(64);
    let (mut task, handle, rx) = EmmTask::new(config, action_tx).unwrap();
    let runner = tokio::spawn(async move { task.run(rx).await });

    handle
        .send(EmmMessage::InitialAttach {
            ies: attach_ies(MobileIdentity::Imsi(test_imsi())),
        })
        .await
        .unwrap();
    let ue_id = match next_action(&mut actions).await {
        EmmAction::RequestAuthVectors { ue_id, .. } => ue_id,
        other => panic!("expected a vector fetch, got {other:?}"),
    };
    handle
        .send(EmmMessage::CnAnswer {
            ue_id,
            response: CnResponse::AuthVectors { vectors: vectors(1) },
        })
        .await
        .unwrap();
    expect_nas(
        next_action(&mut actions).await,
        NasMessageType::AuthenticationRequest,
    );

    // no further input: the tick loop must retransmit on its own
    expect_nas(
        next_action(&mut actions).await,
        NasMessageType::AuthenticationRequest,
    );

    handle.shutdown().await.unwrap();
    runner.await.unwrap();
}
