//! Worker crash handling: affected rooms close, peers are told, and the
//! pool either replaces the worker or escalates.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;
use sfu_service::actors::CloseReason;
use sfu_service::config::WorkerDeathPolicy;
use sfu_service::signaling::protocol::Notification;
use sfu_test_utils::TestSfu;
use std::time::Duration;

async fn wait_for_alive_workers(sfu: &TestSfu, expected: usize) {
    for _ in 0..100 {
        let status = sfu.service().pool().get_status().await.unwrap();
        if status.alive_workers() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    unreachable!("pool never reached {expected} alive workers");
}

#[tokio::test]
async fn test_worker_death_closes_room_and_peer_can_rejoin() {
    let sfu = TestSfu::start_with(|config| config.num_workers = 2).await;
    let mut alice = sfu.peer().await;
    alice.join("r1").await;
    alice.create_send_transport().await;
    alice.produce_video().await;

    let old_room = sfu.room("r1").await;
    assert!(sfu.engine().kill_worker(old_room.worker_id()).await);

    let event = alice
        .wait_for(|n| matches!(n, Notification::RouterClosed { .. }))
        .await
        .expect("router-closed");
    assert_eq!(
        event,
        Notification::RouterClosed {
            room_id: "r1".to_string(),
            reason: CloseReason::WorkerDied,
        }
    );

    // Rejoining builds a new router on a live worker
    alice.join("r1").await;
    let new_room = sfu.room("r1").await;
    assert_ne!(new_room.router_id(), old_room.router_id());
    assert_ne!(new_room.worker_id(), old_room.worker_id());
    assert_eq!(sfu.engine().calls("create_router"), 2);

    // Nothing survived from the old router
    let state = new_room.get_state().await.unwrap();
    assert_eq!(state.transport_count, 0);
    assert_eq!(state.producer_count, 0);

    let transport = alice.request("createTransport", json!({"sender": true})).await;
    assert!(transport["params"]["id"].is_string());

    wait_for_alive_workers(&sfu, 2).await;
    assert_eq!(sfu.engine().calls("spawn_worker"), 3);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_rooms_on_other_workers_are_untouched() {
    let sfu = TestSfu::start_with(|config| config.num_workers = 2).await;
    let mut alice = sfu.peer().await;
    let mut bob = sfu.peer().await;
    alice.join("a").await;
    bob.join("b").await;

    let room_a = sfu.room("a").await;
    let room_b = sfu.room("b").await;
    assert_ne!(room_a.worker_id(), room_b.worker_id());

    sfu.engine().kill_worker(room_a.worker_id()).await;
    alice
        .wait_for(|n| matches!(n, Notification::RouterClosed { .. }))
        .await
        .expect("router-closed");

    assert!(!bob.has_pending_event());
    let data = bob.request("getRtpCapabilities", json!({})).await;
    assert!(data["rtpCapabilities"].is_object());
    assert_eq!(sfu.room("b").await.router_id(), room_b.router_id());

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_exit_policy_fires_fatal_token() {
    let sfu = TestSfu::start_with(|config| {
        config.worker_death_policy = WorkerDeathPolicy::Exit;
        config.worker_exit_grace = Duration::from_millis(10);
    })
    .await;
    let fatal = sfu.service().fatal_token();

    let mut peer = sfu.peer().await;
    peer.join("r1").await;
    let room = sfu.room("r1").await;
    sfu.engine().kill_worker(room.worker_id()).await;

    tokio::time::timeout(Duration::from_secs(2), fatal.cancelled())
        .await
        .expect("fatal token cancelled");

    peer.wait_for(|n| matches!(n, Notification::RouterClosed { .. }))
        .await
        .expect("router-closed");

    sfu.shutdown().await;
}
