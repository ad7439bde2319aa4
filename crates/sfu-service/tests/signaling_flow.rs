//! End-to-end signaling flows through the real actor system.
//!
//! Each test drives in-process peers against `TestSfu`, which runs the
//! worker pool, registry and room actors on a mock media engine.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::media::MediaKind;
use serde_json::json;
use sfu_service::signaling::protocol::Notification;
use sfu_service::signaling::ConnectionPhase;
use sfu_test_utils::peer::consumer_id_of;
use sfu_test_utils::{audio_only_rtp_capabilities, opus_rtp_parameters, TestSfu};

// ============================================================================
// Publish / subscribe
// ============================================================================

#[tokio::test]
async fn test_publish_and_subscribe_in_one_room() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.peer().await;
    let mut bob = sfu.peer().await;

    alice.join("r1").await;
    bob.join("r1").await;

    let caps = alice.rtp_capabilities().await;
    assert!(caps.codecs.iter().any(|c| c.kind == MediaKind::Audio));
    assert!(caps.codecs.iter().any(|c| c.mime_type.eq_ignore_ascii_case("video/VP8")));

    alice.create_send_transport().await;
    let producer_id = alice.produce_video().await;
    assert_eq!(
        alice.dispatcher().session().phase(),
        ConnectionPhase::Active
    );

    let event = bob.next_event().await.expect("new-producer");
    assert_eq!(
        event,
        Notification::NewProducer {
            producer_id,
            peer_id: alice.id(),
            kind: MediaKind::Video,
        }
    );

    bob.create_recv_transport().await;
    let response = bob.consume(producer_id).await;
    assert_eq!(response["params"]["producerId"], json!(producer_id.to_string()));
    assert_eq!(response["params"]["kind"], json!("video"));
    let consumer_id = consumer_id_of(&response);

    assert_eq!(bob.resume(consumer_id).await, json!({}));

    let state = sfu.room("r1").await.get_state().await.unwrap();
    assert_eq!(state.peers.len(), 2);
    assert_eq!(state.transport_count, 2);
    assert_eq!(state.producer_count, 1);
    assert_eq!(state.consumer_count, 1);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_late_joiner_sees_existing_producers() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.peer().await;
    alice.join("r1").await;
    alice.create_send_transport().await;
    let producer_id = alice.produce_video().await;

    let mut bob = sfu.peer().await;
    let joined = bob.join("r1").await;
    assert_eq!(joined["roomId"], json!("r1"));
    assert_eq!(joined["producers"][0]["producerId"], json!(producer_id.to_string()));

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_consume_without_producer_id_picks_latest() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.peer().await;
    let mut bob = sfu.peer().await;
    alice.join("r1").await;
    bob.join("r1").await;

    alice.create_send_transport().await;
    alice
        .produce(MediaKind::Audio, &opus_rtp_parameters(2222))
        .await;
    let video = alice.produce_video().await;

    bob.create_recv_transport().await;
    let response = bob
        .request(
            "consume",
            json!({"rtpCapabilities": sfu_test_utils::to_json(&sfu_test_utils::client_rtp_capabilities())}),
        )
        .await;
    assert_eq!(response["params"]["producerId"], json!(video.to_string()));

    sfu.shutdown().await;
}

// ============================================================================
// Room creation
// ============================================================================

#[tokio::test]
async fn test_concurrent_first_joins_create_one_router() {
    let sfu = TestSfu::start().await;
    // Widen the window in which joins could race router creation
    sfu.engine()
        .delay("create_router", std::time::Duration::from_millis(50));

    let mut peers = Vec::new();
    for _ in 0..5 {
        peers.push(sfu.peer().await);
    }

    let joins = peers.iter_mut().map(|peer| peer.join("r2"));
    futures::future::join_all(joins).await;

    assert_eq!(sfu.engine().calls("create_router"), 1);
    let router_ids: Vec<_> = peers
        .iter()
        .map(|peer| peer.dispatcher().session().room().expect("joined").router_id())
        .collect();
    assert!(router_ids.windows(2).all(|pair| pair.first() == pair.last()));
    let state = sfu.room("r2").await.get_state().await.unwrap();
    assert_eq!(state.peers.len(), 5);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_join_existing_room_not_blocked_by_other_room_creation() {
    let sfu = TestSfu::start().await;
    let mut bob = sfu.peer().await;
    bob.join("b").await;

    sfu.engine()
        .delay("create_router", std::time::Duration::from_millis(800));
    let registry = sfu.registry().clone();
    let creating = tokio::spawn(async move { registry.get_or_create_room("a".to_string()).await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut carol = sfu.peer().await;
    let started = tokio::time::Instant::now();
    carol.join("b").await;
    assert!(
        started.elapsed() < std::time::Duration::from_millis(300),
        "join of room b waited {:?} on room a",
        started.elapsed()
    );
    assert!(!creating.is_finished());

    let room_a = creating.await.unwrap().unwrap();
    assert_ne!(room_a.router_id(), sfu.room("b").await.router_id());
    assert_eq!(sfu.engine().calls("create_router"), 2);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_rejoin_while_room_closing() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.peer().await;
    alice.join("r1").await;
    sfu.engine()
        .delay("close_router", std::time::Duration::from_millis(200));

    assert_eq!(alice.request("leaveRoom", json!({})).await, json!({}));
    let mut bob = sfu.peer().await;
    bob.join("r1").await;

    let state = sfu.room("r1").await.get_state().await.unwrap();
    assert_eq!(state.peers.len(), 1);
    assert_eq!(
        state.router_id,
        bob.dispatcher().session().room().expect("joined").router_id()
    );

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_room_from_connect_query() {
    let sfu = TestSfu::start().await;
    let mut peer = sfu.connect(Some("lobby")).await;

    assert_eq!(peer.dispatcher().session().room_id(), Some("lobby"));
    let data = peer.request("createTransport", json!({"sender": true})).await;
    assert!(data["params"]["id"].is_string());

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_last_leave_releases_room() {
    let sfu = TestSfu::start().await;
    let mut peer = sfu.peer().await;
    peer.join("r1").await;
    peer.create_send_transport().await;

    assert_eq!(peer.request("leaveRoom", json!({})).await, json!({}));

    // Release goes through the registry's mailbox
    let mut released = false;
    for _ in 0..50 {
        if sfu.registry().get_room("r1".to_string()).await.is_err() {
            released = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(released, "room r1 still registered");
    assert_eq!(sfu.engine().calls("close_router"), 1);
    assert_eq!(sfu.engine().calls("close_transport"), 1);

    sfu.shutdown().await;
}

// ============================================================================
// Close cascades
// ============================================================================

#[tokio::test]
async fn test_producer_close_cascades_to_consumers() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.peer().await;
    let mut bob = sfu.peer().await;
    alice.join("r1").await;
    bob.join("r1").await;

    alice.create_send_transport().await;
    let producer_id = alice.produce_video().await;
    bob.create_recv_transport().await;
    let consumer_id = consumer_id_of(&bob.consume(producer_id).await);

    let data = alice
        .request("closeProducer", json!({"producerId": producer_id.to_string()}))
        .await;
    assert_eq!(data, json!({}));

    let event = bob
        .wait_for(|n| matches!(n, Notification::ProducerClosed { .. }))
        .await
        .expect("producer-closed");
    assert_eq!(
        event,
        Notification::ProducerClosed {
            consumer_id,
            producer_id,
        }
    );

    // The consumer is gone
    let data = bob.resume(consumer_id).await;
    assert_eq!(data["code"], json!(4));

    let state = sfu.room("r1").await.get_state().await.unwrap();
    assert_eq!(state.producer_count, 0);
    assert_eq!(state.consumer_count, 0);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_closes_everything_the_peer_owned() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.peer().await;
    let mut bob = sfu.peer().await;
    alice.join("r1").await;
    bob.join("r1").await;

    alice.create_send_transport().await;
    let producer_id = alice.produce_video().await;
    bob.create_recv_transport().await;
    let consumer_id = consumer_id_of(&bob.consume(producer_id).await);

    alice.disconnect().await;

    let event = bob
        .wait_for(|n| matches!(n, Notification::ProducerClosed { .. }))
        .await
        .expect("producer-closed");
    assert_eq!(
        event,
        Notification::ProducerClosed {
            consumer_id,
            producer_id,
        }
    );
    assert_eq!(bob.resume(consumer_id).await["code"], json!(4));

    let state = sfu.room("r1").await.get_state().await.unwrap();
    assert_eq!(state.peers.len(), 1);
    assert_eq!(state.transport_count, 1);
    assert_eq!(state.producer_count, 0);
    assert_eq!(sfu.engine().calls("close_producer"), 1);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_dtls_close_notifies_owner() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.peer().await;
    alice.join("r1").await;
    let transport_id = alice.create_send_transport().await;

    let room = sfu.room("r1").await;
    sfu.engine()
        .close_dtls(
            sfu_service::engine::RouterRef {
                worker_id: room.worker_id(),
                router_id: room.router_id(),
            },
            transport_id,
        )
        .await;

    let event = alice
        .wait_for(|n| matches!(n, Notification::TransportClosed { .. }))
        .await
        .expect("transport-closed");
    assert!(
        matches!(event, Notification::TransportClosed { transport_id: t, .. } if t == transport_id)
    );

    let state = room.get_state().await.unwrap();
    assert_eq!(state.transport_count, 0);

    sfu.shutdown().await;
}

// ============================================================================
// Rejections and idempotence
// ============================================================================

#[tokio::test]
async fn test_incompatible_consume_is_rejected() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.peer().await;
    let mut bob = sfu.peer().await;
    alice.join("r1").await;
    bob.join("r1").await;

    alice.create_send_transport().await;
    let producer_id = alice.produce_video().await;
    bob.create_recv_transport().await;

    let response = bob
        .consume_with(producer_id, &audio_only_rtp_capabilities())
        .await;
    assert_eq!(response["params"]["code"], json!(1));
    assert!(response["params"]["error"].is_string());

    assert_eq!(sfu.engine().calls("consume"), 0);
    let state = sfu.room("r1").await.get_state().await.unwrap();
    assert_eq!(state.consumer_count, 0);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_resume_is_idempotent() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.peer().await;
    let mut bob = sfu.peer().await;
    alice.join("r1").await;
    bob.join("r1").await;

    alice.create_send_transport().await;
    let producer_id = alice.produce_video().await;
    bob.create_recv_transport().await;
    let consumer_id = consumer_id_of(&bob.consume(producer_id).await);

    assert_eq!(bob.resume(consumer_id).await, json!({}));
    assert_eq!(bob.resume(consumer_id).await, json!({}));
    assert_eq!(sfu.engine().calls("resume_consumer"), 1);

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_second_send_transport_conflicts() {
    let sfu = TestSfu::start().await;
    let mut peer = sfu.peer().await;
    peer.join("r1").await;
    peer.create_transport(true).await;

    let data = peer.request("createTransport", json!({"sender": true})).await;
    assert_eq!(data["params"]["code"], json!(5));

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_produce_before_transport_fails() {
    let sfu = TestSfu::start().await;
    let mut peer = sfu.peer().await;
    peer.join("r1").await;

    let data = peer
        .produce(MediaKind::Audio, &opus_rtp_parameters(1))
        .await;
    assert_eq!(data["code"], json!(4));
    assert!(data.get("id").is_none());

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_engine_failure_is_reported_not_fatal() {
    let sfu = TestSfu::start().await;
    let mut peer = sfu.peer().await;
    peer.join("r1").await;

    sfu.engine().fail_next(
        "create_webrtc_transport",
        sfu_service::engine::EngineError::PortsExhausted { min: 40000, max: 40999 },
    );
    let data = peer.request("createTransport", json!({"sender": true})).await;
    assert_eq!(data["params"]["code"], json!(7));

    // The connection keeps working
    peer.create_transport(true).await;

    sfu.shutdown().await;
}

#[tokio::test]
async fn test_room_unavailable_error_leaves_room() {
    let sfu = TestSfu::start().await;
    let mut alice = sfu.peer().await;
    let mut bob = sfu.peer().await;
    alice.join("r1").await;
    bob.join("r1").await;

    sfu.engine().fail_next(
        "create_webrtc_transport",
        sfu_service::engine::EngineError::RouterClosed("r1".to_string()),
    );
    let data = alice.request("createTransport", json!({"sender": true})).await;
    assert_eq!(data["params"]["code"], json!(7));
    assert!(alice.dispatcher().session().room().is_none());

    // The room outlived the error; alice must not linger in it
    let state = sfu.room("r1").await.get_state().await.unwrap();
    assert_eq!(state.peers.len(), 1);
    assert_eq!(state.peers.first().map(|p| p.peer_id), Some(bob.id()));

    sfu.shutdown().await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_notifies_router_closed() {
    let sfu = TestSfu::start().await;
    let mut peer = sfu.peer().await;
    peer.join("r1").await;

    sfu.shutdown().await;

    let event = peer
        .wait_for(|n| matches!(n, Notification::RouterClosed { .. }))
        .await
        .expect("router-closed");
    assert!(matches!(
        event,
        Notification::RouterClosed { ref room_id, reason: sfu_service::actors::CloseReason::Shutdown }
            if room_id == "r1"
    ));
}
