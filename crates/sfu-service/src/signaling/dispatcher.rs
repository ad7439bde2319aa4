//! Signaling protocol dispatcher.
//!
//! One `Dispatcher` per connection. It decodes each inbound frame, routes
//! the request to the peer's room, and turns the outcome into exactly one
//! response for requests that carry an `id`. Failures (unknown methods,
//! bad payloads, unknown entities, engine rejections) are rendered into the
//! response slot the caller expects a success payload in; none of them
//! close the connection.
//!
//! Requests are handled one at a time per connection. Connections are
//! independent.

use super::connection::ConnectionHandle;
use super::protocol::{
    canonical_method, ErrorSlot, Notification, Request, RequestEnvelope, ServerMessage,
};
use super::session::{ConnectionPhase, PeerSession};
use crate::actors::messages::{ConsumeOutcome, TransportDirection};
use crate::actors::metrics::ActorMetrics;
use crate::actors::registry::RoomRegistryHandle;
use crate::actors::room::RoomHandle;
use crate::errors::SfuError;
use crate::observability::metrics as prom;

use common::types::ConnectionId;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Shared state every connection's dispatcher needs.
#[derive(Debug, Clone)]
pub struct SignalingContext {
    pub registry: RoomRegistryHandle,
    /// Room joined implicitly by peers that never sent `joinRoom`.
    pub default_room: Option<String>,
    pub metrics: Arc<ActorMetrics>,
}

/// Routes one connection's requests.
#[derive(Debug)]
pub struct Dispatcher {
    ctx: Arc<SignalingContext>,
    session: PeerSession,
}

impl Dispatcher {
    /// Create the dispatcher and peer session for a new connection.
    #[must_use]
    pub fn new(ctx: Arc<SignalingContext>, connection: ConnectionHandle) -> Self {
        ctx.metrics.connection_created();
        Self {
            ctx,
            session: PeerSession::new(connection),
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> ConnectionId {
        self.session.peer_id()
    }

    #[must_use]
    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    /// Greet the client and, when the connection named a room, join it.
    pub async fn on_connect(&mut self, room_id: Option<String>) {
        info!(
            target: "sfu.signaling",
            peer_id = %self.peer_id(),
            room_id = room_id.as_deref().unwrap_or(""),
            "Peer connected"
        );

        self.session.connection().notify(Notification::ConnectionSuccess {
            socket_id: self.peer_id(),
        });

        let Some(room_id) = room_id.filter(|id| !id.trim().is_empty()) else {
            return;
        };
        self.session.set_preferred_room(Some(room_id.clone()));

        if let Err(e) = self.session.join_room(&self.ctx.registry, &room_id).await {
            warn!(
                target: "sfu.signaling",
                peer_id = %self.peer_id(),
                room_id = %room_id,
                error = %e,
                "Join at connect failed, will retry on first request"
            );
        }
    }

    /// Handle one text frame, queueing the response if there is one.
    pub async fn handle_text(&mut self, text: &str) {
        let envelope: RequestEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                let err = SfuError::InvalidPayload(e.to_string());
                debug!(
                    target: "sfu.signaling",
                    peer_id = %self.peer_id(),
                    error = %err,
                    "Undecodable frame"
                );
                prom::record_signaling_error("unknown", err.error_code());
                self.session.connection().notify(Notification::ProtocolError {
                    error: err.client_message(),
                });
                return;
            }
        };

        if let Some(response) = self
            .dispatch(envelope.id, &envelope.method, envelope.data)
            .await
        {
            // A closed connection discards the response
            self.session.connection().respond(response).await;
        }
    }

    /// Execute a request. Returns the response to send, which is `None`
    /// only for requests without an `id`.
    pub async fn dispatch(
        &mut self,
        id: Option<u64>,
        method: &str,
        data: Value,
    ) -> Option<ServerMessage> {
        let start = Instant::now();
        let label = canonical_method(method).unwrap_or("unknown");

        let result = match Request::decode(method, data) {
            Ok(request) => self.execute(request).await,
            Err(e) => Err(e),
        };

        prom::record_signaling_latency(label, start.elapsed());

        match result {
            Ok(data) => id.map(|id| ServerMessage::response(id, data)),
            Err(err) => {
                prom::record_signaling_error(label, err.error_code());
                self.log_failure(id, method, &err);
                id.map(|id| ServerMessage::response(id, ErrorSlot::for_method(method).render(&err)))
            }
        }
    }

    /// Tear the session down. The room closes everything the peer owned.
    pub async fn disconnect(&mut self) {
        if self.session.phase() == ConnectionPhase::Disconnected {
            return;
        }
        let room_id = self.session.room_id().map(str::to_string);
        self.session.destroy().await;
        self.ctx.metrics.connection_closed();
        info!(
            target: "sfu.signaling",
            peer_id = %self.peer_id(),
            room_id = room_id.as_deref().unwrap_or(""),
            "Peer disconnected"
        );
    }

    async fn execute(&mut self, request: Request) -> Result<Value, SfuError> {
        if !request.requires_room() {
            return match request {
                Request::JoinRoom(join) => {
                    let room_id = join.room_id.trim().to_string();
                    let joined = self.session.join_room(&self.ctx.registry, &room_id).await?;
                    // Implicit rejoins after a lost router return here
                    self.session.set_preferred_room(Some(room_id));
                    to_value(&joined)
                }
                Request::LeaveRoom => {
                    self.session.leave_room().await?;
                    self.session.set_preferred_room(None);
                    Ok(json!({}))
                }
                other => Err(SfuError::Internal(format!(
                    "{} routed without a room",
                    other.method()
                ))),
            };
        }

        let room = self.ensure_room().await?;
        let result = self.execute_in_room(&room, request).await;

        if matches!(result, Err(SfuError::RoomUnavailable(_))) {
            self.session.abandon_room().await;
        }
        result
    }

    async fn execute_in_room(
        &mut self,
        room: &RoomHandle,
        request: Request,
    ) -> Result<Value, SfuError> {
        let peer_id = self.peer_id();

        match request {
            Request::GetRtpCapabilities => {
                let rtp_capabilities = room.rtp_capabilities().await?;
                self.session.advance(ConnectionPhase::CapabilityExchanged);
                Ok(json!({ "rtpCapabilities": rtp_capabilities }))
            }

            Request::CreateTransport(create) => {
                let direction = TransportDirection::from_sender(create.sender);
                let transport = room.create_transport(peer_id, direction).await?;
                self.session.advance(ConnectionPhase::TransportsEstablished);
                Ok(json!({ "params": transport }))
            }

            Request::ConnectTransport { direction, request } => {
                room.connect_transport(
                    peer_id,
                    request.transport_id,
                    direction,
                    request.dtls_parameters,
                )
                .await?;
                Ok(json!({}))
            }

            Request::Produce(produce) => {
                let producer_id = room
                    .produce(
                        peer_id,
                        produce.transport_id,
                        produce.kind,
                        produce.rtp_parameters,
                    )
                    .await?;
                self.session.advance(ConnectionPhase::Active);
                Ok(json!({ "id": producer_id }))
            }

            Request::Consume(consume) => {
                let outcome = room
                    .consume(
                        peer_id,
                        consume.transport_id,
                        consume.producer_id,
                        consume.rtp_capabilities,
                    )
                    .await?;
                match outcome {
                    ConsumeOutcome::Created(params) => {
                        self.session.advance(ConnectionPhase::Active);
                        Ok(json!({ "params": params }))
                    }
                    ConsumeOutcome::Rejected { reason } => Err(SfuError::Incompatible(reason)),
                }
            }

            Request::ResumeConsumer(resume) => {
                room.resume_consumer(peer_id, resume.consumer_id).await?;
                Ok(json!({}))
            }

            Request::CloseProducer(close) => {
                room.close_producer(peer_id, close.producer_id).await?;
                Ok(json!({}))
            }

            Request::CloseConsumer(close) => {
                room.close_consumer(peer_id, close.consumer_id).await?;
                Ok(json!({}))
            }

            Request::CloseTransport(close) => {
                room.close_transport(peer_id, close.transport_id).await?;
                Ok(json!({}))
            }

            Request::JoinRoom(_) | Request::LeaveRoom => Err(SfuError::Internal(
                "room membership request routed to room".to_string(),
            )),
        }
    }

    /// The peer's room, joining the preferred or default room if needed.
    async fn ensure_room(&mut self) -> Result<RoomHandle, SfuError> {
        if let Some(room) = self.session.live_room() {
            return Ok(room);
        }

        let target = self
            .session
            .preferred_room()
            .map(str::to_string)
            .or_else(|| self.ctx.default_room.clone())
            .ok_or(SfuError::NotInRoom)?;

        self.session.join_room(&self.ctx.registry, &target).await?;
        self.session
            .live_room()
            .ok_or_else(|| SfuError::RoomUnavailable(target))
    }

    fn log_failure(&self, id: Option<u64>, method: &str, err: &SfuError) {
        if err.error_code() == 6 {
            warn!(
                target: "sfu.signaling",
                peer_id = %self.peer_id(),
                method = %method,
                error = %err,
                "Request failed"
            );
        } else if id.is_none() {
            // Fire-and-forget: nobody else will see this
            info!(
                target: "sfu.signaling",
                peer_id = %self.peer_id(),
                method = %method,
                error = %err,
                "Request without id failed"
            );
        } else {
            debug!(
                target: "sfu.signaling",
                peer_id = %self.peer_id(),
                method = %method,
                error = %err,
                "Request rejected"
            );
        }
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, SfuError> {
    serde_json::to_value(value).map_err(|e| SfuError::Internal(format!("serialize response: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::pool::{WorkerPoolActor, WorkerPoolConfig};
    use crate::actors::registry::{RegistryConfig, RoomRegistryActor};
    use crate::actors::room::RoomSettings;
    use crate::config::WorkerDeathPolicy;
    use crate::engine::codecs::default_media_codecs;
    use crate::engine::{ListenIp, LocalEngine, WebRtcTransportOptions, WorkerSettings};
    use crate::signaling::connection::OutboundQueue;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    async fn context(default_room: Option<&str>) -> Arc<SignalingContext> {
        let engine = LocalEngine::new();
        let metrics = ActorMetrics::new();
        let (events_tx, events_rx) = mpsc::channel(16);

        let (pool, _) = WorkerPoolActor::start(
            Arc::new(engine.clone()),
            WorkerPoolConfig {
                num_workers: 1,
                worker_settings: WorkerSettings {
                    rtc_min_port: 3000,
                    rtc_max_port: 3100,
                },
                death_policy: WorkerDeathPolicy::Respawn,
                respawn_attempts: 1,
                respawn_backoff: Duration::from_millis(10),
                exit_grace: Duration::from_secs(60),
            },
            events_tx,
            Arc::clone(&metrics),
            CancellationToken::new(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let (registry, _) = RoomRegistryActor::spawn(
            RegistryConfig {
                sfu_id: "sfu-test".to_string(),
                max_rooms: 10,
                room_settings: RoomSettings {
                    media_codecs: default_media_codecs(),
                    transport_options: WebRtcTransportOptions {
                        listen_ips: vec![ListenIp {
                            ip: "127.0.0.1".to_string(),
                            announced_ip: None,
                        }],
                        enable_udp: true,
                        enable_tcp: false,
                        prefer_udp: true,
                    },
                    max_peers: 10,
                },
            },
            Arc::new(engine),
            pool,
            events_rx,
            Arc::clone(&metrics),
            CancellationToken::new(),
        );

        Arc::new(SignalingContext {
            registry,
            default_room: default_room.map(str::to_string),
            metrics,
        })
    }

    fn dispatcher(ctx: &Arc<SignalingContext>) -> (Dispatcher, OutboundQueue) {
        let (connection, queue) =
            ConnectionHandle::channel(ConnectionId::new(), 64, CancellationToken::new());
        (Dispatcher::new(Arc::clone(ctx), connection), queue)
    }

    fn data_of(message: Option<ServerMessage>, expected_id: u64) -> Value {
        match message {
            Some(ServerMessage::Response { id, data }) => {
                assert_eq!(id, expected_id);
                data
            }
            other => unreachable!("expected a response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_method_gets_error_and_connection_survives() {
        let ctx = context(Some("default")).await;
        let (mut dispatcher, _queue) = dispatcher(&ctx);

        let data = data_of(dispatcher.dispatch(Some(1), "fly", json!({})).await, 1);
        assert_eq!(data, json!({"error": "Unknown operation: fly", "code": 1}));

        let data = data_of(
            dispatcher
                .dispatch(Some(2), "getRtpCapabilities", json!({}))
                .await,
            2,
        );
        assert!(data["rtpCapabilities"]["codecs"].is_array());
    }

    #[tokio::test]
    async fn test_fire_and_forget_gets_no_response() {
        let ctx = context(Some("default")).await;
        let (mut dispatcher, _queue) = dispatcher(&ctx);

        assert!(dispatcher.dispatch(None, "fly", json!({})).await.is_none());
        assert!(dispatcher
            .dispatch(None, "getRtpCapabilities", Value::Null)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_room_scoped_request_without_room() {
        let ctx = context(None).await;
        let (mut dispatcher, _queue) = dispatcher(&ctx);

        let data = data_of(
            dispatcher
                .dispatch(Some(1), "createTransport", json!({"sender": true}))
                .await,
            1,
        );
        assert_eq!(
            data,
            json!({"params": {"error": "Not in a room", "code": 5}})
        );
    }

    #[tokio::test]
    async fn test_implicit_join_of_default_room() {
        let ctx = context(Some("lobby")).await;
        let (mut dispatcher, _queue) = dispatcher(&ctx);

        let data = data_of(
            dispatcher
                .dispatch(Some(1), "createWebRtcTransport", json!({"sender": false}))
                .await,
            1,
        );
        assert!(data["params"]["id"].is_string());
        assert_eq!(dispatcher.session().room_id(), Some("lobby"));
        assert_eq!(
            dispatcher.session().phase(),
            ConnectionPhase::TransportsEstablished
        );
    }

    #[tokio::test]
    async fn test_join_switch_and_leave() {
        let ctx = context(None).await;
        let (mut dispatcher, _queue) = dispatcher(&ctx);

        let data = data_of(
            dispatcher
                .dispatch(Some(1), "joinRoom", json!({"roomId": "a"}))
                .await,
            1,
        );
        assert_eq!(data["roomId"], "a");
        assert_eq!(data["producers"], json!([]));

        dispatcher
            .dispatch(Some(2), "joinRoom", json!({"roomId": "b"}))
            .await;
        assert_eq!(dispatcher.session().room_id(), Some("b"));

        let data = data_of(dispatcher.dispatch(Some(3), "leaveRoom", json!({})).await, 3);
        assert_eq!(data, json!({}));
        assert!(dispatcher.session().room().is_none());
        assert_eq!(dispatcher.session().phase(), ConnectionPhase::Connected);
    }

    #[tokio::test]
    async fn test_on_connect_greets_and_joins() {
        let ctx = context(None).await;
        let (mut dispatcher, mut queue) = dispatcher(&ctx);

        dispatcher.on_connect(Some("r9".to_string())).await;

        assert_eq!(
            queue.try_recv(),
            Some(ServerMessage::Event(Notification::ConnectionSuccess {
                socket_id: dispatcher.peer_id(),
            }))
        );
        assert_eq!(dispatcher.session().room_id(), Some("r9"));
    }

    #[tokio::test]
    async fn test_malformed_frame_reports_protocol_error() {
        let ctx = context(None).await;
        let (mut dispatcher, mut queue) = dispatcher(&ctx);

        dispatcher.handle_text("not json").await;

        assert!(matches!(
            queue.try_recv(),
            Some(ServerMessage::Event(Notification::ProtocolError { .. }))
        ));
    }

    #[tokio::test]
    async fn test_handle_text_queues_response() {
        let ctx = context(Some("default")).await;
        let (mut dispatcher, mut queue) = dispatcher(&ctx);

        dispatcher
            .handle_text(r#"{"id": 4, "method": "resumeConsumer"}"#)
            .await;

        let data = data_of(queue.try_recv(), 4);
        assert_eq!(data["code"], 4);
    }

    #[tokio::test]
    async fn test_disconnect_updates_connection_count() {
        let ctx = context(Some("default")).await;
        let (mut dispatcher, _queue) = dispatcher(&ctx);
        assert_eq!(ctx.metrics.connection_count(), 1);

        dispatcher
            .dispatch(Some(1), "getRtpCapabilities", json!({}))
            .await;
        dispatcher.disconnect().await;
        dispatcher.disconnect().await;

        assert_eq!(ctx.metrics.connection_count(), 0);
        assert_eq!(dispatcher.session().phase(), ConnectionPhase::Disconnected);
    }
}
