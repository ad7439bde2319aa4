//! `RoomActor` - per-room actor that owns the room's entity graph.
//!
//! Each `RoomActor`:
//! - Owns one router (created by the registry on the room's first join)
//! - Tracks peers and the transports, producers and consumers they own
//! - Runs the transport lifecycle: create, connect, produce, consume,
//!   resume, close
//! - Notifies peers of new producers and of closures that affect them
//!
//! # Ownership
//!
//! Entities live in flat maps keyed by id. Back-references are ids: a
//! transport knows its owner, a producer knows the consumers reading from
//! it. Closing cascades downward:
//!
//! ```text
//! Peer ──► Transport ──► Producer ──► Consumer (of any peer)
//!                   └──► Consumer
//! ```
//!
//! # Serialization
//!
//! Messages are handled one at a time and engine calls are awaited inline,
//! so no two mutations of the room's entities are ever in flight together.
//! Rooms are independent actors.

use crate::engine::{
    EngineError, EngineEvent, MediaEngine, RouterInfo, RouterRef, TransportInfo,
    WebRtcTransportOptions,
};
use crate::errors::SfuError;
use crate::observability::metrics as prom;
use crate::signaling::connection::ConnectionHandle;
use crate::signaling::protocol::Notification;

use super::messages::{
    CloseReason, ConsumeOutcome, ConsumerParams, JoinResult, PeerSummary, ProducerSummary,
    RegistryMessage, RoomMessage, RoomState, TransportDirection,
};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};

use common::media::{
    DtlsParameters, MediaKind, RtpCapabilities, RtpCodecCapability, RtpParameters,
};
use common::types::{ConnectionId, ConsumerId, ProducerId, RouterId, TransportId, WorkerId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Settings shared by every room.
#[derive(Debug, Clone)]
pub struct RoomSettings {
    /// Codecs each room's router is created with.
    pub media_codecs: Vec<RtpCodecCapability>,
    /// Listen policy for WebRTC transports.
    pub transport_options: WebRtcTransportOptions,
    /// Peers allowed in one room.
    pub max_peers: usize,
}

/// Handle to a `RoomActor`.
#[derive(Debug, Clone)]
pub struct RoomHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    worker_died: CancellationToken,
    room_id: String,
    router_id: RouterId,
    worker_id: WorkerId,
}

impl RoomHandle {
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    #[must_use]
    pub fn router_id(&self) -> RouterId {
        self.router_id
    }

    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Whether the room actor has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Add a peer. Joining twice returns the current room view again.
    pub async fn join(
        &self,
        peer_id: ConnectionId,
        connection: ConnectionHandle,
    ) -> Result<JoinResult, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::Join {
            peer_id,
            connection,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| self.unavailable())?
    }

    /// Remove a peer and everything it owns.
    pub async fn leave(&self, peer_id: ConnectionId) -> Result<(), SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::Leave {
            peer_id,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| self.unavailable())?
    }

    /// The router's RTP capabilities.
    pub async fn rtp_capabilities(&self) -> Result<RtpCapabilities, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::GetRtpCapabilities { respond_to: tx })
            .await?;
        rx.await.map_err(|_| self.unavailable())
    }

    pub async fn create_transport(
        &self,
        peer_id: ConnectionId,
        direction: TransportDirection,
    ) -> Result<TransportInfo, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::CreateTransport {
            peer_id,
            direction,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| self.unavailable())?
    }

    pub async fn connect_transport(
        &self,
        peer_id: ConnectionId,
        transport_id: Option<TransportId>,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::ConnectTransport {
            peer_id,
            transport_id,
            direction,
            dtls_parameters,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| self.unavailable())?
    }

    pub async fn produce(
        &self,
        peer_id: ConnectionId,
        transport_id: Option<TransportId>,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::Produce {
            peer_id,
            transport_id,
            kind,
            rtp_parameters,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| self.unavailable())?
    }

    pub async fn consume(
        &self,
        peer_id: ConnectionId,
        transport_id: Option<TransportId>,
        producer_id: Option<ProducerId>,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumeOutcome, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::Consume {
            peer_id,
            transport_id,
            producer_id,
            rtp_capabilities,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| self.unavailable())?
    }

    pub async fn resume_consumer(
        &self,
        peer_id: ConnectionId,
        consumer_id: Option<ConsumerId>,
    ) -> Result<(), SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::ResumeConsumer {
            peer_id,
            consumer_id,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| self.unavailable())?
    }

    pub async fn close_producer(
        &self,
        peer_id: ConnectionId,
        producer_id: ProducerId,
    ) -> Result<(), SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::CloseProducer {
            peer_id,
            producer_id,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| self.unavailable())?
    }

    pub async fn close_consumer(
        &self,
        peer_id: ConnectionId,
        consumer_id: ConsumerId,
    ) -> Result<(), SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::CloseConsumer {
            peer_id,
            consumer_id,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| self.unavailable())?
    }

    pub async fn close_transport(
        &self,
        peer_id: ConnectionId,
        transport_id: TransportId,
    ) -> Result<(), SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::CloseTransport {
            peer_id,
            transport_id,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| self.unavailable())?
    }

    pub async fn get_state(&self) -> Result<RoomState, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::GetState { respond_to: tx }).await?;
        rx.await.map_err(|_| self.unavailable())
    }

    /// Close the room if it has no peers. Returns whether it closed.
    pub async fn close_if_empty(&self) -> Result<bool, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send(RoomMessage::CloseIfEmpty { respond_to: tx })
            .await?;
        rx.await.map_err(|_| self.unavailable())
    }

    /// Tell the room its router is gone. Does not wait for mailbox space;
    /// returns `false` if the message could not be queued.
    pub fn router_closed(&self, reason: CloseReason) -> bool {
        self.sender
            .try_send(RoomMessage::RouterClosed { reason })
            .is_ok()
    }

    /// Tell the room its worker died. Unlike [`Self::router_closed`] this
    /// cannot fail, so use it when the mailbox may be full.
    pub fn worker_died(&self) {
        self.worker_died.cancel();
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn send(&self, message: RoomMessage) -> Result<(), SfuError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| self.unavailable())
    }

    fn unavailable(&self) -> SfuError {
        SfuError::RoomUnavailable(format!("room {} is closed", self.room_id))
    }
}

/// Transport connection state. A closed transport is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransportState {
    New,
    Connecting,
    Connected,
}

struct Peer {
    connection: ConnectionHandle,
    /// Owned transports in creation order.
    transports: Vec<TransportId>,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

struct Transport {
    owner: ConnectionId,
    direction: TransportDirection,
    state: TransportState,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

struct Producer {
    owner: ConnectionId,
    transport_id: TransportId,
    kind: MediaKind,
    seq: u64,
    /// Consumers reading from this producer.
    consumers: HashSet<ConsumerId>,
}

struct Consumer {
    owner: ConnectionId,
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
    seq: u64,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    router: RouterInfo,
    engine: Arc<dyn MediaEngine>,
    settings: Arc<RoomSettings>,
    /// Registry mailbox for idle notices. Weak so rooms never keep the
    /// registry alive.
    registry: mpsc::WeakSender<RegistryMessage>,
    receiver: mpsc::Receiver<RoomMessage>,
    engine_events: broadcast::Receiver<EngineEvent>,
    engine_events_open: bool,
    cancel_token: CancellationToken,
    /// Not a child of `cancel_token`; shutdown must not read as a worker death.
    worker_died: CancellationToken,
    peers: HashMap<ConnectionId, Peer>,
    transports: HashMap<TransportId, Transport>,
    producers: HashMap<ProducerId, Producer>,
    consumers: HashMap<ConsumerId, Consumer>,
    next_seq: u64,
    closed: bool,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a room actor for an already created router.
    #[must_use]
    pub fn spawn(
        room_id: String,
        router: RouterInfo,
        engine: Arc<dyn MediaEngine>,
        settings: Arc<RoomSettings>,
        registry: mpsc::WeakSender<RegistryMessage>,
        metrics: Arc<ActorMetrics>,
        cancel_token: CancellationToken,
    ) -> (RoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);
        let engine_events = engine.subscribe();
        let worker_died = CancellationToken::new();

        let handle = RoomHandle {
            sender,
            cancel_token: cancel_token.clone(),
            worker_died: worker_died.clone(),
            room_id: room_id.clone(),
            router_id: router.id,
            worker_id: router.worker_id,
        };

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Room, &room_id),
            room_id,
            router,
            engine,
            settings,
            registry,
            receiver,
            engine_events,
            engine_events_open: true,
            cancel_token,
            worker_died,
            peers: HashMap::new(),
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            next_seq: 0,
            closed: false,
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.room", fields(room_id = %self.room_id, router_id = %self.router.id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            router_id = %self.router.id,
            worker_id = %self.router.worker_id,
            "RoomActor started"
        );

        while !self.closed {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.close_router(CloseReason::Shutdown).await;
                }

                () = self.worker_died.cancelled() => {
                    self.close_router(CloseReason::WorkerDied).await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sfu.actor.room",
                                room_id = %self.room_id,
                                "RoomActor channel closed, exiting"
                            );
                            self.close_router(CloseReason::Shutdown).await;
                        }
                    }
                }

                event = self.engine_events.recv(), if self.engine_events_open => {
                    match event {
                        Ok(event) => self.handle_engine_event(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(
                                target: "sfu.actor.room",
                                room_id = %self.room_id,
                                skipped = skipped,
                                "Engine event stream lagged"
                            );
                        }
                        Err(RecvError::Closed) => {
                            self.engine_events_open = false;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                peer_id,
                connection,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_join(peer_id, connection));
            }

            RoomMessage::Leave {
                peer_id,
                respond_to,
            } => {
                self.remove_peer(peer_id, "peer_left").await;
                let _ = respond_to.send(Ok(()));
            }

            RoomMessage::GetRtpCapabilities { respond_to } => {
                let _ = respond_to.send(self.router.rtp_capabilities.clone());
            }

            RoomMessage::CreateTransport {
                peer_id,
                direction,
                respond_to,
            } => {
                let result = self.handle_create_transport(peer_id, direction).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ConnectTransport {
                peer_id,
                transport_id,
                direction,
                dtls_parameters,
                respond_to,
            } => {
                let result = self
                    .handle_connect_transport(peer_id, transport_id, direction, &dtls_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Produce {
                peer_id,
                transport_id,
                kind,
                rtp_parameters,
                respond_to,
            } => {
                let result = self
                    .handle_produce(peer_id, transport_id, kind, &rtp_parameters)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::Consume {
                peer_id,
                transport_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            } => {
                let result = self
                    .handle_consume(peer_id, transport_id, producer_id, &rtp_capabilities)
                    .await;
                let _ = respond_to.send(result);
            }

            RoomMessage::ResumeConsumer {
                peer_id,
                consumer_id,
                respond_to,
            } => {
                let result = self.handle_resume_consumer(peer_id, consumer_id).await;
                let _ = respond_to.send(result);
            }

            RoomMessage::CloseProducer {
                peer_id,
                producer_id,
                respond_to,
            } => {
                let result = match self.producers.get(&producer_id) {
                    Some(producer) if producer.owner == peer_id => {
                        self.destroy_producer(producer_id, "closed").await;
                        Ok(())
                    }
                    _ => Err(SfuError::ProducerNotFound(producer_id.to_string())),
                };
                let _ = respond_to.send(result);
            }

            RoomMessage::CloseConsumer {
                peer_id,
                consumer_id,
                respond_to,
            } => {
                let result = match self.consumers.get(&consumer_id) {
                    Some(consumer) if consumer.owner == peer_id => {
                        self.destroy_consumer(consumer_id, "closed").await;
                        Ok(())
                    }
                    _ => Err(SfuError::ConsumerNotFound(consumer_id.to_string())),
                };
                let _ = respond_to.send(result);
            }

            RoomMessage::CloseTransport {
                peer_id,
                transport_id,
                respond_to,
            } => {
                let result = match self.transports.get(&transport_id) {
                    Some(transport) if transport.owner == peer_id => {
                        self.destroy_transport(transport_id, "closed").await;
                        Ok(())
                    }
                    _ => Err(SfuError::TransportNotFound(transport_id.to_string())),
                };
                let _ = respond_to.send(result);
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.get_state());
            }

            RoomMessage::CloseIfEmpty { respond_to } => {
                let closed = if self.peers.is_empty() {
                    self.close_router(CloseReason::Shutdown).await;
                    true
                } else {
                    false
                };
                let _ = respond_to.send(closed);
            }

            RoomMessage::RouterClosed { reason } => {
                self.close_router(reason).await;
            }
        }
    }

    fn handle_join(
        &mut self,
        peer_id: ConnectionId,
        connection: ConnectionHandle,
    ) -> Result<JoinResult, SfuError> {
        if !self.peers.contains_key(&peer_id) {
            if self.peers.len() >= self.settings.max_peers {
                warn!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    max_peers = self.settings.max_peers,
                    "Room at capacity, rejecting join"
                );
                return Err(SfuError::RoomCapacityExceeded(self.room_id.clone()));
            }

            self.peers.insert(
                peer_id,
                Peer {
                    connection,
                    transports: Vec::new(),
                    producers: HashSet::new(),
                    consumers: HashSet::new(),
                },
            );

            info!(
                target: "sfu.actor.room",
                room_id = %self.room_id,
                peer_id = %peer_id,
                peer_count = self.peers.len(),
                "Peer joined"
            );
        }

        let mut producers: Vec<(&ProducerId, &Producer)> = self
            .producers
            .iter()
            .filter(|(_, p)| p.owner != peer_id)
            .collect();
        producers.sort_by_key(|(_, p)| p.seq);

        Ok(JoinResult {
            room_id: self.room_id.clone(),
            rtp_capabilities: self.router.rtp_capabilities.clone(),
            producers: producers
                .into_iter()
                .map(|(id, p)| ProducerSummary {
                    producer_id: *id,
                    peer_id: p.owner,
                    kind: p.kind,
                })
                .collect(),
        })
    }

    async fn handle_create_transport(
        &mut self,
        peer_id: ConnectionId,
        direction: TransportDirection,
    ) -> Result<TransportInfo, SfuError> {
        let peer = self
            .peers
            .get(&peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))?;

        if self.peer_transport(peer, direction).is_some() {
            return Err(SfuError::Conflict(format!(
                "{direction} transport already exists"
            )));
        }

        let info = self
            .engine
            .create_webrtc_transport(self.router_ref(), &self.settings.transport_options)
            .await?;

        self.transports.insert(
            info.id,
            Transport {
                owner: peer_id,
                direction,
                state: TransportState::New,
                producers: HashSet::new(),
                consumers: HashSet::new(),
            },
        );
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.transports.push(info.id);
        }
        prom::record_entity_created("transport");

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            transport_id = %info.id,
            direction = %direction,
            "Transport created"
        );

        Ok(info)
    }

    async fn handle_connect_transport(
        &mut self,
        peer_id: ConnectionId,
        transport_id: Option<TransportId>,
        direction: TransportDirection,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), SfuError> {
        let transport_id = self.resolve_transport(peer_id, transport_id, direction)?;
        self.set_transport_state(transport_id, TransportState::Connecting)?;

        match self
            .engine
            .connect_transport(self.router_ref(), transport_id, dtls_parameters)
            .await
        {
            Ok(()) => {
                self.set_transport_state(transport_id, TransportState::Connected)?;
                debug!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    peer_id = %peer_id,
                    transport_id = %transport_id,
                    "Transport connected"
                );
                Ok(())
            }
            Err(e) => {
                let _ = self.set_transport_state(transport_id, TransportState::New);
                Err(e.into())
            }
        }
    }

    async fn handle_produce(
        &mut self,
        peer_id: ConnectionId,
        transport_id: Option<TransportId>,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerId, SfuError> {
        let transport_id =
            self.resolve_transport(peer_id, transport_id, TransportDirection::Send)?;

        let info = self
            .engine
            .produce(self.router_ref(), transport_id, kind, rtp_parameters)
            .await?;

        let seq = self.next_seq();
        self.producers.insert(
            info.id,
            Producer {
                owner: peer_id,
                transport_id,
                kind: info.kind,
                seq,
                consumers: HashSet::new(),
            },
        );
        if let Some(transport) = self.transports.get_mut(&transport_id) {
            transport.producers.insert(info.id);
        }
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.producers.insert(info.id);
        }
        prom::record_entity_created("producer");

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %info.id,
            kind = info.kind.as_str(),
            "Producer created"
        );

        for (other_id, other) in &self.peers {
            if *other_id != peer_id {
                other.connection.notify(Notification::NewProducer {
                    producer_id: info.id,
                    peer_id,
                    kind: info.kind,
                });
            }
        }

        Ok(info.id)
    }

    async fn handle_consume(
        &mut self,
        peer_id: ConnectionId,
        transport_id: Option<TransportId>,
        producer_id: Option<ProducerId>,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumeOutcome, SfuError> {
        let transport_id =
            self.resolve_transport(peer_id, transport_id, TransportDirection::Recv)?;

        let producer_id = match producer_id {
            Some(id) if self.producers.contains_key(&id) => id,
            Some(id) => return Err(SfuError::ProducerNotFound(id.to_string())),
            None => self
                .producers
                .iter()
                .filter(|(_, p)| p.owner != peer_id)
                .max_by_key(|(_, p)| p.seq)
                .map(|(id, _)| *id)
                .ok_or_else(|| SfuError::ProducerNotFound("no producer to consume".to_string()))?,
        };

        let router = self.router_ref();
        if !self
            .engine
            .can_consume(router, producer_id, rtp_capabilities)
            .await?
        {
            prom::record_consume_rejected();
            info!(
                target: "sfu.actor.room",
                room_id = %self.room_id,
                peer_id = %peer_id,
                producer_id = %producer_id,
                "Consume rejected, capabilities incompatible"
            );
            return Ok(ConsumeOutcome::Rejected {
                reason: format!("cannot consume producer {producer_id} with the given RTP capabilities"),
            });
        }

        let info = self
            .engine
            .consume(router, transport_id, producer_id, rtp_capabilities, true)
            .await?;

        let seq = self.next_seq();
        self.consumers.insert(
            info.id,
            Consumer {
                owner: peer_id,
                transport_id,
                producer_id,
                paused: info.paused,
                seq,
            },
        );
        if let Some(producer) = self.producers.get_mut(&producer_id) {
            producer.consumers.insert(info.id);
        }
        if let Some(transport) = self.transports.get_mut(&transport_id) {
            transport.consumers.insert(info.id);
        }
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.consumers.insert(info.id);
        }
        prom::record_entity_created("consumer");

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            consumer_id = %info.id,
            producer_id = %producer_id,
            "Consumer created"
        );

        Ok(ConsumeOutcome::Created(ConsumerParams {
            id: info.id,
            producer_id,
            kind: info.kind,
            rtp_parameters: info.rtp_parameters,
        }))
    }

    async fn handle_resume_consumer(
        &mut self,
        peer_id: ConnectionId,
        consumer_id: Option<ConsumerId>,
    ) -> Result<(), SfuError> {
        let peer = self
            .peers
            .get(&peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))?;

        let consumer_id = match consumer_id {
            Some(id) => id,
            None => peer
                .consumers
                .iter()
                .filter_map(|id| self.consumers.get(id).map(|c| (id, c.seq)))
                .max_by_key(|(_, seq)| *seq)
                .map(|(id, _)| *id)
                .ok_or_else(|| SfuError::ConsumerNotFound("no consumer to resume".to_string()))?,
        };

        let paused = match self.consumers.get(&consumer_id) {
            Some(consumer) if consumer.owner == peer_id => consumer.paused,
            _ => return Err(SfuError::ConsumerNotFound(consumer_id.to_string())),
        };

        if !paused {
            debug!(
                target: "sfu.actor.room",
                consumer_id = %consumer_id,
                "Consumer already resumed"
            );
            return Ok(());
        }

        self.engine
            .resume_consumer(self.router_ref(), consumer_id)
            .await?;

        if let Some(consumer) = self.consumers.get_mut(&consumer_id) {
            consumer.paused = false;
        }
        Ok(())
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            // Also reported by the registry; whichever arrives first closes
            EngineEvent::WorkerDied { worker_id, reason } if worker_id == self.router.worker_id => {
                warn!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    worker_id = %worker_id,
                    reason = %reason,
                    "Hosting worker died"
                );
                self.close_router(CloseReason::WorkerDied).await;
            }
            EngineEvent::WorkerDied { .. } => {}
            EngineEvent::TransportDtlsClosed {
                router_id,
                transport_id,
            } => self.handle_dtls_closed(router_id, transport_id).await,
        }
    }

    async fn handle_dtls_closed(&mut self, router_id: RouterId, transport_id: TransportId) {
        if router_id != self.router.id {
            return;
        }
        let Some(owner) = self.transports.get(&transport_id).map(|t| t.owner) else {
            return;
        };

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            transport_id = %transport_id,
            "Transport DTLS closed"
        );

        if let Some(peer) = self.peers.get(&owner) {
            peer.connection.notify(Notification::TransportClosed {
                transport_id,
                reason: "dtls closed".to_string(),
            });
        }
        self.destroy_transport(transport_id, "dtls_closed").await;
    }

    /// Close a consumer. Unknown ids are ignored.
    async fn destroy_consumer(&mut self, consumer_id: ConsumerId, reason: &'static str) {
        let Some(consumer) = self.consumers.remove(&consumer_id) else {
            return;
        };

        if let Some(producer) = self.producers.get_mut(&consumer.producer_id) {
            producer.consumers.remove(&consumer_id);
        }
        if let Some(transport) = self.transports.get_mut(&consumer.transport_id) {
            transport.consumers.remove(&consumer_id);
        }
        if let Some(peer) = self.peers.get_mut(&consumer.owner) {
            peer.consumers.remove(&consumer_id);
        }

        let result = self
            .engine
            .close_consumer(self.router_ref(), consumer_id)
            .await;
        self.log_close_result("consumer", &consumer_id.to_string(), result);
        prom::record_entity_closed("consumer", reason);
    }

    /// Close a producer and every consumer reading from it. Each consumer's
    /// owner is told with `producer-closed`.
    async fn destroy_producer(&mut self, producer_id: ProducerId, reason: &'static str) {
        let Some(producer) = self.producers.remove(&producer_id) else {
            return;
        };

        if let Some(transport) = self.transports.get_mut(&producer.transport_id) {
            transport.producers.remove(&producer_id);
        }
        if let Some(peer) = self.peers.get_mut(&producer.owner) {
            peer.producers.remove(&producer_id);
        }

        for consumer_id in producer.consumers {
            if let Some(owner) = self.consumers.get(&consumer_id).map(|c| c.owner) {
                if let Some(peer) = self.peers.get(&owner) {
                    peer.connection.notify(Notification::ProducerClosed {
                        consumer_id,
                        producer_id,
                    });
                }
            }
            self.destroy_consumer(consumer_id, "producer_closed").await;
        }

        let result = self
            .engine
            .close_producer(self.router_ref(), producer_id)
            .await;
        self.log_close_result("producer", &producer_id.to_string(), result);
        prom::record_entity_closed("producer", reason);

        debug!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            producer_id = %producer_id,
            reason = reason,
            "Producer closed"
        );
    }

    /// Close a transport after the consumers and producers on it.
    async fn destroy_transport(&mut self, transport_id: TransportId, reason: &'static str) {
        let Some(transport) = self.transports.remove(&transport_id) else {
            return;
        };

        if let Some(peer) = self.peers.get_mut(&transport.owner) {
            peer.transports.retain(|id| *id != transport_id);
        }

        for consumer_id in transport.consumers {
            self.destroy_consumer(consumer_id, reason).await;
        }
        for producer_id in transport.producers {
            self.destroy_producer(producer_id, reason).await;
        }

        let result = self
            .engine
            .close_transport(self.router_ref(), transport_id)
            .await;
        self.log_close_result("transport", &transport_id.to_string(), result);
        prom::record_entity_closed("transport", reason);
    }

    /// Remove a peer, closing consumers, then producers, then transports.
    async fn remove_peer(&mut self, peer_id: ConnectionId, reason: &'static str) {
        let Some(peer) = self.peers.remove(&peer_id) else {
            return;
        };

        for consumer_id in peer.consumers {
            self.destroy_consumer(consumer_id, reason).await;
        }
        for producer_id in peer.producers {
            self.destroy_producer(producer_id, reason).await;
        }
        for transport_id in peer.transports {
            self.destroy_transport(transport_id, reason).await;
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            peer_count = self.peers.len(),
            "Peer left"
        );

        if self.peers.is_empty() {
            self.notify_idle();
        }
    }

    /// Ask the registry to release this room. A full registry mailbox
    /// delays the notice; it is never dropped.
    fn notify_idle(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        match registry.try_send(RegistryMessage::RoomIdle {
            room_id: self.room_id.clone(),
            router_id: self.router.id,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                debug!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    "Registry mailbox full, delivering idle notice in background"
                );
                tokio::spawn(async move {
                    let _ = registry.send(message).await;
                });
            }
            Err(TrySendError::Closed(_)) => {
                debug!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    "Registry stopped, idle notice discarded"
                );
            }
        }
    }

    /// Tear the room down and stop the actor.
    async fn close_router(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;

        for peer in self.peers.values() {
            peer.connection.notify(Notification::RouterClosed {
                room_id: self.room_id.clone(),
                reason,
            });
        }

        // A dead worker took the router with it
        if reason == CloseReason::Shutdown {
            let result = self.engine.close_router(self.router_ref()).await;
            self.log_close_result("router", &self.router.id.to_string(), result);
        }

        let label = match reason {
            CloseReason::WorkerDied => "worker_died",
            CloseReason::Shutdown => "router_closed",
        };
        for _ in self.consumers.drain() {
            prom::record_entity_closed("consumer", label);
        }
        for _ in self.producers.drain() {
            prom::record_entity_closed("producer", label);
        }
        for _ in self.transports.drain() {
            prom::record_entity_closed("transport", label);
        }

        info!(
            target: "sfu.actor.room",
            room_id = %self.room_id,
            router_id = %self.router.id,
            reason = reason.as_str(),
            peers = self.peers.len(),
            "Room closed"
        );
        self.peers.clear();
    }

    fn get_state(&self) -> RoomState {
        let mut peers: Vec<PeerSummary> = self
            .peers
            .iter()
            .map(|(id, peer)| PeerSummary {
                peer_id: *id,
                transports: peer.transports.len(),
                producers: peer.producers.len(),
                consumers: peer.consumers.len(),
            })
            .collect();
        peers.sort_by_key(|p| p.peer_id);

        RoomState {
            room_id: self.room_id.clone(),
            router_id: self.router.id,
            worker_id: self.router.worker_id,
            peers,
            transport_count: self.transports.len(),
            producer_count: self.producers.len(),
            consumer_count: self.consumers.len(),
        }
    }

    fn router_ref(&self) -> RouterRef {
        self.router.router_ref()
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn peer_transport(&self, peer: &Peer, direction: TransportDirection) -> Option<TransportId> {
        peer.transports
            .iter()
            .copied()
            .find(|id| {
                self.transports
                    .get(id)
                    .is_some_and(|t| t.direction == direction)
            })
    }

    /// The caller's transport for `direction`, or the explicitly named one
    /// if the caller owns it.
    fn resolve_transport(
        &self,
        peer_id: ConnectionId,
        transport_id: Option<TransportId>,
        direction: TransportDirection,
    ) -> Result<TransportId, SfuError> {
        let peer = self
            .peers
            .get(&peer_id)
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))?;

        match transport_id {
            Some(id) => match self.transports.get(&id) {
                Some(transport) if transport.owner == peer_id => {
                    if transport.direction == direction {
                        Ok(id)
                    } else {
                        Err(SfuError::InvalidState(format!(
                            "transport is not a {direction} transport"
                        )))
                    }
                }
                _ => Err(SfuError::TransportNotFound(id.to_string())),
            },
            None => self
                .peer_transport(peer, direction)
                .ok_or_else(|| SfuError::TransportNotFound(format!("no {direction} transport"))),
        }
    }

    fn set_transport_state(
        &mut self,
        transport_id: TransportId,
        state: TransportState,
    ) -> Result<(), SfuError> {
        let transport = self
            .transports
            .get_mut(&transport_id)
            .ok_or_else(|| SfuError::TransportNotFound(transport_id.to_string()))?;

        if state == TransportState::Connecting && transport.state == TransportState::Connected {
            return Err(SfuError::InvalidState(
                "transport already connected".to_string(),
            ));
        }
        transport.state = state;
        Ok(())
    }

    fn log_close_result(&self, entity: &'static str, id: &str, result: Result<(), EngineError>) {
        match result {
            Ok(()) => {}
            // Already gone at the engine (cascade or dead worker)
            Err(
                EngineError::NotFound(_) | EngineError::WorkerClosed(_) | EngineError::RouterClosed(_),
            ) => {
                debug!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    entity = entity,
                    id = %id,
                    "Entity already closed at engine"
                );
            }
            Err(e) => {
                warn!(
                    target: "sfu.actor.room",
                    room_id = %self.room_id,
                    entity = entity,
                    id = %id,
                    error = %e,
                    "Failed to close entity at engine"
                );
            }
        }
    }
}
