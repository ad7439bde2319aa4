//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply uses `tokio::sync::oneshot`.

use super::room::RoomHandle;
use crate::engine::{EngineError, RouterInfo, TransportInfo, WorkerInfo};
use crate::errors::SfuError;
use crate::signaling::connection::ConnectionHandle;
use common::media::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters};
use common::types::{ConnectionId, ConsumerId, ProducerId, RouterId, TransportId, WorkerId};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::oneshot;

/// Messages sent to `RoomRegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Return the room for `room_id`, creating it (and its router) on first use.
    GetOrCreateRoom {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomHandle, SfuError>>,
    },

    /// Return an existing room.
    GetRoom {
        room_id: String,
        respond_to: oneshot::Sender<Result<RoomHandle, SfuError>>,
    },

    /// A room's last peer left. `router_id` identifies the room instance so a
    /// stale notice cannot release a replacement room.
    RoomIdle { room_id: String, router_id: RouterId },

    /// Outcome of a background worker pick and router creation.
    RoomCreated {
        room_id: String,
        result: Result<RouterInfo, SfuError>,
    },

    /// Outcome of a background idle close. `closed` is false when a peer
    /// joined before the room could close.
    RoomReleased {
        room_id: String,
        router_id: RouterId,
        closed: bool,
    },

    /// Get registry status (for health checks and tests).
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Stop accepting rooms and close every room.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },
}

/// Messages sent to a `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    Join {
        peer_id: ConnectionId,
        connection: ConnectionHandle,
        respond_to: oneshot::Sender<Result<JoinResult, SfuError>>,
    },

    /// Peer leaves (explicit leave or disconnect). Cascades a close of
    /// everything the peer owns.
    Leave {
        peer_id: ConnectionId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    GetRtpCapabilities {
        respond_to: oneshot::Sender<RtpCapabilities>,
    },

    CreateTransport {
        peer_id: ConnectionId,
        direction: TransportDirection,
        respond_to: oneshot::Sender<Result<TransportInfo, SfuError>>,
    },

    ConnectTransport {
        peer_id: ConnectionId,
        /// Explicit transport; defaults to the peer's transport for `direction`.
        transport_id: Option<TransportId>,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    Produce {
        peer_id: ConnectionId,
        transport_id: Option<TransportId>,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: oneshot::Sender<Result<ProducerId, SfuError>>,
    },

    Consume {
        peer_id: ConnectionId,
        transport_id: Option<TransportId>,
        /// Defaults to the most recent producer of another peer.
        producer_id: Option<ProducerId>,
        rtp_capabilities: RtpCapabilities,
        respond_to: oneshot::Sender<Result<ConsumeOutcome, SfuError>>,
    },

    ResumeConsumer {
        peer_id: ConnectionId,
        /// Defaults to the peer's most recent consumer.
        consumer_id: Option<ConsumerId>,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    CloseProducer {
        peer_id: ConnectionId,
        producer_id: ProducerId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    CloseConsumer {
        peer_id: ConnectionId,
        consumer_id: ConsumerId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    CloseTransport {
        peer_id: ConnectionId,
        transport_id: TransportId,
        respond_to: oneshot::Sender<Result<(), SfuError>>,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },

    /// Close the router and stop if no peer is left. Replies whether the
    /// room closed.
    CloseIfEmpty { respond_to: oneshot::Sender<bool> },

    /// The router is gone (worker died) or must go (shutdown). Peers are
    /// notified and the actor stops.
    RouterClosed { reason: CloseReason },
}

/// Messages sent to `WorkerPoolActor`.
#[derive(Debug)]
pub enum PoolMessage {
    /// Pick a live worker to host a new router.
    AcquireWorker {
        respond_to: oneshot::Sender<Result<WorkerId, SfuError>>,
    },

    GetStatus {
        respond_to: oneshot::Sender<PoolStatus>,
    },

    /// Outcome of a background respawn of `replaced`.
    RespawnFinished {
        replaced: WorkerId,
        result: Result<WorkerInfo, EngineError>,
    },
}

/// Events the pool reports to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// Every router on the worker is gone.
    WorkerDied { worker_id: WorkerId, reason: String },
    /// A replacement worker joined the pool.
    WorkerRespawned { replaced: WorkerId, worker_id: WorkerId },
    /// The pool gave up; the process exits after the grace period.
    Fatal { reason: String },
}

/// Direction of a WebRTC transport, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportDirection {
    /// Client sends media (producers live here).
    Send,
    /// Client receives media (consumers live here).
    Recv,
}

impl TransportDirection {
    /// Map the `sender` flag of a `createTransport` request.
    #[must_use]
    pub const fn from_sender(sender: bool) -> Self {
        if sender {
            TransportDirection::Send
        } else {
            TransportDirection::Recv
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

impl fmt::Display for TransportDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a room's router went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CloseReason {
    /// The hosting worker died; the router no longer exists.
    WorkerDied,
    /// The service is shutting down.
    Shutdown,
}

impl CloseReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            CloseReason::WorkerDied => "worker-died",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

/// Result of joining a room.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResult {
    pub room_id: String,
    pub rtp_capabilities: RtpCapabilities,
    /// Producers of the other peers, oldest first.
    pub producers: Vec<ProducerSummary>,
}

/// A producer as announced to other peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: ProducerId,
    pub peer_id: ConnectionId,
    pub kind: MediaKind,
}

/// Parameters a client needs to receive a producer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Outcome of a consume request.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsumeOutcome {
    /// Consumer created (paused).
    Created(ConsumerParams),
    /// The consumer's capabilities cannot receive the producer. No consumer
    /// was created.
    Rejected { reason: String },
}

/// Snapshot of one peer inside a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub peer_id: ConnectionId,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

/// Snapshot of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomState {
    pub room_id: String,
    pub router_id: RouterId,
    pub worker_id: WorkerId,
    pub peers: Vec<PeerSummary>,
    pub transport_count: usize,
    pub producer_count: usize,
    pub consumer_count: usize,
}

/// Registry status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    pub room_count: usize,
    /// Rooms (and therefore routers) created since startup.
    pub rooms_created: u64,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}

/// Health of a pooled worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerHealth {
    Alive,
    /// Died; a replacement is being spawned.
    Respawning,
    /// Died and will not be replaced.
    Dead,
}

/// Status of one pooled worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub worker_id: WorkerId,
    pub pid: u32,
    pub health: WorkerHealth,
    /// Respawns of this pool slot so far.
    pub respawns: u32,
}

/// Pool status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub workers: Vec<WorkerStatus>,
    pub is_fatal: bool,
}

impl PoolStatus {
    /// Number of workers currently able to host routers.
    #[must_use]
    pub fn alive_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.health == WorkerHealth::Alive)
            .count()
    }
}
