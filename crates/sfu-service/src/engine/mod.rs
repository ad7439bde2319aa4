//! Media engine boundary.
//!
//! The SFU delegates ICE, DTLS-SRTP and RTP forwarding to a media engine
//! running one or more worker processes. The orchestration layer only ever
//! talks to the engine through [`MediaEngine`]:
//!
//! ```text
//! Worker (process, PID)
//! └── Router (fixed codec set)
//!     ├── WebRtcTransport (send)
//!     │   └── Producer
//!     └── WebRtcTransport (recv)
//!         └── Consumer -> Producer
//! ```
//!
//! Every call may suspend while the worker processes it. Worker deaths and
//! DTLS closures arrive asynchronously as [`EngineEvent`]s on a broadcast
//! channel obtained from [`MediaEngine::subscribe`].
//!
//! # Modules
//!
//! - [`codecs`] - Capability negotiation shared by engine implementations
//! - [`local`] - In-process engine ([`LocalEngine`])

pub mod codecs;
pub mod local;

pub use local::LocalEngine;

use async_trait::async_trait;
use common::media::{
    DtlsParameters, IceCandidate, IceParameters, MediaKind, RtpCapabilities, RtpCodecCapability,
    RtpParameters,
};
use common::types::{ConsumerId, ProducerId, RouterId, TransportId, WorkerId};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors reported by the media engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Parameters failed validation.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// No router codec matches the requested codec.
    #[error("unsupported codec: {0}")]
    UnsupportedCodec(String),

    /// The entity is not in a state that allows the call.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Entity unknown to the worker.
    #[error("{0} not found")]
    NotFound(String),

    /// Worker is gone (crashed or closed).
    #[error("worker {0} is closed")]
    WorkerClosed(String),

    /// Router is gone.
    #[error("router {0} is closed")]
    RouterClosed(String),

    /// Every port in the worker's RTC range is in use.
    #[error("no free RTC port in range {min}-{max}")]
    PortsExhausted { min: u16, max: u16 },

    /// Worker could not be started.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
}

/// Settings used to spawn a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Lowest RTC port the worker may bind.
    pub rtc_min_port: u16,
    /// Highest RTC port the worker may bind.
    pub rtc_max_port: u16,
}

/// A spawned worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub pid: u32,
}

/// Address of a router: the worker that hosts it plus its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouterRef {
    pub worker_id: WorkerId,
    pub router_id: RouterId,
}

/// A created router and its (immutable) capabilities.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterInfo {
    pub id: RouterId,
    pub worker_id: WorkerId,
    pub rtp_capabilities: RtpCapabilities,
}

impl RouterInfo {
    #[must_use]
    pub fn router_ref(&self) -> RouterRef {
        RouterRef {
            worker_id: self.worker_id,
            router_id: self.id,
        }
    }
}

/// Listen address for WebRTC transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenIp {
    pub ip: String,
    /// Public address advertised in ICE candidates instead of `ip`.
    pub announced_ip: Option<String>,
}

/// Listen policy for WebRTC transports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebRtcTransportOptions {
    pub listen_ips: Vec<ListenIp>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

/// A created WebRTC transport, serialized as the `createTransport` params.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// A created producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub kind: MediaKind,
}

/// A created consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

/// Asynchronous notifications from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A worker exited unexpectedly. Every router it hosted is gone.
    WorkerDied { worker_id: WorkerId, reason: String },
    /// A transport's DTLS state moved to `closed`.
    TransportDtlsClosed {
        router_id: RouterId,
        transport_id: TransportId,
    },
}

/// Control-plane API of the media engine.
///
/// Close calls are idempotent from the caller's point of view: closing an
/// entity the engine already dropped returns `NotFound`, which callers treat
/// as success.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Subscribe to worker-death and DTLS-closure events.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    async fn spawn_worker(&self, settings: &WorkerSettings) -> Result<WorkerInfo, EngineError>;

    /// Close a worker gracefully. No `WorkerDied` event is emitted.
    async fn close_worker(&self, worker_id: WorkerId) -> Result<(), EngineError>;

    async fn create_router(
        &self,
        worker_id: WorkerId,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<RouterInfo, EngineError>;

    async fn close_router(&self, router: RouterRef) -> Result<(), EngineError>;

    async fn create_webrtc_transport(
        &self,
        router: RouterRef,
        options: &WebRtcTransportOptions,
    ) -> Result<TransportInfo, EngineError>;

    /// Provide the remote DTLS parameters so the handshake can complete.
    async fn connect_transport(
        &self,
        router: RouterRef,
        transport_id: TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError>;

    async fn close_transport(
        &self,
        router: RouterRef,
        transport_id: TransportId,
    ) -> Result<(), EngineError>;

    async fn produce(
        &self,
        router: RouterRef,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerInfo, EngineError>;

    async fn close_producer(
        &self,
        router: RouterRef,
        producer_id: ProducerId,
    ) -> Result<(), EngineError>;

    /// Whether a consumer with `rtp_capabilities` could receive the producer.
    async fn can_consume(
        &self,
        router: RouterRef,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError>;

    async fn consume(
        &self,
        router: RouterRef,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo, EngineError>;

    async fn resume_consumer(
        &self,
        router: RouterRef,
        consumer_id: ConsumerId,
    ) -> Result<(), EngineError>;

    async fn close_consumer(
        &self,
        router: RouterRef,
        consumer_id: ConsumerId,
    ) -> Result<(), EngineError>;
}
