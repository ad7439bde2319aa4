//! Fault-injecting media engine.
//!
//! `MockEngine` delegates to a real [`LocalEngine`] and records how often
//! each operation was called. Tests can queue failures for an operation
//! or delay it, to drive error paths and in-flight races.
//!
//! # Example
//!
//! ```rust,ignore
//! use sfu_test_utils::MockEngine;
//!
//! let engine = MockEngine::new();
//! engine.fail_next("create_router", EngineError::Spawn("boom".into()));
//! engine.delay("consume", Duration::from_millis(200));
//! assert_eq!(engine.calls("create_router"), 0);
//! ```

use async_trait::async_trait;
use common::media::{DtlsParameters, MediaKind, RtpCapabilities, RtpCodecCapability, RtpParameters};
use common::types::{ConsumerId, ProducerId, TransportId, WorkerId};
use sfu_service::engine::{
    ConsumerInfo, EngineError, EngineEvent, LocalEngine, MediaEngine, ProducerInfo, RouterInfo,
    RouterRef, TransportInfo, WebRtcTransportOptions, WorkerInfo, WorkerSettings,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Default)]
struct MockState {
    calls: HashMap<&'static str, u64>,
    failures: HashMap<&'static str, VecDeque<EngineError>>,
    delays: HashMap<&'static str, Duration>,
}

/// Counting, fault-injecting wrapper around [`LocalEngine`].
#[derive(Clone)]
pub struct MockEngine {
    inner: LocalEngine,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: LocalEngine::new(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// The wrapped engine, for crash and DTLS simulation.
    #[must_use]
    pub fn local(&self) -> &LocalEngine {
        &self.inner
    }

    /// Times `operation` has been called (including injected failures).
    #[must_use]
    pub fn calls(&self, operation: &str) -> u64 {
        let state = self.state.lock().unwrap();
        state.calls.get(operation).copied().unwrap_or(0)
    }

    /// Fail the next call of `operation` with `error`. Failures queue up.
    pub fn fail_next(&self, operation: &'static str, error: EngineError) {
        let mut state = self.state.lock().unwrap();
        state.failures.entry(operation).or_default().push_back(error);
    }

    /// Sleep before every call of `operation`.
    pub fn delay(&self, operation: &'static str, duration: Duration) {
        let mut state = self.state.lock().unwrap();
        state.delays.insert(operation, duration);
    }

    /// Simulate a worker crash.
    pub async fn kill_worker(&self, worker_id: WorkerId) -> bool {
        self.inner.kill_worker(worker_id).await
    }

    /// Simulate the remote peer closing DTLS on a transport.
    ///
    /// # Panics
    ///
    /// Panics if the transport is unknown to the engine.
    pub async fn close_dtls(&self, router: RouterRef, transport_id: TransportId) {
        self.inner
            .close_dtls(router, transport_id)
            .await
            .expect("transport exists in the engine");
    }

    pub async fn worker_count(&self) -> usize {
        self.inner.worker_count().await
    }

    /// Count the call, then apply any injected delay or failure.
    async fn enter(&self, operation: &'static str) -> Result<(), EngineError> {
        let (delay, failure) = {
            let mut state = self.state.lock().unwrap();
            *state.calls.entry(operation).or_insert(0) += 1;
            let failure = state
                .failures
                .get_mut(operation)
                .and_then(VecDeque::pop_front);
            (state.delays.get(operation).copied(), failure)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.subscribe()
    }

    async fn spawn_worker(&self, settings: &WorkerSettings) -> Result<WorkerInfo, EngineError> {
        self.enter("spawn_worker").await?;
        self.inner.spawn_worker(settings).await
    }

    async fn close_worker(&self, worker_id: WorkerId) -> Result<(), EngineError> {
        self.enter("close_worker").await?;
        self.inner.close_worker(worker_id).await
    }

    async fn create_router(
        &self,
        worker_id: WorkerId,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<RouterInfo, EngineError> {
        self.enter("create_router").await?;
        self.inner.create_router(worker_id, media_codecs).await
    }

    async fn close_router(&self, router: RouterRef) -> Result<(), EngineError> {
        self.enter("close_router").await?;
        self.inner.close_router(router).await
    }

    async fn create_webrtc_transport(
        &self,
        router: RouterRef,
        options: &WebRtcTransportOptions,
    ) -> Result<TransportInfo, EngineError> {
        self.enter("create_webrtc_transport").await?;
        self.inner.create_webrtc_transport(router, options).await
    }

    async fn connect_transport(
        &self,
        router: RouterRef,
        transport_id: TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        self.enter("connect_transport").await?;
        self.inner
            .connect_transport(router, transport_id, dtls_parameters)
            .await
    }

    async fn close_transport(
        &self,
        router: RouterRef,
        transport_id: TransportId,
    ) -> Result<(), EngineError> {
        self.enter("close_transport").await?;
        self.inner.close_transport(router, transport_id).await
    }

    async fn produce(
        &self,
        router: RouterRef,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerInfo, EngineError> {
        self.enter("produce").await?;
        self.inner
            .produce(router, transport_id, kind, rtp_parameters)
            .await
    }

    async fn close_producer(
        &self,
        router: RouterRef,
        producer_id: ProducerId,
    ) -> Result<(), EngineError> {
        self.enter("close_producer").await?;
        self.inner.close_producer(router, producer_id).await
    }

    async fn can_consume(
        &self,
        router: RouterRef,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError> {
        self.enter("can_consume").await?;
        self.inner
            .can_consume(router, producer_id, rtp_capabilities)
            .await
    }

    async fn consume(
        &self,
        router: RouterRef,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo, EngineError> {
        self.enter("consume").await?;
        self.inner
            .consume(router, transport_id, producer_id, rtp_capabilities, paused)
            .await
    }

    async fn resume_consumer(
        &self,
        router: RouterRef,
        consumer_id: ConsumerId,
    ) -> Result<(), EngineError> {
        self.enter("resume_consumer").await?;
        self.inner.resume_consumer(router, consumer_id).await
    }

    async fn close_consumer(
        &self,
        router: RouterRef,
        consumer_id: ConsumerId,
    ) -> Result<(), EngineError> {
        self.enter("close_consumer").await?;
        self.inner.close_consumer(router, consumer_id).await
    }
}
