//! In-process media engine.
//!
//! Every worker is an actor task that owns its routers, transports,
//! producers and consumers, and processes requests one at a time in arrival
//! order. No RTP is forwarded: the engine performs the control-plane
//! bookkeeping (capability negotiation, ICE/DTLS parameters, RTC port
//! allocation, close cascades) that a native worker would.
//!
//! Worker death is observed by a monitor task per worker. A worker task that
//! ends while still registered died unexpectedly and produces
//! [`EngineEvent::WorkerDied`]; [`MediaEngine::close_worker`] unregisters
//! first so a graceful close is silent.

use super::codecs;
use super::{
    ConsumerInfo, EngineError, EngineEvent, MediaEngine, ProducerInfo, RouterInfo, RouterRef,
    TransportInfo, WebRtcTransportOptions, WorkerInfo, WorkerSettings,
};
use async_trait::async_trait;
use common::media::{
    DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaKind,
    RtpCapabilities, RtpCodecCapability, RtpParameters, TransportProtocol,
};
use common::types::{ConsumerId, ProducerId, RouterId, TransportId, WorkerId};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Request channel depth per worker.
const WORKER_CHANNEL_BUFFER: usize = 256;

/// Engine event channel depth.
const EVENT_CHANNEL_BUFFER: usize = 256;

/// First synthetic pid handed to a worker.
const FIRST_WORKER_PID: u32 = 10_000;

/// ICE candidate priorities for the preferred and the other protocol.
const PREFERRED_CANDIDATE_PRIORITY: u32 = 1_076_302_079;
const SECONDARY_CANDIDATE_PRIORITY: u32 = 1_076_276_479;

const DTLS_HASH_ALGORITHMS: [&str; 5] = ["sha-1", "sha-224", "sha-256", "sha-384", "sha-512"];

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Control messages processed by a worker task.
enum WorkerRequest {
    CreateRouter {
        media_codecs: Vec<RtpCodecCapability>,
        respond_to: Reply<RouterInfo>,
    },
    CloseRouter {
        router_id: RouterId,
        respond_to: Reply<()>,
    },
    CreateTransport {
        router_id: RouterId,
        options: WebRtcTransportOptions,
        respond_to: Reply<TransportInfo>,
    },
    ConnectTransport {
        router_id: RouterId,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
        respond_to: Reply<()>,
    },
    CloseTransport {
        router_id: RouterId,
        transport_id: TransportId,
        respond_to: Reply<()>,
    },
    Produce {
        router_id: RouterId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        respond_to: Reply<ProducerInfo>,
    },
    CloseProducer {
        router_id: RouterId,
        producer_id: ProducerId,
        respond_to: Reply<()>,
    },
    CanConsume {
        router_id: RouterId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        respond_to: Reply<bool>,
    },
    Consume {
        router_id: RouterId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
        respond_to: Reply<ConsumerInfo>,
    },
    ResumeConsumer {
        router_id: RouterId,
        consumer_id: ConsumerId,
        respond_to: Reply<()>,
    },
    CloseConsumer {
        router_id: RouterId,
        consumer_id: ConsumerId,
        respond_to: Reply<()>,
    },
    CloseDtls {
        router_id: RouterId,
        transport_id: TransportId,
        respond_to: Reply<()>,
    },
}

#[derive(Clone)]
struct LocalWorkerHandle {
    sender: mpsc::Sender<WorkerRequest>,
    cancel_token: CancellationToken,
}

/// In-process [`MediaEngine`].
#[derive(Clone)]
pub struct LocalEngine {
    workers: Arc<RwLock<HashMap<WorkerId, LocalWorkerHandle>>>,
    events: broadcast::Sender<EngineEvent>,
    /// Workers run in-process; each still gets a distinct pid for logs.
    next_pid: Arc<AtomicU32>,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEngine {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_BUFFER);
        Self {
            workers: Arc::new(RwLock::new(HashMap::new())),
            events,
            next_pid: Arc::new(AtomicU32::new(FIRST_WORKER_PID)),
        }
    }

    /// Number of live workers.
    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Terminate a worker abruptly, as if its process crashed.
    ///
    /// Returns `false` if the worker is unknown.
    pub async fn kill_worker(&self, worker_id: WorkerId) -> bool {
        let workers = self.workers.read().await;
        match workers.get(&worker_id) {
            Some(handle) => {
                warn!(target: "sfu.engine.local", worker_id = %worker_id, "Killing worker");
                handle.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drive a transport's DTLS state to `closed`, as when the remote peer
    /// sends a close alert.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker, router or transport is unknown.
    pub async fn close_dtls(
        &self,
        router: RouterRef,
        transport_id: TransportId,
    ) -> Result<(), EngineError> {
        self.request(router.worker_id, |respond_to| WorkerRequest::CloseDtls {
            router_id: router.router_id,
            transport_id,
            respond_to,
        })
        .await
    }

    async fn request<T>(
        &self,
        worker_id: WorkerId,
        make_request: impl FnOnce(Reply<T>) -> WorkerRequest,
    ) -> Result<T, EngineError> {
        let sender = {
            let workers = self.workers.read().await;
            workers
                .get(&worker_id)
                .map(|handle| handle.sender.clone())
                .ok_or_else(|| EngineError::WorkerClosed(worker_id.to_string()))?
        };

        let (tx, rx) = oneshot::channel();
        sender
            .send(make_request(tx))
            .await
            .map_err(|_| EngineError::WorkerClosed(worker_id.to_string()))?;
        rx.await
            .map_err(|_| EngineError::WorkerClosed(worker_id.to_string()))?
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn spawn_worker(&self, settings: &WorkerSettings) -> Result<WorkerInfo, EngineError> {
        if settings.rtc_min_port > settings.rtc_max_port {
            return Err(EngineError::Spawn(format!(
                "rtc_min_port {} is greater than rtc_max_port {}",
                settings.rtc_min_port, settings.rtc_max_port
            )));
        }

        let worker_id = WorkerId::new();
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(WORKER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let worker = LocalWorker {
            id: worker_id,
            settings: settings.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            events: self.events.clone(),
            routers: HashMap::new(),
            used_ports: HashSet::new(),
            fingerprint: random_fingerprint(),
        };

        self.workers.write().await.insert(
            worker_id,
            LocalWorkerHandle {
                sender,
                cancel_token,
            },
        );

        let task = tokio::spawn(worker.run());

        let workers = Arc::clone(&self.workers);
        let events = self.events.clone();
        tokio::spawn(async move {
            let reason = match task.await {
                Ok(()) => "worker exited".to_string(),
                Err(e) => format!("worker panicked: {e}"),
            };
            if workers.write().await.remove(&worker_id).is_some() {
                warn!(
                    target: "sfu.engine.local",
                    worker_id = %worker_id,
                    reason = %reason,
                    "Worker died unexpectedly"
                );
                let _ = events.send(EngineEvent::WorkerDied { worker_id, reason });
            }
        });

        info!(
            target: "sfu.engine.local",
            worker_id = %worker_id,
            pid = pid,
            rtc_min_port = settings.rtc_min_port,
            rtc_max_port = settings.rtc_max_port,
            "Worker spawned"
        );

        Ok(WorkerInfo { id: worker_id, pid })
    }

    async fn close_worker(&self, worker_id: WorkerId) -> Result<(), EngineError> {
        let handle = self
            .workers
            .write()
            .await
            .remove(&worker_id)
            .ok_or_else(|| EngineError::NotFound(format!("worker {worker_id}")))?;
        handle.cancel_token.cancel();
        info!(target: "sfu.engine.local", worker_id = %worker_id, "Worker closed");
        Ok(())
    }

    async fn create_router(
        &self,
        worker_id: WorkerId,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<RouterInfo, EngineError> {
        let media_codecs = media_codecs.to_vec();
        self.request(worker_id, |respond_to| WorkerRequest::CreateRouter {
            media_codecs,
            respond_to,
        })
        .await
    }

    async fn close_router(&self, router: RouterRef) -> Result<(), EngineError> {
        self.request(router.worker_id, |respond_to| WorkerRequest::CloseRouter {
            router_id: router.router_id,
            respond_to,
        })
        .await
    }

    async fn create_webrtc_transport(
        &self,
        router: RouterRef,
        options: &WebRtcTransportOptions,
    ) -> Result<TransportInfo, EngineError> {
        let options = options.clone();
        self.request(router.worker_id, |respond_to| WorkerRequest::CreateTransport {
            router_id: router.router_id,
            options,
            respond_to,
        })
        .await
    }

    async fn connect_transport(
        &self,
        router: RouterRef,
        transport_id: TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        let dtls_parameters = dtls_parameters.clone();
        self.request(router.worker_id, |respond_to| WorkerRequest::ConnectTransport {
            router_id: router.router_id,
            transport_id,
            dtls_parameters,
            respond_to,
        })
        .await
    }

    async fn close_transport(
        &self,
        router: RouterRef,
        transport_id: TransportId,
    ) -> Result<(), EngineError> {
        self.request(router.worker_id, |respond_to| WorkerRequest::CloseTransport {
            router_id: router.router_id,
            transport_id,
            respond_to,
        })
        .await
    }

    async fn produce(
        &self,
        router: RouterRef,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerInfo, EngineError> {
        let rtp_parameters = rtp_parameters.clone();
        self.request(router.worker_id, |respond_to| WorkerRequest::Produce {
            router_id: router.router_id,
            transport_id,
            kind,
            rtp_parameters,
            respond_to,
        })
        .await
    }

    async fn close_producer(
        &self,
        router: RouterRef,
        producer_id: ProducerId,
    ) -> Result<(), EngineError> {
        self.request(router.worker_id, |respond_to| WorkerRequest::CloseProducer {
            router_id: router.router_id,
            producer_id,
            respond_to,
        })
        .await
    }

    async fn can_consume(
        &self,
        router: RouterRef,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError> {
        let rtp_capabilities = rtp_capabilities.clone();
        self.request(router.worker_id, |respond_to| WorkerRequest::CanConsume {
            router_id: router.router_id,
            producer_id,
            rtp_capabilities,
            respond_to,
        })
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
        let rtp_capabilities = rtp_capabilities.clone();
        self.request(router.worker_id, |respond_to| WorkerRequest::Consume {
            router_id: router.router_id,
            transport_id,
            producer_id,
            rtp_capabilities,
            paused,
            respond_to,
        })
        .await
    }

    async fn resume_consumer(
        &self,
        router: RouterRef,
        consumer_id: ConsumerId,
    ) -> Result<(), EngineError> {
        self.request(router.worker_id, |respond_to| WorkerRequest::ResumeConsumer {
            router_id: router.router_id,
            consumer_id,
            respond_to,
        })
        .await
    }

    async fn close_consumer(
        &self,
        router: RouterRef,
        consumer_id: ConsumerId,
    ) -> Result<(), EngineError> {
        self.request(router.worker_id, |respond_to| WorkerRequest::CloseConsumer {
            router_id: router.router_id,
            consumer_id,
            respond_to,
        })
        .await
    }
}

struct LocalTransport {
    ports: Vec<u16>,
    connected: bool,
    next_mid: u32,
    producers: HashSet<ProducerId>,
    consumers: HashSet<ConsumerId>,
}

struct LocalProducer {
    transport_id: TransportId,
    consumable: RtpParameters,
    consumers: HashSet<ConsumerId>,
}

struct LocalConsumer {
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

struct LocalRouter {
    rtp_capabilities: RtpCapabilities,
    transports: HashMap<TransportId, LocalTransport>,
    producers: HashMap<ProducerId, LocalProducer>,
    consumers: HashMap<ConsumerId, LocalConsumer>,
}

impl LocalRouter {
    fn remove_consumer(&mut self, consumer_id: ConsumerId) -> bool {
        let Some(consumer) = self.consumers.remove(&consumer_id) else {
            return false;
        };
        if let Some(producer) = self.producers.get_mut(&consumer.producer_id) {
            producer.consumers.remove(&consumer_id);
        }
        if let Some(transport) = self.transports.get_mut(&consumer.transport_id) {
            transport.consumers.remove(&consumer_id);
        }
        true
    }

    fn remove_producer(&mut self, producer_id: ProducerId) -> bool {
        let Some(producer) = self.producers.remove(&producer_id) else {
            return false;
        };
        for consumer_id in producer.consumers {
            self.remove_consumer(consumer_id);
        }
        if let Some(transport) = self.transports.get_mut(&producer.transport_id) {
            transport.producers.remove(&producer_id);
        }
        true
    }

    /// Remove a transport with everything created on it, returning its ports.
    fn remove_transport(&mut self, transport_id: TransportId) -> Option<Vec<u16>> {
        let transport = self.transports.remove(&transport_id)?;
        for consumer_id in transport.consumers {
            self.remove_consumer(consumer_id);
        }
        for producer_id in transport.producers {
            self.remove_producer(producer_id);
        }
        Some(transport.ports)
    }
}

struct LocalWorker {
    id: WorkerId,
    settings: WorkerSettings,
    receiver: mpsc::Receiver<WorkerRequest>,
    cancel_token: CancellationToken,
    events: broadcast::Sender<EngineEvent>,
    routers: HashMap<RouterId, LocalRouter>,
    used_ports: HashSet<u16>,
    fingerprint: DtlsFingerprint,
}

impl LocalWorker {
    async fn run(mut self) {
        debug!(target: "sfu.engine.local", worker_id = %self.id, "Worker loop started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => break,
                request = self.receiver.recv() => {
                    match request {
                        Some(request) => self.handle_request(request),
                        None => break,
                    }
                }
            }
        }

        debug!(
            target: "sfu.engine.local",
            worker_id = %self.id,
            routers = self.routers.len(),
            "Worker loop stopped"
        );
    }

    fn handle_request(&mut self, request: WorkerRequest) {
        match request {
            WorkerRequest::CreateRouter {
                media_codecs,
                respond_to,
            } => {
                let _ = respond_to.send(self.create_router(&media_codecs));
            }
            WorkerRequest::CloseRouter {
                router_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.close_router(router_id));
            }
            WorkerRequest::CreateTransport {
                router_id,
                options,
                respond_to,
            } => {
                let _ = respond_to.send(self.create_transport(router_id, &options));
            }
            WorkerRequest::ConnectTransport {
                router_id,
                transport_id,
                dtls_parameters,
                respond_to,
            } => {
                let result = self.connect_transport(router_id, transport_id, &dtls_parameters);
                let _ = respond_to.send(result);
            }
            WorkerRequest::CloseTransport {
                router_id,
                transport_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.close_transport(router_id, transport_id));
            }
            WorkerRequest::Produce {
                router_id,
                transport_id,
                kind,
                rtp_parameters,
                respond_to,
            } => {
                let result = self.produce(router_id, transport_id, kind, &rtp_parameters);
                let _ = respond_to.send(result);
            }
            WorkerRequest::CloseProducer {
                router_id,
                producer_id,
                respond_to,
            } => {
                let result = self.router_mut(router_id).and_then(|router| {
                    router
                        .remove_producer(producer_id)
                        .then_some(())
                        .ok_or_else(|| EngineError::NotFound(format!("producer {producer_id}")))
                });
                let _ = respond_to.send(result);
            }
            WorkerRequest::CanConsume {
                router_id,
                producer_id,
                rtp_capabilities,
                respond_to,
            } => {
                let result = self.router_mut(router_id).map(|router| {
                    router.producers.get(&producer_id).is_some_and(|producer| {
                        codecs::can_consume(&producer.consumable, &rtp_capabilities)
                    })
                });
                let _ = respond_to.send(result);
            }
            WorkerRequest::Consume {
                router_id,
                transport_id,
                producer_id,
                rtp_capabilities,
                paused,
                respond_to,
            } => {
                let result =
                    self.consume(router_id, transport_id, producer_id, &rtp_capabilities, paused);
                let _ = respond_to.send(result);
            }
            WorkerRequest::ResumeConsumer {
                router_id,
                consumer_id,
                respond_to,
            } => {
                let result = self.router_mut(router_id).and_then(|router| {
                    let consumer = router
                        .consumers
                        .get_mut(&consumer_id)
                        .ok_or_else(|| EngineError::NotFound(format!("consumer {consumer_id}")))?;
                    if std::mem::replace(&mut consumer.paused, false) {
                        debug!(target: "sfu.engine.local", consumer_id = %consumer_id, "Consumer resumed");
                    }
                    Ok(())
                });
                let _ = respond_to.send(result);
            }
            WorkerRequest::CloseConsumer {
                router_id,
                consumer_id,
                respond_to,
            } => {
                let result = self.router_mut(router_id).and_then(|router| {
                    router
                        .remove_consumer(consumer_id)
                        .then_some(())
                        .ok_or_else(|| EngineError::NotFound(format!("consumer {consumer_id}")))
                });
                let _ = respond_to.send(result);
            }
            WorkerRequest::CloseDtls {
                router_id,
                transport_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.close_dtls(router_id, transport_id));
            }
        }
    }

    fn router_mut(&mut self, router_id: RouterId) -> Result<&mut LocalRouter, EngineError> {
        self.routers
            .get_mut(&router_id)
            .ok_or_else(|| EngineError::RouterClosed(router_id.to_string()))
    }

    fn create_router(
        &mut self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<RouterInfo, EngineError> {
        let rtp_capabilities = codecs::router_rtp_capabilities(media_codecs)?;
        let router_id = RouterId::new();

        self.routers.insert(
            router_id,
            LocalRouter {
                rtp_capabilities: rtp_capabilities.clone(),
                transports: HashMap::new(),
                producers: HashMap::new(),
                consumers: HashMap::new(),
            },
        );

        debug!(target: "sfu.engine.local", worker_id = %self.id, router_id = %router_id, "Router created");

        Ok(RouterInfo {
            id: router_id,
            worker_id: self.id,
            rtp_capabilities,
        })
    }

    fn close_router(&mut self, router_id: RouterId) -> Result<(), EngineError> {
        let router = self
            .routers
            .remove(&router_id)
            .ok_or_else(|| EngineError::NotFound(format!("router {router_id}")))?;

        for port in router.transports.values().flat_map(|t| t.ports.iter()) {
            self.used_ports.remove(port);
        }

        debug!(target: "sfu.engine.local", worker_id = %self.id, router_id = %router_id, "Router closed");
        Ok(())
    }

    fn allocate_ports(&mut self, count: usize) -> Result<Vec<u16>, EngineError> {
        let mut ports = Vec::with_capacity(count);
        for port in self.settings.rtc_min_port..=self.settings.rtc_max_port {
            if ports.len() == count {
                break;
            }
            if !self.used_ports.contains(&port) {
                ports.push(port);
            }
        }

        if ports.len() < count {
            return Err(EngineError::PortsExhausted {
                min: self.settings.rtc_min_port,
                max: self.settings.rtc_max_port,
            });
        }

        self.used_ports.extend(ports.iter().copied());
        Ok(ports)
    }

    fn create_transport(
        &mut self,
        router_id: RouterId,
        options: &WebRtcTransportOptions,
    ) -> Result<TransportInfo, EngineError> {
        if !self.routers.contains_key(&router_id) {
            return Err(EngineError::RouterClosed(router_id.to_string()));
        }
        if options.listen_ips.is_empty() {
            return Err(EngineError::InvalidParameters(
                "no listen IPs configured".to_string(),
            ));
        }
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::InvalidParameters(
                "UDP and TCP are both disabled".to_string(),
            ));
        }

        let protocols: Vec<TransportProtocol> = [
            (options.enable_udp, TransportProtocol::Udp),
            (options.enable_tcp, TransportProtocol::Tcp),
        ]
        .into_iter()
        .filter_map(|(enabled, protocol)| enabled.then_some(protocol))
        .collect();

        let ports = self.allocate_ports(options.listen_ips.len() * protocols.len())?;

        let mut ice_candidates = Vec::with_capacity(ports.len());
        let mut port_iter = ports.iter().copied();
        for listen_ip in &options.listen_ips {
            let ip = listen_ip
                .announced_ip
                .clone()
                .unwrap_or_else(|| listen_ip.ip.clone());
            for protocol in &protocols {
                let Some(port) = port_iter.next() else {
                    break;
                };
                let preferred = (*protocol == TransportProtocol::Udp) == options.prefer_udp;
                ice_candidates.push(IceCandidate {
                    foundation: match protocol {
                        TransportProtocol::Udp => "udpcandidate".to_string(),
                        TransportProtocol::Tcp => "tcpcandidate".to_string(),
                    },
                    priority: if preferred {
                        PREFERRED_CANDIDATE_PRIORITY
                    } else {
                        SECONDARY_CANDIDATE_PRIORITY
                    },
                    ip: ip.clone(),
                    protocol: *protocol,
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: (*protocol == TransportProtocol::Tcp).then(|| "passive".to_string()),
                });
            }
        }

        let transport_id = TransportId::new();
        let info = TransportInfo {
            id: transport_id,
            ice_parameters: random_ice_parameters(),
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![self.fingerprint.clone()],
            },
        };

        let router = self.router_mut(router_id)?;
        router.transports.insert(
            transport_id,
            LocalTransport {
                ports,
                connected: false,
                next_mid: 0,
                producers: HashSet::new(),
                consumers: HashSet::new(),
            },
        );

        debug!(
            target: "sfu.engine.local",
            router_id = %router_id,
            transport_id = %transport_id,
            "WebRTC transport created"
        );

        Ok(info)
    }

    fn connect_transport(
        &mut self,
        router_id: RouterId,
        transport_id: TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::InvalidParameters(
                "dtlsParameters has no fingerprints".to_string(),
            ));
        }
        if let Some(fingerprint) = dtls_parameters
            .fingerprints
            .iter()
            .find(|f| !DTLS_HASH_ALGORITHMS.contains(&f.algorithm.as_str()))
        {
            return Err(EngineError::InvalidParameters(format!(
                "unsupported fingerprint algorithm {}",
                fingerprint.algorithm
            )));
        }

        let transport = self
            .router_mut(router_id)?
            .transports
            .get_mut(&transport_id)
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))?;

        if transport.connected {
            return Err(EngineError::InvalidState(
                "connect() already called".to_string(),
            ));
        }
        transport.connected = true;
        Ok(())
    }

    fn close_transport(
        &mut self,
        router_id: RouterId,
        transport_id: TransportId,
    ) -> Result<(), EngineError> {
        let router = self
            .routers
            .get_mut(&router_id)
            .ok_or_else(|| EngineError::RouterClosed(router_id.to_string()))?;
        let ports = router
            .remove_transport(transport_id)
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))?;
        for port in ports {
            self.used_ports.remove(&port);
        }
        Ok(())
    }

    fn produce(
        &mut self,
        router_id: RouterId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerInfo, EngineError> {
        let router = self.router_mut(router_id)?;
        if !router.transports.contains_key(&transport_id) {
            return Err(EngineError::NotFound(format!("transport {transport_id}")));
        }

        let consumable =
            codecs::consumable_rtp_parameters(kind, rtp_parameters, &router.rtp_capabilities)?;

        let producer_id = ProducerId::new();
        router.producers.insert(
            producer_id,
            LocalProducer {
                transport_id,
                consumable,
                consumers: HashSet::new(),
            },
        );
        if let Some(transport) = router.transports.get_mut(&transport_id) {
            transport.producers.insert(producer_id);
        }

        Ok(ProducerInfo {
            id: producer_id,
            kind,
        })
    }

    fn consume(
        &mut self,
        router_id: RouterId,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo, EngineError> {
        let router = self.router_mut(router_id)?;

        let producer = router
            .producers
            .get(&producer_id)
            .ok_or_else(|| EngineError::NotFound(format!("producer {producer_id}")))?;
        if !codecs::can_consume(&producer.consumable, rtp_capabilities) {
            return Err(EngineError::UnsupportedCodec(
                "cannot consume producer with the given capabilities".to_string(),
            ));
        }

        let kind = producer
            .consumable
            .codecs
            .first()
            .and_then(|codec| MediaKind::from_mime_type(&codec.mime_type))
            .ok_or_else(|| EngineError::InvalidState("producer has no codecs".to_string()))?;

        let transport = router
            .transports
            .get_mut(&transport_id)
            .ok_or_else(|| EngineError::NotFound(format!("transport {transport_id}")))?;
        let mid = transport.next_mid.to_string();

        let (ssrc, rtx_ssrc) = random_ssrcs();
        let rtp_parameters = codecs::consumer_rtp_parameters(
            &producer.consumable,
            rtp_capabilities,
            &mid,
            ssrc,
            rtx_ssrc,
        )?;

        transport.next_mid += 1;
        let consumer_id = ConsumerId::new();
        transport.consumers.insert(consumer_id);

        if let Some(producer) = router.producers.get_mut(&producer_id) {
            producer.consumers.insert(consumer_id);
        }
        router.consumers.insert(
            consumer_id,
            LocalConsumer {
                transport_id,
                producer_id,
                paused,
            },
        );

        Ok(ConsumerInfo {
            id: consumer_id,
            producer_id,
            kind,
            rtp_parameters,
            paused,
        })
    }

    fn close_dtls(
        &mut self,
        router_id: RouterId,
        transport_id: TransportId,
    ) -> Result<(), EngineError> {
        let router = self.router_mut(router_id)?;
        if !router.transports.contains_key(&transport_id) {
            return Err(EngineError::NotFound(format!("transport {transport_id}")));
        }
        let _ = self.events.send(EngineEvent::TransportDtlsClosed {
            router_id,
            transport_id,
        });
        Ok(())
    }
}

fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_ice_parameters() -> IceParameters {
    IceParameters {
        username_fragment: random_string(16),
        password: random_string(32),
        ice_lite: true,
    }
}

fn random_ssrcs() -> (u32, u32) {
    let mut rng = rand::thread_rng();
    let ssrc = rng.gen_range(100_000_000..900_000_000);
    (ssrc, ssrc + 1)
}

/// SHA-256 style fingerprint of a per-worker certificate.
fn random_fingerprint() -> DtlsFingerprint {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    let value = bytes
        .iter()
        .map(|byte| hex::encode_upper([*byte]))
        .collect::<Vec<_>>()
        .join(":");
    DtlsFingerprint {
        algorithm: "sha-256".to_string(),
        value,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::engine::ListenIp;
    use common::media::{RtcpParameters, RtpCodecParameters, RtpEncodingParameters};
    use std::time::Duration;

    fn settings(min: u16, max: u16) -> WorkerSettings {
        WorkerSettings {
            rtc_min_port: min,
            rtc_max_port: max,
        }
    }

    fn options(enable_tcp: bool) -> WebRtcTransportOptions {
        WebRtcTransportOptions {
            listen_ips: vec![ListenIp {
                ip: "0.0.0.0".to_string(),
                announced_ip: Some("203.0.113.10".to_string()),
            }],
            enable_udp: true,
            enable_tcp,
            prefer_udp: true,
        }
    }

    fn client_dtls() -> DtlsParameters {
        DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB:CC".to_string(),
            }],
        }
    }

    fn vp8_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: serde_json::Map::new(),
                rtcp_feedback: Vec::new(),
            }],
            header_extensions: Vec::new(),
            encodings: vec![RtpEncodingParameters {
                ssrc: Some(1111),
                ..RtpEncodingParameters::default()
            }],
            rtcp: RtcpParameters::default(),
        }
    }

    async fn router(engine: &LocalEngine, worker: &WorkerInfo) -> RouterInfo {
        engine
            .create_router(worker.id, &codecs::default_media_codecs())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_transport_parameters() {
        let engine = LocalEngine::new();
        let worker = engine.spawn_worker(&settings(2000, 2020)).await.unwrap();
        let router = router(&engine, &worker).await;

        let transport = engine
            .create_webrtc_transport(router.router_ref(), &options(true))
            .await
            .unwrap();

        assert_eq!(transport.ice_parameters.username_fragment.len(), 16);
        assert_eq!(transport.ice_parameters.password.len(), 32);
        assert_eq!(transport.ice_candidates.len(), 2);
        assert!(transport
            .ice_candidates
            .iter()
            .all(|c| c.ip == "203.0.113.10" && (2000..=2020).contains(&c.port)));

        let udp = &transport.ice_candidates[0];
        let tcp = &transport.ice_candidates[1];
        assert_eq!(udp.protocol, TransportProtocol::Udp);
        assert_eq!(tcp.tcp_type.as_deref(), Some("passive"));
        assert!(udp.priority > tcp.priority);

        let fingerprint = &transport.dtls_parameters.fingerprints[0];
        assert_eq!(fingerprint.algorithm, "sha-256");
        assert_eq!(fingerprint.value.split(':').count(), 32);
    }

    #[tokio::test]
    async fn test_ports_are_exhausted_and_released() {
        let engine = LocalEngine::new();
        let worker = engine.spawn_worker(&settings(2000, 2001)).await.unwrap();
        let router = router(&engine, &worker).await;
        let router_ref = router.router_ref();

        let first = engine
            .create_webrtc_transport(router_ref, &options(false))
            .await
            .unwrap();
        engine
            .create_webrtc_transport(router_ref, &options(false))
            .await
            .unwrap();

        let result = engine
            .create_webrtc_transport(router_ref, &options(false))
            .await;
        assert_eq!(
            result.unwrap_err(),
            EngineError::PortsExhausted {
                min: 2000,
                max: 2001
            }
        );

        engine.close_transport(router_ref, first.id).await.unwrap();
        engine
            .create_webrtc_transport(router_ref, &options(false))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_transport_options_validated() {
        let engine = LocalEngine::new();
        let worker = engine.spawn_worker(&settings(2000, 2020)).await.unwrap();
        let router = router(&engine, &worker).await;

        let mut no_protocols = options(false);
        no_protocols.enable_udp = false;
        let result = engine
            .create_webrtc_transport(router.router_ref(), &no_protocols)
            .await;
        assert!(matches!(result, Err(EngineError::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_connect_twice_is_invalid_state() {
        let engine = LocalEngine::new();
        let worker = engine.spawn_worker(&settings(2000, 2020)).await.unwrap();
        let router = router(&engine, &worker).await;
        let transport = engine
            .create_webrtc_transport(router.router_ref(), &options(true))
            .await
            .unwrap();

        engine
            .connect_transport(router.router_ref(), transport.id, &client_dtls())
            .await
            .unwrap();
        let second = engine
            .connect_transport(router.router_ref(), transport.id, &client_dtls())
            .await;
        assert!(matches!(second, Err(EngineError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_produce_consume_and_cascade() {
        let engine = LocalEngine::new();
        let worker = engine.spawn_worker(&settings(2000, 2020)).await.unwrap();
        let router = router(&engine, &worker).await;
        let router_ref = router.router_ref();

        let send = engine
            .create_webrtc_transport(router_ref, &options(true))
            .await
            .unwrap();
        let recv = engine
            .create_webrtc_transport(router_ref, &options(true))
            .await
            .unwrap();

        let producer = engine
            .produce(router_ref, send.id, MediaKind::Video, &vp8_parameters())
            .await
            .unwrap();

        let caps = router.rtp_capabilities.clone();
        assert!(engine
            .can_consume(router_ref, producer.id, &caps)
            .await
            .unwrap());

        let consumer = engine
            .consume(router_ref, recv.id, producer.id, &caps, true)
            .await
            .unwrap();
        assert!(consumer.paused);
        assert_eq!(consumer.kind, MediaKind::Video);
        assert_eq!(consumer.rtp_parameters.mid.as_deref(), Some("0"));

        let second = engine
            .consume(router_ref, recv.id, producer.id, &caps, true)
            .await
            .unwrap();
        assert_eq!(second.rtp_parameters.mid.as_deref(), Some("1"));

        engine
            .resume_consumer(router_ref, consumer.id)
            .await
            .unwrap();
        engine
            .resume_consumer(router_ref, consumer.id)
            .await
            .unwrap();

        // Closing the send transport takes the producer and its consumers with it
        engine.close_transport(router_ref, send.id).await.unwrap();
        assert!(!engine
            .can_consume(router_ref, producer.id, &caps)
            .await
            .unwrap());
        let result = engine.close_consumer(router_ref, consumer.id).await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_produce_unsupported_codec() {
        let engine = LocalEngine::new();
        let worker = engine.spawn_worker(&settings(2000, 2020)).await.unwrap();
        let router = router(&engine, &worker).await;
        let send = engine
            .create_webrtc_transport(router.router_ref(), &options(true))
            .await
            .unwrap();

        let mut params = vp8_parameters();
        params.codecs[0].mime_type = "video/H264".to_string();
        let result = engine
            .produce(router.router_ref(), send.id, MediaKind::Video, &params)
            .await;
        assert!(matches!(result, Err(EngineError::UnsupportedCodec(_))));
    }

    #[tokio::test]
    async fn test_workers_get_distinct_pids() {
        let engine = LocalEngine::new();
        let first = engine.spawn_worker(&settings(2000, 2010)).await.unwrap();
        let second = engine.spawn_worker(&settings(2000, 2010)).await.unwrap();

        assert_ne!(first.pid, second.pid);
    }

    #[tokio::test]
    async fn test_kill_worker_emits_worker_died() {
        let engine = LocalEngine::new();
        let mut events = engine.subscribe();
        let worker = engine.spawn_worker(&settings(2000, 2020)).await.unwrap();
        let router = router(&engine, &worker).await;

        assert!(engine.kill_worker(worker.id).await);

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("event timed out")
            .unwrap();
        assert!(matches!(
            event,
            EngineEvent::WorkerDied { worker_id, .. } if worker_id == worker.id
        ));
        assert_eq!(engine.worker_count().await, 0);

        let result = engine
            .create_webrtc_transport(router.router_ref(), &options(true))
            .await;
        assert!(matches!(result, Err(EngineError::WorkerClosed(_))));
    }

    #[tokio::test]
    async fn test_close_worker_is_silent() {
        let engine = LocalEngine::new();
        let mut events = engine.subscribe();
        let worker = engine.spawn_worker(&settings(2000, 2020)).await.unwrap();

        engine.close_worker(worker.id).await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
        assert!(result.is_err(), "graceful close must not emit WorkerDied");
        assert_eq!(engine.worker_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_dtls_emits_event() {
        let engine = LocalEngine::new();
        let mut events = engine.subscribe();
        let worker = engine.spawn_worker(&settings(2000, 2020)).await.unwrap();
        let router = router(&engine, &worker).await;
        let transport = engine
            .create_webrtc_transport(router.router_ref(), &options(true))
            .await
            .unwrap();

        engine
            .close_dtls(router.router_ref(), transport.id)
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            EngineEvent::TransportDtlsClosed {
                router_id: router.id,
                transport_id: transport.id,
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_port_range_fails_spawn() {
        let engine = LocalEngine::new();
        let result = engine.spawn_worker(&settings(3000, 2000)).await;
        assert!(matches!(result, Err(EngineError::Spawn(_))));
    }
}
