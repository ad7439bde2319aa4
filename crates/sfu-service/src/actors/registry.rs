//! `RoomRegistryActor` - maps room ids to room actors.
//!
//! The registry is the only place rooms are created. The first request for
//! a room id starts a background task that acquires a worker and creates the
//! router; requests that arrive meanwhile wait on that same creation, and
//! the task reports back with `RoomCreated`. At most one router exists per
//! room.
//!
//! The message loop never waits on the pool, the engine or a room actor,
//! so a slow creation or close in one room does not hold up any other.
//!
//! Rooms are released when their last peer leaves (`RoomIdle`, closed in the
//! background and confirmed with `RoomReleased`), when their worker dies
//! (`PoolEvent::WorkerDied`), and on shutdown. Requests for a room that is
//! still closing are answered once the close settles.
//!
//! # Graceful Shutdown
//!
//! On shutdown the registry:
//! 1. Stops accepting new rooms
//! 2. Tells every room its router is closing (peers get `router-closed`)
//! 3. Waits for the room actors to finish, up to the deadline

use super::messages::{CloseReason, PoolEvent, RegistryMessage, RegistryStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use super::pool::WorkerPoolHandle;
use super::room::{RoomActor, RoomHandle, RoomSettings};
use crate::engine::{MediaEngine, RouterInfo};
use crate::errors::SfuError;

use common::types::{RouterId, WorkerId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 1000;

/// How long a released room actor gets to finish.
const ROOM_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline used when the registry is cancelled without `shutdown()`.
const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// SFU instance ID (for logs).
    pub sfu_id: String,
    pub max_rooms: usize,
    pub room_settings: RoomSettings,
}

/// Handle to the `RoomRegistryActor`.
#[derive(Debug, Clone)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Return the room for `room_id`, creating it on first use.
    pub async fn get_or_create_room(&self, room_id: String) -> Result<RoomHandle, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::GetOrCreateRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Return an existing room.
    pub async fn get_room(&self, room_id: String) -> Result<RoomHandle, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::GetRoom {
                room_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn get_status(&self) -> Result<RegistryStatus, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Stop accepting rooms and close every room, waiting up to `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown {
                deadline,
                respond_to: tx,
            })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    /// Cancel the actor (for immediate shutdown).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Internal state for a managed room.
struct ManagedRoom {
    handle: RoomHandle,
    task_handle: JoinHandle<()>,
    /// Room creation timestamp.
    created_at: i64,
    /// An idle close is in flight.
    closing: bool,
}

type RoomReply = oneshot::Sender<Result<RoomHandle, SfuError>>;

/// Callers waiting on a room that is being created, or whose previous
/// instance is still closing.
struct PendingRoom {
    waiters: Vec<RoomReply>,
    /// A creation task is running.
    creating: bool,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    sfu_id: String,
    max_rooms: usize,
    settings: Arc<RoomSettings>,
    engine: Arc<dyn MediaEngine>,
    pool: WorkerPoolHandle,
    receiver: mpsc::Receiver<RegistryMessage>,
    /// Handed to rooms for idle notices.
    weak_sender: mpsc::WeakSender<RegistryMessage>,
    pool_events: mpsc::Receiver<PoolEvent>,
    pool_events_open: bool,
    cancel_token: CancellationToken,
    rooms: HashMap<String, ManagedRoom>,
    pending: HashMap<String, PendingRoom>,
    /// Routers created on these workers are discarded.
    dead_workers: HashSet<WorkerId>,
    accepting_new: bool,
    rooms_created: u64,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl RoomRegistryActor {
    /// Spawn the registry.
    #[must_use]
    pub fn spawn(
        config: RegistryConfig,
        engine: Arc<dyn MediaEngine>,
        pool: WorkerPoolHandle,
        pool_events: mpsc::Receiver<PoolEvent>,
        metrics: Arc<ActorMetrics>,
        cancel_token: CancellationToken,
    ) -> (RoomRegistryHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);

        let actor = Self {
            mailbox: MailboxMonitor::new(ActorType::Registry, &config.sfu_id),
            sfu_id: config.sfu_id,
            max_rooms: config.max_rooms,
            settings: Arc::new(config.room_settings),
            engine,
            pool,
            receiver,
            weak_sender: sender.downgrade(),
            pool_events,
            pool_events_open: true,
            cancel_token: cancel_token.clone(),
            rooms: HashMap::new(),
            pending: HashMap::new(),
            dead_workers: HashSet::new(),
            accepting_new: true,
            rooms_created: 0,
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        (
            RoomRegistryHandle {
                sender,
                cancel_token,
            },
            task_handle,
        )
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "sfu.actor.registry", fields(sfu_id = %self.sfu_id))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            max_rooms = self.max_rooms,
            "RoomRegistryActor started"
        );

        loop {
            // Check for terminated room actors
            self.check_room_health().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        "RoomRegistryActor received cancellation signal"
                    );
                    self.close_all_rooms(DEFAULT_SHUTDOWN_DEADLINE).await;
                    break;
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
                                target: "sfu.actor.registry",
                                sfu_id = %self.sfu_id,
                                "RoomRegistryActor channel closed, exiting"
                            );
                            self.close_all_rooms(DEFAULT_SHUTDOWN_DEADLINE).await;
                            break;
                        }
                    }
                }

                event = self.pool_events.recv(), if self.pool_events_open => {
                    match event {
                        Some(event) => self.handle_pool_event(event),
                        None => self.pool_events_open = false,
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            rooms_created = self.rooms_created,
            messages_processed = self.mailbox.messages_processed(),
            "RoomRegistryActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::GetOrCreateRoom {
                room_id,
                respond_to,
            } => {
                self.get_or_create_room(room_id, respond_to);
            }

            RegistryMessage::GetRoom {
                room_id,
                respond_to,
            } => {
                let result = match self.rooms.get(&room_id) {
                    Some(managed) if !managed.handle.is_closed() => Ok(managed.handle.clone()),
                    _ => Err(SfuError::RoomNotFound(room_id)),
                };
                let _ = respond_to.send(result);
            }

            RegistryMessage::RoomIdle { room_id, router_id } => {
                self.handle_room_idle(room_id, router_id);
            }

            RegistryMessage::RoomCreated { room_id, result } => {
                self.room_created(room_id, result);
            }

            RegistryMessage::RoomReleased {
                room_id,
                router_id,
                closed,
            } => {
                self.room_released(&room_id, router_id, closed);
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            RegistryMessage::Shutdown {
                deadline,
                respond_to,
            } => {
                info!(
                    target: "sfu.actor.registry",
                    sfu_id = %self.sfu_id,
                    room_count = self.rooms.len(),
                    "Initiating graceful shutdown"
                );
                self.close_all_rooms(deadline).await;
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    fn get_or_create_room(&mut self, room_id: String, respond_to: RoomReply) {
        if room_id.trim().is_empty() {
            let _ = respond_to.send(Err(SfuError::InvalidPayload(
                "roomId must not be empty".to_string(),
            )));
            return;
        }

        if let Some(managed) = self.rooms.get(&room_id) {
            if !managed.closing {
                if !managed.handle.is_closed() {
                    let _ = respond_to.send(Ok(managed.handle.clone()));
                    return;
                }
                // Stopped without telling us; replace it
                self.remove_room(&room_id, "stale");
            }
        }

        if let Some(pending) = self.pending.get_mut(&room_id) {
            pending.waiters.push(respond_to);
            return;
        }

        if !self.accepting_new {
            let _ = respond_to.send(Err(SfuError::Draining));
            return;
        }

        // Previous instance is closing; create once it is released
        if self.rooms.contains_key(&room_id) {
            self.pending.insert(
                room_id,
                PendingRoom {
                    waiters: vec![respond_to],
                    creating: false,
                },
            );
            return;
        }

        if self.room_count() >= self.max_rooms {
            warn!(
                target: "sfu.actor.registry",
                sfu_id = %self.sfu_id,
                max_rooms = self.max_rooms,
                "Room capacity reached"
            );
            let _ = respond_to.send(Err(SfuError::SfuCapacityExceeded));
            return;
        }

        self.pending.insert(
            room_id.clone(),
            PendingRoom {
                waiters: vec![respond_to],
                creating: true,
            },
        );
        self.start_creation(room_id);
    }

    /// Live rooms plus rooms being created.
    fn room_count(&self) -> usize {
        self.rooms.len() + self.pending.values().filter(|p| p.creating).count()
    }

    /// Acquire a worker and create the router off the message loop. The
    /// outcome comes back as `RoomCreated`.
    fn start_creation(&self, room_id: String) {
        let pool = self.pool.clone();
        let engine = Arc::clone(&self.engine);
        let settings = Arc::clone(&self.settings);
        let weak_sender = self.weak_sender.clone();

        tokio::spawn(async move {
            let result = create_router(&pool, engine.as_ref(), &settings).await;

            let message = RegistryMessage::RoomCreated { room_id, result };
            let undelivered = match weak_sender.upgrade() {
                Some(sender) => sender.send(message).await.err().map(|e| e.0),
                None => Some(message),
            };

            // Registry is gone: do not leak the router
            if let Some(RegistryMessage::RoomCreated {
                result: Ok(router), ..
            }) = undelivered
            {
                let _ = engine.close_router(router.router_ref()).await;
            }
        });
    }

    fn room_created(&mut self, room_id: String, result: Result<RouterInfo, SfuError>) {
        let Some(pending) = self.pending.remove(&room_id) else {
            // Waiters were already answered by shutdown
            if let Ok(router) = result {
                self.release_router(router);
            }
            return;
        };

        let router = match result {
            Ok(router) => router,
            Err(e) => {
                warn!(
                    target: "sfu.actor.registry",
                    sfu_id = %self.sfu_id,
                    room_id = %room_id,
                    error = %e,
                    "Room creation failed"
                );
                for waiter in pending.waiters {
                    let _ = waiter.send(Err(e.clone()));
                }
                return;
            }
        };

        if !self.accepting_new {
            self.release_router(router);
            for waiter in pending.waiters {
                let _ = waiter.send(Err(SfuError::Draining));
            }
            return;
        }

        // The worker died before a room could watch it
        if self.dead_workers.contains(&router.worker_id) {
            debug!(
                target: "sfu.actor.registry",
                sfu_id = %self.sfu_id,
                room_id = %room_id,
                worker_id = %router.worker_id,
                "Router landed on a dead worker, retrying"
            );
            self.pending.insert(room_id.clone(), pending);
            self.start_creation(room_id);
            return;
        }

        let router_id = router.id;
        let worker_id = router.worker_id;
        let (handle, task_handle) = RoomActor::spawn(
            room_id.clone(),
            router,
            Arc::clone(&self.engine),
            Arc::clone(&self.settings),
            self.weak_sender.clone(),
            Arc::clone(&self.metrics),
            self.cancel_token.child_token(),
        );

        self.rooms.insert(
            room_id.clone(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
                created_at: chrono::Utc::now().timestamp(),
                closing: false,
            },
        );
        self.rooms_created += 1;
        self.metrics.room_created();

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            room_id = %room_id,
            router_id = %router_id,
            worker_id = %worker_id,
            waiters = pending.waiters.len(),
            total_rooms = self.rooms.len(),
            "Room created"
        );

        for waiter in pending.waiters {
            let _ = waiter.send(Ok(handle.clone()));
        }
    }

    /// Close a router no room took ownership of.
    fn release_router(&self, router: RouterInfo) {
        let engine = Arc::clone(&self.engine);
        tokio::spawn(async move {
            if let Err(e) = engine.close_router(router.router_ref()).await {
                debug!(
                    target: "sfu.actor.registry",
                    router_id = %router.id,
                    error = %e,
                    "Unused router already closed"
                );
            }
        });
    }

    fn handle_room_idle(&mut self, room_id: String, router_id: RouterId) {
        let Some(managed) = self
            .rooms
            .get_mut(&room_id)
            .filter(|managed| managed.handle.router_id() == router_id && !managed.closing)
        else {
            debug!(
                target: "sfu.actor.registry",
                room_id = %room_id,
                "Ignoring idle notice for replaced room"
            );
            return;
        };

        managed.closing = true;
        let handle = managed.handle.clone();
        let weak_sender = self.weak_sender.clone();

        tokio::spawn(async move {
            // A room that already stopped counts as closed
            let closed = handle.close_if_empty().await.unwrap_or(true);
            if let Some(sender) = weak_sender.upgrade() {
                let _ = sender
                    .send(RegistryMessage::RoomReleased {
                        room_id,
                        router_id,
                        closed,
                    })
                    .await;
            }
        });
    }

    fn room_released(&mut self, room_id: &str, router_id: RouterId, closed: bool) {
        let Some(managed) = self
            .rooms
            .get_mut(room_id)
            .filter(|managed| managed.handle.router_id() == router_id)
        else {
            return;
        };

        if closed {
            self.remove_room(room_id, "idle");
            return;
        }

        managed.closing = false;
        let handle = managed.handle.clone();
        debug!(
            target: "sfu.actor.registry",
            room_id = %room_id,
            "Room has peers again, keeping it"
        );

        if let Some(pending) = self.pending.remove(room_id) {
            for waiter in pending.waiters {
                let _ = waiter.send(Ok(handle.clone()));
            }
        }
    }

    /// Create a room whose callers queued while its previous instance was
    /// closing.
    fn resume_pending(&mut self, room_id: &str) {
        let Some(pending) = self
            .pending
            .get_mut(room_id)
            .filter(|pending| !pending.creating)
        else {
            return;
        };

        if self.accepting_new {
            pending.creating = true;
            self.start_creation(room_id.to_string());
        } else if let Some(pending) = self.pending.remove(room_id) {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(SfuError::Draining));
            }
        }
    }

    fn handle_pool_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::WorkerDied { worker_id, reason } => {
                self.dead_workers.insert(worker_id);
                let affected: Vec<String> = self
                    .rooms
                    .iter()
                    .filter(|(_, managed)| managed.handle.worker_id() == worker_id)
                    .map(|(room_id, _)| room_id.clone())
                    .collect();

                warn!(
                    target: "sfu.actor.registry",
                    sfu_id = %self.sfu_id,
                    worker_id = %worker_id,
                    reason = %reason,
                    rooms = affected.len(),
                    "Worker died, closing its rooms"
                );

                for room_id in affected {
                    if let Some(managed) = self.rooms.get(&room_id) {
                        managed.handle.worker_died();
                    }
                    self.remove_room(&room_id, "worker_died");
                }
            }

            PoolEvent::WorkerRespawned {
                replaced,
                worker_id,
            } => {
                info!(
                    target: "sfu.actor.registry",
                    sfu_id = %self.sfu_id,
                    replaced = %replaced,
                    worker_id = %worker_id,
                    "Worker replaced, new rooms may use it"
                );
            }

            PoolEvent::Fatal { reason } => {
                error!(
                    target: "sfu.actor.registry",
                    sfu_id = %self.sfu_id,
                    reason = %reason,
                    "Worker pool failed, no longer accepting rooms"
                );
                self.accepting_new = false;
            }
        }
    }

    /// Remove a room without blocking the message loop on its task.
    fn remove_room(&mut self, room_id: &str, reason: &'static str) {
        let Some(managed) = self.rooms.remove(room_id) else {
            return;
        };

        let age_seconds = chrono::Utc::now().timestamp() - managed.created_at;
        let room_id_owned = room_id.to_string();
        let sfu_id = self.sfu_id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(ROOM_STOP_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        sfu_id = %sfu_id,
                        room_id = %room_id_owned,
                        "Room actor task completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %sfu_id,
                        room_id = %room_id_owned,
                        error = ?e,
                        "Room actor task panicked during removal"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %sfu_id,
                        room_id = %room_id_owned,
                        "Room actor task cleanup timed out"
                    );
                    managed.handle.cancel();
                }
            }
        });

        self.metrics.room_removed();

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            room_id = %room_id,
            reason = reason,
            age_seconds = age_seconds,
            total_rooms = self.rooms.len(),
            "Room removed"
        );

        self.resume_pending(room_id);
    }

    fn get_status(&self) -> RegistryStatus {
        RegistryStatus {
            room_count: self.rooms.len(),
            rooms_created: self.rooms_created,
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    /// Close every room and wait for the room actors.
    async fn close_all_rooms(&mut self, deadline: Duration) {
        self.accepting_new = false;

        // In-flight creations release their routers when they report back
        for (_, pending) in self.pending.drain() {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(SfuError::Draining));
            }
        }

        for (room_id, managed) in &self.rooms {
            debug!(
                target: "sfu.actor.registry",
                sfu_id = %self.sfu_id,
                room_id = %room_id,
                "Closing room"
            );
            if !managed.handle.router_closed(CloseReason::Shutdown) {
                managed.handle.cancel();
            }
        }

        for (room_id, managed) in self.rooms.drain() {
            match tokio::time::timeout(deadline, managed.task_handle).await {
                Ok(Ok(())) => {
                    debug!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        room_id = %room_id,
                        "Room actor completed cleanly"
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        room_id = %room_id,
                        error = ?e,
                        "Room actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sfu.actor.registry",
                        sfu_id = %self.sfu_id,
                        room_id = %room_id,
                        "Room actor shutdown timed out"
                    );
                    managed.handle.cancel();
                }
            }
            self.metrics.room_removed();
        }

        info!(
            target: "sfu.actor.registry",
            sfu_id = %self.sfu_id,
            "All rooms closed"
        );
    }

    /// Check health of managed room actors.
    async fn check_room_health(&mut self) {
        let finished: Vec<String> = self
            .rooms
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(room_id, _)| room_id.clone())
            .collect();

        for room_id in finished {
            if let Some(managed) = self.rooms.remove(&room_id) {
                match managed.task_handle.await {
                    Ok(()) => {
                        info!(
                            target: "sfu.actor.registry",
                            sfu_id = %self.sfu_id,
                            room_id = %room_id,
                            "Room actor exited"
                        );
                    }
                    Err(join_error) => {
                        if join_error.is_panic() {
                            error!(
                                target: "sfu.actor.registry",
                                sfu_id = %self.sfu_id,
                                room_id = %room_id,
                                error = ?join_error,
                                "Room actor panicked"
                            );
                            self.metrics.record_panic(ActorType::Room);
                        }
                    }
                }

                self.metrics.room_removed();
                self.resume_pending(&room_id);
            }
        }
    }
}

async fn create_router(
    pool: &WorkerPoolHandle,
    engine: &dyn MediaEngine,
    settings: &RoomSettings,
) -> Result<RouterInfo, SfuError> {
    let worker_id = pool.acquire_worker().await?;
    Ok(engine.create_router(worker_id, &settings.media_codecs).await?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::messages::PoolStatus;
    use crate::actors::pool::{WorkerPoolActor, WorkerPoolConfig};
    use crate::config::WorkerDeathPolicy;
    use crate::engine::codecs::default_media_codecs;
    use crate::engine::{ListenIp, LocalEngine, WebRtcTransportOptions, WorkerSettings};
    use crate::signaling::connection::{ConnectionHandle, OutboundQueue};
    use crate::signaling::protocol::{Notification, ServerMessage};
    use common::types::ConnectionId;

    struct Fixture {
        engine: LocalEngine,
        pool: WorkerPoolHandle,
        registry: RoomRegistryHandle,
    }

    async fn setup(num_workers: usize, max_rooms: usize) -> Fixture {
        let engine = LocalEngine::new();
        let metrics = ActorMetrics::new();
        let (events_tx, events_rx) = mpsc::channel(64);

        let (pool, _pool_task) = WorkerPoolActor::start(
            Arc::new(engine.clone()),
            WorkerPoolConfig {
                num_workers,
                worker_settings: WorkerSettings {
                    rtc_min_port: 2000,
                    rtc_max_port: 2100,
                },
                death_policy: WorkerDeathPolicy::Respawn,
                respawn_attempts: 3,
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

        let (registry, _registry_task) = RoomRegistryActor::spawn(
            RegistryConfig {
                sfu_id: "sfu-test".to_string(),
                max_rooms,
                room_settings: RoomSettings {
                    media_codecs: default_media_codecs(),
                    transport_options: WebRtcTransportOptions {
                        listen_ips: vec![ListenIp {
                            ip: "127.0.0.1".to_string(),
                            announced_ip: None,
                        }],
                        enable_udp: true,
                        enable_tcp: true,
                        prefer_udp: true,
                    },
                    max_peers: 10,
                },
            },
            Arc::new(engine.clone()),
            pool.clone(),
            events_rx,
            metrics,
            CancellationToken::new(),
        );

        Fixture {
            engine,
            pool,
            registry,
        }
    }

    fn peer() -> (ConnectionId, ConnectionHandle, OutboundQueue) {
        let id = ConnectionId::new();
        let (handle, queue) = ConnectionHandle::channel(id, 16, CancellationToken::new());
        (id, handle, queue)
    }

    async fn next_event(queue: &mut OutboundQueue) -> Option<Notification> {
        match tokio::time::timeout(Duration::from_secs(2), queue.recv()).await {
            Ok(Some(ServerMessage::Event(notification))) => Some(notification),
            _ => None,
        }
    }

    async fn wait_for_room_count(registry: &RoomRegistryHandle, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.get_status().await.unwrap().room_count != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("room count did not converge");
    }

    async fn wait_for_alive_workers(pool: &WorkerPoolHandle, expected: usize) -> PoolStatus {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let status = pool.get_status().await.unwrap();
                if status.alive_workers() == expected {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("worker pool did not recover")
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_room() {
        let fixture = setup(1, 10).await;

        let first = fixture
            .registry
            .get_or_create_room("r1".to_string())
            .await
            .unwrap();
        let second = fixture
            .registry
            .get_or_create_room("r1".to_string())
            .await
            .unwrap();
        assert_eq!(first.router_id(), second.router_id());

        let found = fixture.registry.get_room("r1".to_string()).await.unwrap();
        assert_eq!(found.router_id(), first.router_id());

        let status = fixture.registry.get_status().await.unwrap();
        assert_eq!(status.room_count, 1);
        assert_eq!(status.rooms_created, 1);
        assert!(!status.is_draining);
    }

    #[tokio::test]
    async fn test_concurrent_first_joins_create_one_router() {
        let fixture = setup(2, 10).await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let registry = fixture.registry.clone();
            tasks.push(tokio::spawn(async move {
                registry.get_or_create_room("r2".to_string()).await
            }));
        }

        let mut router_ids = Vec::new();
        for task in tasks {
            router_ids.push(task.await.unwrap().unwrap().router_id());
        }
        router_ids.dedup();
        assert_eq!(router_ids.len(), 1);

        let status = fixture.registry.get_status().await.unwrap();
        assert_eq!(status.rooms_created, 1);
    }

    #[tokio::test]
    async fn test_rooms_spread_across_workers() {
        let fixture = setup(2, 10).await;

        let a = fixture
            .registry
            .get_or_create_room("a".to_string())
            .await
            .unwrap();
        let b = fixture
            .registry
            .get_or_create_room("b".to_string())
            .await
            .unwrap();
        assert_ne!(a.worker_id(), b.worker_id());
    }

    #[tokio::test]
    async fn test_unknown_and_invalid_rooms() {
        let fixture = setup(1, 10).await;

        let result = fixture.registry.get_room("missing".to_string()).await;
        assert!(matches!(result, Err(SfuError::RoomNotFound(_))));

        let result = fixture.registry.get_or_create_room("  ".to_string()).await;
        assert!(matches!(result, Err(SfuError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn test_room_capacity() {
        let fixture = setup(1, 1).await;

        fixture
            .registry
            .get_or_create_room("r1".to_string())
            .await
            .unwrap();
        let result = fixture
            .registry
            .get_or_create_room("r2".to_string())
            .await;
        assert!(matches!(result, Err(SfuError::SfuCapacityExceeded)));
    }

    #[tokio::test]
    async fn test_room_released_when_last_peer_leaves() {
        let fixture = setup(1, 10).await;
        let (peer_id, connection, _queue) = peer();

        let room = fixture
            .registry
            .get_or_create_room("r1".to_string())
            .await
            .unwrap();
        room.join(peer_id, connection).await.unwrap();
        room.leave(peer_id).await.unwrap();

        wait_for_room_count(&fixture.registry, 0).await;
        assert!(matches!(
            fixture.registry.get_room("r1".to_string()).await,
            Err(SfuError::RoomNotFound(_))
        ));

        // A new join gets a new router
        let replacement = fixture
            .registry
            .get_or_create_room("r1".to_string())
            .await
            .unwrap();
        assert_ne!(replacement.router_id(), room.router_id());
        assert_eq!(fixture.registry.get_status().await.unwrap().rooms_created, 2);
    }

    #[tokio::test]
    async fn test_worker_death_closes_rooms() {
        let fixture = setup(1, 10).await;
        let (peer_id, connection, mut queue) = peer();

        let room = fixture
            .registry
            .get_or_create_room("r1".to_string())
            .await
            .unwrap();
        room.join(peer_id, connection).await.unwrap();

        assert!(fixture.engine.kill_worker(room.worker_id()).await);

        assert_eq!(
            next_event(&mut queue).await,
            Some(Notification::RouterClosed {
                room_id: "r1".to_string(),
                reason: CloseReason::WorkerDied,
            })
        );
        wait_for_room_count(&fixture.registry, 0).await;

        // The pool respawns and the room can be recreated on the new worker
        let status = wait_for_alive_workers(&fixture.pool, 1).await;
        let recreated = fixture
            .registry
            .get_or_create_room("r1".to_string())
            .await
            .unwrap();
        assert_ne!(recreated.worker_id(), room.worker_id());
        assert_eq!(
            Some(recreated.worker_id()),
            status.workers.first().map(|w| w.worker_id)
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_rooms_and_drains() {
        let fixture = setup(1, 10).await;
        let (peer_id, connection, mut queue) = peer();

        let room = fixture
            .registry
            .get_or_create_room("r1".to_string())
            .await
            .unwrap();
        room.join(peer_id, connection).await.unwrap();

        fixture
            .registry
            .shutdown(Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(
            next_event(&mut queue).await,
            Some(Notification::RouterClosed {
                room_id: "r1".to_string(),
                reason: CloseReason::Shutdown,
            })
        );

        let status = fixture.registry.get_status().await.unwrap();
        assert!(status.is_draining);
        assert_eq!(status.room_count, 0);

        let result = fixture
            .registry
            .get_or_create_room("r1".to_string())
            .await;
        assert!(matches!(result, Err(SfuError::Draining)));
    }
}
