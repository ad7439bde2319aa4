//! `WorkerPoolActor` - owns the media workers.
//!
//! - Spawns N workers at startup and hands them out round-robin
//! - Watches engine events for worker deaths
//! - Applies the [`WorkerDeathPolicy`]: bounded respawn with linear
//!   backoff, or immediate escalation
//! - On escalation, reports [`PoolEvent::Fatal`] and cancels the fatal
//!   token after the exit grace period so the binary can exit non-zero
//!
//! Worker deaths are reported to the registry as [`PoolEvent::WorkerDied`]
//! so it can invalidate every room the worker hosted.

use super::messages::{PoolEvent, PoolMessage, PoolStatus, WorkerHealth, WorkerStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::config::WorkerDeathPolicy;
use crate::engine::{EngineError, EngineEvent, MediaEngine, WorkerInfo, WorkerSettings};
use crate::errors::SfuError;
use crate::observability::metrics as prom;
use common::types::WorkerId;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the pool mailbox.
const POOL_CHANNEL_BUFFER: usize = 256;

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub num_workers: usize,
    pub worker_settings: WorkerSettings,
    pub death_policy: WorkerDeathPolicy,
    /// Respawn attempts per death before escalating.
    pub respawn_attempts: u32,
    /// Attempt `n` (0-based) waits `n * respawn_backoff` first.
    pub respawn_backoff: Duration,
    /// Delay between escalation and the fatal token firing.
    pub exit_grace: Duration,
}

/// Handle to the `WorkerPoolActor`.
#[derive(Debug, Clone)]
pub struct WorkerPoolHandle {
    sender: mpsc::Sender<PoolMessage>,
    cancel_token: CancellationToken,
}

impl WorkerPoolHandle {
    /// Pick a live worker to host a new router.
    pub async fn acquire_worker(&self) -> Result<WorkerId, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(PoolMessage::AcquireWorker { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn get_status(&self) -> Result<PoolStatus, SfuError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(PoolMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SfuError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SfuError::Internal(format!("response receive failed: {e}")))
    }

    /// Close every worker and stop the actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// A pool slot. The slot survives respawns; its worker changes.
struct PooledWorker {
    info: WorkerInfo,
    health: WorkerHealth,
    respawns: u32,
}

/// The `WorkerPoolActor` implementation.
pub struct WorkerPoolActor {
    engine: Arc<dyn MediaEngine>,
    config: WorkerPoolConfig,
    receiver: mpsc::Receiver<PoolMessage>,
    /// Used by respawn tasks to report back without keeping the actor alive.
    weak_sender: mpsc::WeakSender<PoolMessage>,
    engine_events: broadcast::Receiver<EngineEvent>,
    engine_events_open: bool,
    events: mpsc::Sender<PoolEvent>,
    workers: Vec<PooledWorker>,
    next: usize,
    fatal: bool,
    fatal_token: CancellationToken,
    cancel_token: CancellationToken,
    metrics: Arc<ActorMetrics>,
    mailbox: MailboxMonitor,
}

impl WorkerPoolActor {
    /// Spawn the configured workers and start the pool.
    ///
    /// `fatal_token` is cancelled once the pool gives up on its workers.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool is empty or any worker fails to spawn.
    /// Workers spawned before the failure are closed.
    pub async fn start(
        engine: Arc<dyn MediaEngine>,
        config: WorkerPoolConfig,
        events: mpsc::Sender<PoolEvent>,
        metrics: Arc<ActorMetrics>,
        fatal_token: CancellationToken,
        cancel_token: CancellationToken,
    ) -> Result<(WorkerPoolHandle, JoinHandle<()>), SfuError> {
        if config.num_workers == 0 {
            return Err(SfuError::Config(
                "worker pool needs at least one worker".to_string(),
            ));
        }

        // Subscribe before spawning so no death is missed
        let engine_events = engine.subscribe();

        let mut workers = Vec::with_capacity(config.num_workers);
        for _ in 0..config.num_workers {
            match engine.spawn_worker(&config.worker_settings).await {
                Ok(info) => workers.push(PooledWorker {
                    info,
                    health: WorkerHealth::Alive,
                    respawns: 0,
                }),
                Err(e) => {
                    for worker in &workers {
                        let _ = engine.close_worker(worker.info.id).await;
                    }
                    return Err(SfuError::Engine(e.to_string()));
                }
            }
        }

        let (sender, receiver) = mpsc::channel(POOL_CHANNEL_BUFFER);

        let actor = Self {
            engine,
            config,
            receiver,
            weak_sender: sender.downgrade(),
            engine_events,
            engine_events_open: true,
            events,
            workers,
            next: 0,
            fatal: false,
            fatal_token,
            cancel_token: cancel_token.clone(),
            metrics,
            mailbox: MailboxMonitor::new(ActorType::Pool, "pool"),
        };
        actor.update_alive_gauge();

        let task_handle = tokio::spawn(actor.run());

        Ok((
            WorkerPoolHandle {
                sender,
                cancel_token,
            },
            task_handle,
        ))
    }

    #[instrument(skip_all, name = "sfu.actor.pool", fields(workers = self.workers.len()))]
    async fn run(mut self) {
        info!(
            target: "sfu.actor.pool",
            workers = self.workers.len(),
            policy = self.config.death_policy.as_str(),
            "WorkerPoolActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(target: "sfu.actor.pool", "WorkerPoolActor received cancellation signal");
                    self.close_workers().await;
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
                            info!(target: "sfu.actor.pool", "WorkerPoolActor channel closed, exiting");
                            self.close_workers().await;
                            break;
                        }
                    }
                }

                event = self.engine_events.recv(), if self.engine_events_open => {
                    match event {
                        Ok(event) => self.handle_engine_event(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(
                                target: "sfu.actor.pool",
                                skipped = skipped,
                                "Engine event stream lagged"
                            );
                        }
                        Err(RecvError::Closed) => {
                            warn!(target: "sfu.actor.pool", "Engine event stream closed");
                            self.engine_events_open = false;
                        }
                    }
                }
            }
        }

        info!(
            target: "sfu.actor.pool",
            messages_processed = self.mailbox.messages_processed(),
            "WorkerPoolActor stopped"
        );
    }

    async fn handle_message(&mut self, message: PoolMessage) {
        match message {
            PoolMessage::AcquireWorker { respond_to } => {
                let _ = respond_to.send(self.acquire_worker());
            }

            PoolMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            PoolMessage::RespawnFinished { replaced, result } => {
                self.respawn_finished(replaced, result).await;
            }
        }
    }

    /// Round-robin over live workers.
    fn acquire_worker(&mut self) -> Result<WorkerId, SfuError> {
        if self.fatal {
            return Err(SfuError::NoWorkerAvailable);
        }

        let count = self.workers.len();
        for offset in 0..count {
            let index = (self.next + offset) % count;
            if let Some(worker) = self.workers.get(index) {
                if worker.health == WorkerHealth::Alive {
                    self.next = (index + 1) % count;
                    return Ok(worker.info.id);
                }
            }
        }

        Err(SfuError::NoWorkerAvailable)
    }

    fn get_status(&self) -> PoolStatus {
        PoolStatus {
            workers: self
                .workers
                .iter()
                .map(|w| WorkerStatus {
                    worker_id: w.info.id,
                    pid: w.info.pid,
                    health: w.health,
                    respawns: w.respawns,
                })
                .collect(),
            is_fatal: self.fatal,
        }
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        let EngineEvent::WorkerDied { worker_id, reason } = event else {
            return;
        };

        let respawn = self.config.death_policy == WorkerDeathPolicy::Respawn
            && self.config.respawn_attempts > 0
            && !self.fatal;

        let Some(slot) = self
            .workers
            .iter_mut()
            .find(|w| w.info.id == worker_id && w.health == WorkerHealth::Alive)
        else {
            debug!(
                target: "sfu.actor.pool",
                worker_id = %worker_id,
                "Ignoring death of worker outside the pool"
            );
            return;
        };

        slot.health = if respawn {
            WorkerHealth::Respawning
        } else {
            WorkerHealth::Dead
        };
        let pid = slot.info.pid;

        error!(
            target: "sfu.actor.pool",
            worker_id = %worker_id,
            pid = pid,
            reason = %reason,
            "Media worker died"
        );
        prom::record_worker_death();
        self.update_alive_gauge();
        self.notify(PoolEvent::WorkerDied {
            worker_id,
            reason: reason.clone(),
        })
        .await;

        if respawn {
            self.spawn_respawn(worker_id);
        } else {
            self.escalate(format!("media worker {worker_id} died: {reason}"))
                .await;
        }
    }

    /// Respawn in the background so the pool keeps serving requests.
    fn spawn_respawn(&self, replaced: WorkerId) {
        let engine = Arc::clone(&self.engine);
        let settings = self.config.worker_settings.clone();
        let attempts = self.config.respawn_attempts;
        let backoff = self.config.respawn_backoff;
        let cancel_token = self.cancel_token.child_token();
        let weak_sender = self.weak_sender.clone();

        tokio::spawn(async move {
            let result =
                respawn_worker(engine.as_ref(), &settings, attempts, backoff, &cancel_token).await;

            let message = PoolMessage::RespawnFinished { replaced, result };
            let undelivered = match weak_sender.upgrade() {
                Some(sender) => sender.send(message).await.err().map(|e| e.0),
                None => Some(message),
            };

            // Pool is gone: do not leak the replacement
            if let Some(PoolMessage::RespawnFinished {
                result: Ok(info), ..
            }) = undelivered
            {
                let _ = engine.close_worker(info.id).await;
            }
        });
    }

    async fn respawn_finished(&mut self, replaced: WorkerId, result: Result<WorkerInfo, EngineError>) {
        let slot_index = self.workers.iter().position(|w| w.info.id == replaced);

        match (slot_index, result) {
            (Some(index), Ok(info)) if !self.fatal => {
                if let Some(slot) = self.workers.get_mut(index) {
                    slot.info = info;
                    slot.health = WorkerHealth::Alive;
                    slot.respawns += 1;
                }
                prom::record_worker_respawn();
                self.update_alive_gauge();

                info!(
                    target: "sfu.actor.pool",
                    replaced = %replaced,
                    worker_id = %info.id,
                    pid = info.pid,
                    "Media worker respawned"
                );
                self.notify(PoolEvent::WorkerRespawned {
                    replaced,
                    worker_id: info.id,
                })
                .await;
            }
            (_, Ok(info)) => {
                debug!(
                    target: "sfu.actor.pool",
                    worker_id = %info.id,
                    "Discarding respawned worker"
                );
                let _ = self.engine.close_worker(info.id).await;
            }
            (index, Err(e)) => {
                if let Some(slot) = index.and_then(|i| self.workers.get_mut(i)) {
                    slot.health = WorkerHealth::Dead;
                }
                self.escalate(format!("respawn of media worker {replaced} failed: {e}"))
                    .await;
            }
        }
    }

    /// Give up: the pool cannot serve rooms safely anymore.
    async fn escalate(&mut self, reason: String) {
        if self.fatal {
            return;
        }
        self.fatal = true;

        error!(
            target: "sfu.actor.pool",
            reason = %reason,
            grace_ms = u64::try_from(self.config.exit_grace.as_millis()).unwrap_or(u64::MAX),
            "Worker pool failed, exiting after grace period"
        );
        self.notify(PoolEvent::Fatal { reason }).await;

        let grace = self.config.exit_grace;
        let fatal_token = self.fatal_token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            fatal_token.cancel();
        });
    }

    /// Waits for channel space rather than dropping the event.
    async fn notify(&self, event: PoolEvent) {
        if let Err(e) = self.events.send(event).await {
            warn!(
                target: "sfu.actor.pool",
                error = %e,
                "Failed to deliver pool event"
            );
        }
    }

    fn update_alive_gauge(&self) {
        let alive = self
            .workers
            .iter()
            .filter(|w| w.health == WorkerHealth::Alive)
            .count();
        prom::set_workers_alive(alive);
    }

    async fn close_workers(&mut self) {
        for worker in &mut self.workers {
            if worker.health != WorkerHealth::Alive {
                continue;
            }
            match self.engine.close_worker(worker.info.id).await {
                Ok(()) => debug!(
                    target: "sfu.actor.pool",
                    worker_id = %worker.info.id,
                    "Media worker closed"
                ),
                Err(e) => warn!(
                    target: "sfu.actor.pool",
                    worker_id = %worker.info.id,
                    error = %e,
                    "Failed to close media worker"
                ),
            }
            worker.health = WorkerHealth::Dead;
        }
        prom::set_workers_alive(0);
    }
}

/// Try to spawn a replacement worker up to `attempts` times.
async fn respawn_worker(
    engine: &dyn MediaEngine,
    settings: &WorkerSettings,
    attempts: u32,
    backoff: Duration,
    cancel_token: &CancellationToken,
) -> Result<WorkerInfo, EngineError> {
    let mut last_error = EngineError::Spawn("no respawn attempt made".to_string());

    for attempt in 0..attempts {
        let delay = backoff.saturating_mul(attempt);
        tokio::select! {
            () = cancel_token.cancelled() => {
                return Err(EngineError::Spawn("pool shutting down".to_string()));
            }
            () = tokio::time::sleep(delay) => {}
        }

        match engine.spawn_worker(settings).await {
            Ok(info) => return Ok(info),
            Err(e) => {
                warn!(
                    target: "sfu.actor.pool",
                    attempt = attempt + 1,
                    attempts = attempts,
                    error = %e,
                    "Worker respawn attempt failed"
                );
                last_error = e;
            }
        }
    }

    Err(last_error)
}
