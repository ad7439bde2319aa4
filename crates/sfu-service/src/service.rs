//! Actor system wiring.
//!
//! `SfuService::start` brings up the worker pool, then the room registry
//! that consumes the pool's events, and builds the `SignalingContext` the
//! signaling server hands to every connection. The binary and the
//! integration harness both start the service through here.

use crate::actors::{
    ActorMetrics, RegistryConfig, RoomRegistryActor, RoomRegistryHandle, RoomSettings,
    WorkerPoolActor, WorkerPoolConfig, WorkerPoolHandle,
};
use crate::config::Config;
use crate::engine::MediaEngine;
use crate::errors::SfuError;
use crate::signaling::SignalingContext;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Buffer for pool-to-registry events.
const POOL_EVENT_BUFFER: usize = 64;

/// How long the pool gets to close its workers on shutdown.
const POOL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A running actor system.
#[derive(Debug)]
pub struct SfuService {
    pool: WorkerPoolHandle,
    registry: RoomRegistryHandle,
    context: Arc<SignalingContext>,
    metrics: Arc<ActorMetrics>,
    pool_task: JoinHandle<()>,
    registry_task: JoinHandle<()>,
    /// Cancelled by the pool when the process must exit.
    fatal_token: CancellationToken,
    /// Parent of every actor and connection token.
    shutdown_token: CancellationToken,
}

impl SfuService {
    /// Spawn the workers and start the actors.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial workers cannot be spawned.
    pub async fn start(config: &Config, engine: Arc<dyn MediaEngine>) -> Result<Self, SfuError> {
        let metrics = ActorMetrics::new();
        let shutdown_token = CancellationToken::new();
        let fatal_token = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(POOL_EVENT_BUFFER);

        let (pool, pool_task) = WorkerPoolActor::start(
            Arc::clone(&engine),
            WorkerPoolConfig {
                num_workers: config.num_workers,
                worker_settings: config.worker_settings(),
                death_policy: config.worker_death_policy,
                respawn_attempts: config.worker_respawn_attempts,
                respawn_backoff: config.worker_respawn_backoff,
                exit_grace: config.worker_exit_grace,
            },
            events_tx,
            Arc::clone(&metrics),
            fatal_token.clone(),
            shutdown_token.child_token(),
        )
        .await?;

        let (registry, registry_task) = RoomRegistryActor::spawn(
            RegistryConfig {
                sfu_id: config.sfu_id.clone(),
                max_rooms: config.max_rooms,
                room_settings: RoomSettings {
                    media_codecs: config.media_codecs.clone(),
                    transport_options: config.transport_options(),
                    max_peers: config.max_peers_per_room,
                },
            },
            engine,
            pool.clone(),
            events_rx,
            Arc::clone(&metrics),
            shutdown_token.child_token(),
        );

        let context = Arc::new(SignalingContext {
            registry: registry.clone(),
            default_room: config.default_room.clone(),
            metrics: Arc::clone(&metrics),
        });

        info!(
            target: "sfu.service",
            sfu_id = %config.sfu_id,
            num_workers = config.num_workers,
            "Actor system started"
        );

        Ok(Self {
            pool,
            registry,
            context,
            metrics,
            pool_task,
            registry_task,
            fatal_token,
            shutdown_token,
        })
    }

    #[must_use]
    pub fn pool(&self) -> &WorkerPoolHandle {
        &self.pool
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    #[must_use]
    pub fn context(&self) -> Arc<SignalingContext> {
        Arc::clone(&self.context)
    }

    #[must_use]
    pub fn metrics(&self) -> &Arc<ActorMetrics> {
        &self.metrics
    }

    /// Token cancelled when the pool gives up on its workers.
    #[must_use]
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal_token.clone()
    }

    /// Child of the service's shutdown token, for servers and connections.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown_token.child_token()
    }

    /// Close every room (peers get `router-closed`), then stop the actors
    /// and close the workers.
    pub async fn shutdown(self, deadline: Duration) {
        info!(target: "sfu.service", "Shutting down actor system");

        if let Err(e) = self.registry.shutdown(deadline).await {
            warn!(target: "sfu.service", error = %e, "Registry shutdown failed");
        }

        self.shutdown_token.cancel();

        for (name, task) in [("registry", self.registry_task), ("pool", self.pool_task)] {
            match tokio::time::timeout(POOL_STOP_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(target: "sfu.service", actor = name, error = %e, "Actor task failed");
                }
                Err(_) => {
                    warn!(target: "sfu.service", actor = name, "Actor did not stop in time");
                }
            }
        }

        info!(target: "sfu.service", "Actor system stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::engine::LocalEngine;
    use std::collections::HashMap;

    fn config(num_workers: &str) -> Config {
        let vars = HashMap::from([
            ("SFU_NUM_WORKERS".to_string(), num_workers.to_string()),
            ("SFU_RTC_MIN_PORT".to_string(), "4000".to_string()),
            ("SFU_RTC_MAX_PORT".to_string(), "4100".to_string()),
        ]);
        Config::from_vars(&vars).unwrap()
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let engine = LocalEngine::new();
        let service = SfuService::start(&config("2"), Arc::new(engine.clone()))
            .await
            .unwrap();

        let status = service.pool().get_status().await.unwrap();
        assert_eq!(status.alive_workers(), 2);
        assert_eq!(service.context().default_room.as_deref(), Some("default"));

        service
            .registry()
            .get_or_create_room("r1".to_string())
            .await
            .unwrap();

        service.shutdown(Duration::from_secs(5)).await;
        assert_eq!(engine.worker_count().await, 0);
    }
}
