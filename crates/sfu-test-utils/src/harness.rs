//! A fully wired SFU for integration tests.
//!
//! `TestSfu` starts the real actor system (worker pool, registry, rooms)
//! on a [`MockEngine`], and hands out in-process peers or a real signaling
//! server for WebSocket clients.

use crate::fixtures::test_config_vars;
use crate::mock_engine::MockEngine;
use crate::peer::TestPeer;
use common::types::ConnectionId;
use sfu_service::actors::{RoomHandle, RoomRegistryHandle};
use sfu_service::config::Config;
use sfu_service::service::SfuService;
use sfu_service::signaling::connection::CONNECTION_CHANNEL_BUFFER;
use sfu_service::signaling::{signaling_router, ConnectionHandle, Dispatcher};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Running SFU under test.
pub struct TestSfu {
    service: SfuService,
    engine: MockEngine,
    config: Config,
}

impl TestSfu {
    /// Start with one worker and the default room enabled.
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    /// Start with a customized configuration.
    ///
    /// # Panics
    ///
    /// Panics if the service fails to start.
    pub async fn start_with(configure: impl FnOnce(&mut Config)) -> Self {
        let mut config =
            Config::from_vars(&test_config_vars(40000, 40999)).expect("test config is valid");
        configure(&mut config);

        let engine = MockEngine::new();
        let service = SfuService::start(&config, Arc::new(engine.clone()))
            .await
            .expect("SFU starts");

        Self {
            service,
            engine,
            config,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &MockEngine {
        &self.engine
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn service(&self) -> &SfuService {
        &self.service
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistryHandle {
        self.service.registry()
    }

    /// Look up a live room.
    ///
    /// # Panics
    ///
    /// Panics if the room does not exist.
    pub async fn room(&self, room_id: &str) -> RoomHandle {
        self.registry()
            .get_room(room_id.to_string())
            .await
            .expect("room exists")
    }

    /// Connect an in-process peer that has received `connection-success`.
    pub async fn peer(&self) -> TestPeer {
        self.connect(None).await
    }

    /// Connect an in-process peer, optionally naming a room as the
    /// WebSocket `roomId` query parameter would.
    pub async fn connect(&self, room_id: Option<&str>) -> TestPeer {
        let (connection, outbound) = ConnectionHandle::channel(
            ConnectionId::new(),
            CONNECTION_CHANNEL_BUFFER,
            self.service.child_token(),
        );
        let mut dispatcher = Dispatcher::new(self.service.context(), connection);
        dispatcher.on_connect(room_id.map(str::to_string)).await;

        let mut peer = TestPeer::new(dispatcher, outbound);
        peer.expect_connection_success().await;
        peer
    }

    /// Serve the signaling router on an ephemeral local port.
    ///
    /// # Panics
    ///
    /// Panics if the listener cannot be bound.
    pub async fn serve(&self) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind signaling listener");
        let addr = listener.local_addr().expect("listener address");

        let token = self.service.child_token();
        let app = signaling_router(self.service.context(), token.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
        });

        addr
    }

    /// Graceful shutdown, as on SIGTERM.
    pub async fn shutdown(self) {
        self.service.shutdown(Duration::from_secs(5)).await;
    }
}
