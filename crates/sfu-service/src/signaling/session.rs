//! Per-connection peer session.
//!
//! A `PeerSession` is created when a signaling connection is accepted and
//! destroyed when it closes. It tracks which room the peer is in and how
//! far the connection has progressed:
//!
//! ```text
//! Connected ─► CapabilityExchanged ─► TransportsEstablished ─► Active ─► Disconnected
//! ```
//!
//! The entities a peer owns live in its room's actor, keyed by the peer's
//! connection id. Destroying the session leaves the room, which cascades
//! the close of every transport, producer and consumer the peer owned.

use super::connection::ConnectionHandle;
use crate::actors::messages::JoinResult;
use crate::actors::registry::RoomRegistryHandle;
use crate::actors::room::RoomHandle;
use crate::errors::SfuError;
use common::types::ConnectionId;
use std::fmt;
use tracing::{debug, info, warn};

/// Attempts to join when the room is released between lookup and join.
const JOIN_ATTEMPTS: usize = 3;

/// Progress of a signaling connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionPhase {
    /// Accepted; nothing exchanged yet.
    Connected,
    /// The peer has the router's RTP capabilities.
    CapabilityExchanged,
    /// The peer created at least one transport.
    TransportsEstablished,
    /// Producing and/or consuming.
    Active,
    /// Terminal.
    Disconnected,
}

impl ConnectionPhase {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ConnectionPhase::Connected => "connected",
            ConnectionPhase::CapabilityExchanged => "capability-exchanged",
            ConnectionPhase::TransportsEstablished => "transports-established",
            ConnectionPhase::Active => "active",
            ConnectionPhase::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of one connected peer.
#[derive(Debug)]
pub struct PeerSession {
    connection: ConnectionHandle,
    room: Option<RoomHandle>,
    /// Room requested at connect time; used for implicit joins.
    preferred_room: Option<String>,
    phase: ConnectionPhase,
}

impl PeerSession {
    #[must_use]
    pub fn new(connection: ConnectionHandle) -> Self {
        Self {
            connection,
            room: None,
            preferred_room: None,
            phase: ConnectionPhase::Connected,
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> ConnectionId {
        self.connection.connection_id()
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    #[must_use]
    pub fn phase(&self) -> ConnectionPhase {
        self.phase
    }

    #[must_use]
    pub fn room(&self) -> Option<&RoomHandle> {
        self.room.as_ref()
    }

    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        self.room.as_ref().map(RoomHandle::room_id)
    }

    #[must_use]
    pub fn preferred_room(&self) -> Option<&str> {
        self.preferred_room.as_deref()
    }

    pub fn set_preferred_room(&mut self, room_id: Option<String>) {
        self.preferred_room = room_id;
    }

    /// Move forward to `phase`. Never moves backwards, and nothing follows
    /// `Disconnected`.
    pub fn advance(&mut self, phase: ConnectionPhase) {
        if phase > self.phase && self.phase != ConnectionPhase::Disconnected {
            debug!(
                target: "sfu.signaling",
                peer_id = %self.peer_id(),
                from = %self.phase,
                to = %phase,
                "Connection phase changed"
            );
            self.phase = phase;
        }
    }

    /// The room the peer is in, if its actor is still running. A room whose
    /// router went away is forgotten.
    pub fn live_room(&mut self) -> Option<RoomHandle> {
        if self.room.as_ref().is_some_and(RoomHandle::is_closed) {
            self.forget_room();
        }
        self.room.clone()
    }

    /// Drop the room reference without leaving (the room is already gone).
    pub fn forget_room(&mut self) {
        if let Some(room) = self.room.take() {
            info!(
                target: "sfu.signaling",
                peer_id = %self.peer_id(),
                room_id = %room.room_id(),
                "Room lost, peer must rejoin"
            );
            if self.phase != ConnectionPhase::Disconnected {
                self.phase = ConnectionPhase::Connected;
            }
        }
    }

    /// Drop a room that reported itself unavailable. The actor may have
    /// outlived its router, so the peer still leaves it, best effort.
    pub async fn abandon_room(&mut self) {
        let Some(room) = self.room.clone() else {
            return;
        };
        self.forget_room();

        if let Err(e) = room.leave(self.peer_id()).await {
            debug!(
                target: "sfu.signaling",
                peer_id = %self.peer_id(),
                room_id = %room.room_id(),
                error = %e,
                "Leave of lost room failed"
            );
        }
    }

    /// Join `room_id`, creating it on first use. Joining a different room
    /// leaves the current one first; joining the current room again returns
    /// the current view.
    ///
    /// # Errors
    ///
    /// Returns the registry's or room's error; `RoomUnavailable` only after
    /// every attempt raced a release.
    pub async fn join_room(
        &mut self,
        registry: &RoomRegistryHandle,
        room_id: &str,
    ) -> Result<JoinResult, SfuError> {
        if self.phase == ConnectionPhase::Disconnected {
            return Err(SfuError::InvalidState("connection closed".to_string()));
        }

        if self.live_room().is_some_and(|room| room.room_id() != room_id) {
            self.leave_room().await?;
        }

        let mut last_error = SfuError::RoomUnavailable(room_id.to_string());
        for attempt in 1..=JOIN_ATTEMPTS {
            let room = registry.get_or_create_room(room_id.to_string()).await?;
            match room.join(self.peer_id(), self.connection.clone()).await {
                Ok(joined) => {
                    debug!(
                        target: "sfu.signaling",
                        peer_id = %self.peer_id(),
                        room_id = %room_id,
                        router_id = %room.router_id(),
                        "Peer joined room"
                    );
                    self.room = Some(room);
                    self.advance(ConnectionPhase::CapabilityExchanged);
                    return Ok(joined);
                }
                Err(e @ SfuError::RoomUnavailable(_)) => {
                    debug!(
                        target: "sfu.signaling",
                        peer_id = %self.peer_id(),
                        room_id = %room_id,
                        attempt,
                        "Room released during join, retrying"
                    );
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    /// Leave the current room, closing everything the peer owns there.
    ///
    /// # Errors
    ///
    /// Returns an error only if the room rejected the leave; a room that is
    /// already gone counts as left.
    pub async fn leave_room(&mut self) -> Result<(), SfuError> {
        let Some(room) = self.room.take() else {
            return Ok(());
        };

        if self.phase != ConnectionPhase::Disconnected {
            self.phase = ConnectionPhase::Connected;
        }

        match room.leave(self.peer_id()).await {
            Ok(()) | Err(SfuError::RoomUnavailable(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Tear the session down. Idempotent.
    pub async fn destroy(&mut self) {
        if self.phase == ConnectionPhase::Disconnected {
            return;
        }
        self.phase = ConnectionPhase::Disconnected;

        if let Err(e) = self.leave_room().await {
            warn!(
                target: "sfu.signaling",
                peer_id = %self.peer_id(),
                error = %e,
                "Failed to leave room during disconnect"
            );
        }
        self.connection.cancel();
    }
}
