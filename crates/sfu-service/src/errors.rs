//! SFU service error types.
//!
//! Error types map to signaling error codes carried in client responses.
//! Internal details are logged server-side but not exposed to clients.

use crate::engine::EngineError;
use thiserror::Error;

/// SFU service error type.
///
/// Maps to signaling error codes:
/// - Request validation and codec compatibility: `INVALID_REQUEST` (1)
/// - Unknown rooms, peers, transports, producers, consumers: `NOT_FOUND` (4)
/// - Entity state violations: `CONFLICT` (5)
/// - Engine, Config, Internal: `INTERNAL_ERROR` (6)
/// - Capacity, draining, unavailable rooms: `UNAVAILABLE` (7)
#[derive(Debug, Clone, Error)]
pub enum SfuError {
    /// The request named an operation the dispatcher does not know.
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// The request payload could not be decoded.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The media engine rejected parameters as incompatible with the router.
    #[error("Incompatible parameters: {0}")]
    Incompatible(String),

    /// Room-scoped operation from a peer that has not joined a room.
    #[error("Peer is not in a room")]
    NotInRoom,

    /// Room not found.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Peer not found in the room.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Transport not found (never existed, closed, or owned by another peer).
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    /// Producer not found.
    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    /// Consumer not found.
    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    /// Operation is not valid in the entity's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Conflict error (e.g., a second send transport).
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Room lost its router (worker died, shutting down, or released).
    #[error("Room unavailable: {0}")]
    RoomUnavailable(String),

    /// Room is at capacity.
    #[error("Room at capacity: {0}")]
    RoomCapacityExceeded(String),

    /// SFU is at capacity (rooms or transport ports).
    #[error("SFU at capacity")]
    SfuCapacityExceeded,

    /// No live media worker to host a router.
    #[error("No media worker available")]
    NoWorkerAvailable,

    /// SFU is draining (graceful shutdown).
    #[error("SFU is draining")]
    Draining,

    /// Media engine failure.
    #[error("Media engine error: {0}")]
    Engine(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SfuError {
    /// Returns the signaling error code for this error.
    pub fn error_code(&self) -> i32 {
        match self {
            SfuError::UnknownOperation(_)
            | SfuError::InvalidPayload(_)
            | SfuError::Incompatible(_) => 1, // INVALID_REQUEST
            SfuError::RoomNotFound(_)
            | SfuError::PeerNotFound(_)
            | SfuError::TransportNotFound(_)
            | SfuError::ProducerNotFound(_)
            | SfuError::ConsumerNotFound(_) => 4, // NOT_FOUND
            SfuError::NotInRoom | SfuError::InvalidState(_) | SfuError::Conflict(_) => 5, // CONFLICT
            SfuError::Engine(_) | SfuError::Config(_) | SfuError::Internal(_) => 6, // INTERNAL_ERROR
            SfuError::RoomUnavailable(_)
            | SfuError::RoomCapacityExceeded(_)
            | SfuError::SfuCapacityExceeded
            | SfuError::NoWorkerAvailable
            | SfuError::Draining => 7, // UNAVAILABLE
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            SfuError::Engine(_) | SfuError::Config(_) | SfuError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            SfuError::UnknownOperation(op) => format!("Unknown operation: {op}"),
            SfuError::InvalidPayload(msg) => format!("Invalid payload: {msg}"),
            SfuError::NotInRoom => "Not in a room".to_string(),
            SfuError::RoomNotFound(_) => "Room not found".to_string(),
            SfuError::PeerNotFound(_) => "Peer not found".to_string(),
            SfuError::TransportNotFound(_) => "Transport not found".to_string(),
            SfuError::ProducerNotFound(_) => "Producer not found".to_string(),
            SfuError::ConsumerNotFound(_) => "Consumer not found".to_string(),
            SfuError::RoomUnavailable(_) => "Room is unavailable, please rejoin".to_string(),
            SfuError::RoomCapacityExceeded(_) => "Room is at capacity".to_string(),
            SfuError::SfuCapacityExceeded | SfuError::NoWorkerAvailable => {
                "Server is at capacity, please try again".to_string()
            }
            SfuError::Draining => "Server is shutting down, please reconnect".to_string(),
            SfuError::Incompatible(msg) | SfuError::InvalidState(msg) | SfuError::Conflict(msg) => {
                msg.clone()
            }
        }
    }
}

impl From<EngineError> for SfuError {
    fn from(err: EngineError) -> Self {
        let message = err.to_string();
        match err {
            EngineError::InvalidParameters(msg) | EngineError::UnsupportedCodec(msg) => {
                SfuError::Incompatible(msg)
            }
            EngineError::InvalidState(msg) => SfuError::InvalidState(msg),
            EngineError::WorkerClosed(_) | EngineError::RouterClosed(_) => {
                SfuError::RoomUnavailable(message)
            }
            EngineError::PortsExhausted { .. } => SfuError::SfuCapacityExceeded,
            EngineError::NotFound(_) | EngineError::Spawn(_) => SfuError::Engine(message),
        }
    }
}
