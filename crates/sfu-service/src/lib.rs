//! SFU Signaling Service Library
//!
//! Signaling and session orchestration for a Selective Forwarding Unit.
//! Media (ICE, DTLS-SRTP, RTP forwarding) is delegated to a media engine;
//! this crate drives the engine's workers, routers, transports, producers
//! and consumers from a JSON request/response protocol over WebSocket.
//!
//! # Architecture
//!
//! ```text
//! WebSocket ─► Dispatcher (per connection) ─► RoomRegistryActor ─► RoomActor (per room)
//!                                                    │                   │
//!                                              WorkerPoolActor ◄─────────┴─► MediaEngine
//! ```
//!
//! # Key Design Decisions
//!
//! - **One router per room**: the registry linearizes room creation
//! - **Per-room serialization**: a room's entities are only mutated by its
//!   actor, one message at a time
//! - **Explicit consume rejection**: an incompatible consume is answered
//!   with an error payload, never left unanswered
//! - **Bounded worker respawn**: a dead worker is respawned a bounded number
//!   of times, then the process exits after a grace period
//!
//! # Modules
//!
//! - [`actors`] - Worker pool, room registry and room actors
//! - [`config`] - Service configuration from environment
//! - [`engine`] - Media engine boundary and the in-process engine
//! - [`errors`] - Error types with signaling error codes
//! - [`observability`] - Health endpoints and Prometheus metrics
//! - [`service`] - Actor system wiring
//! - [`signaling`] - Wire protocol, sessions, dispatcher, WebSocket server

pub mod actors;
pub mod config;
pub mod engine;
pub mod errors;
pub mod observability;
pub mod service;
pub mod signaling;
