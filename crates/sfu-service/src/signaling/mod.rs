//! Client signaling.
//!
//! - [`protocol`] - wire envelope and request decoding
//! - [`connection`] - outbound queue per connection
//! - [`session`] - `PeerSession`, one per connected peer
//! - [`dispatcher`] - routes requests to rooms and renders responses
//! - [`websocket`] - axum router and socket loop

pub mod connection;
pub mod dispatcher;
pub mod protocol;
pub mod session;
pub mod websocket;

pub use connection::{ConnectionHandle, OutboundQueue};
pub use dispatcher::{Dispatcher, SignalingContext};
pub use session::{ConnectionPhase, PeerSession};
pub use websocket::signaling_router;
