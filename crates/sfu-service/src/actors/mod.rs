//! Actor model implementation for the SFU service.
//!
//! ```text
//! RoomRegistryActor (singleton)
//! ├── supervises N RoomActors
//! │   └── RoomActor (one per active room)
//! │       ├── owns the room's router
//! │       └── owns peers' transports, producers and consumers
//! └── consumes PoolEvents from
//!     WorkerPoolActor (singleton, owns the media workers)
//! ```
//!
//! # Key Design Decisions
//!
//! - **Rooms are created only by the registry**: concurrent first joins of
//!   a room are linearized through its mailbox
//! - **One actor per room**: mutations of a room's entities are serialized;
//!   different rooms never share a lock
//! - **CancellationToken propagation**: parents pass child tokens for
//!   graceful shutdown
//! - **Weak senders upward**: rooms notify the registry, and respawn tasks
//!   the pool, without keeping them alive
//!
//! # Modules
//!
//! - [`pool`] - `WorkerPoolActor`, worker lifecycle and crash policy
//! - [`registry`] - `RoomRegistryActor`, room id to router mapping
//! - [`room`] - `RoomActor`, per-room entity graph
//! - [`messages`] - message and status types
//! - [`metrics`] - mailbox monitoring and actor metrics

pub mod messages;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod room;

pub use messages::*;
pub use metrics::{ActorMetrics, ActorType, MailboxMonitor};
pub use pool::{WorkerPoolActor, WorkerPoolConfig, WorkerPoolHandle};
pub use registry::{RegistryConfig, RoomRegistryActor, RoomRegistryHandle};
pub use room::{RoomActor, RoomHandle, RoomSettings};
