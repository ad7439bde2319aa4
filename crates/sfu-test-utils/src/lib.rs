//! # SFU Test Utilities
//!
//! Shared test utilities for the SFU signaling service.
//!
//! ## Modules
//!
//! - `fixtures` - Client capabilities, RTP parameters, DTLS parameters
//! - `mock_engine` - Fault-injecting `MediaEngine` that counts calls
//! - `harness` - `TestSfu`, a fully wired actor system
//! - `peer` - `TestPeer`, an in-process signaling client
//! - `ws_client` - `WsClient`, a WebSocket signaling client
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sfu_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let sfu = TestSfu::start().await;
//!
//!     let mut alice = sfu.peer().await;
//!     alice.join("r1").await;
//!     alice.create_send_transport().await;
//!     let producer_id = alice.produce_video().await;
//!
//!     let mut bob = sfu.peer().await;
//!     bob.join("r1").await;
//!     bob.create_recv_transport().await;
//!     let consumer = bob.consume(producer_id).await;
//!     assert_eq!(consumer["params"]["producerId"], producer_id.to_string());
//!
//!     sfu.shutdown().await;
//! }
//! ```
//!
//! ## Fault Injection
//!
//! ```rust,ignore
//! let sfu = TestSfu::start().await;
//! sfu.engine().fail_next("create_webrtc_transport", EngineError::PortsExhausted { min: 1, max: 1 });
//! sfu.engine().kill_worker(worker_id).await;
//! ```

pub mod fixtures;
pub mod harness;
pub mod mock_engine;
pub mod peer;
pub mod ws_client;

pub use fixtures::*;
pub use harness::TestSfu;
pub use mock_engine::MockEngine;
pub use peer::TestPeer;
pub use ws_client::WsClient;
