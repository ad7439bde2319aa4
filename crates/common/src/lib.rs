//! Common types shared across the SFU signaling components.

#![warn(clippy::pedantic)]

/// Module for entity identifiers
pub mod types;

/// Module for RTP, ICE and DTLS parameter types
pub mod media;
