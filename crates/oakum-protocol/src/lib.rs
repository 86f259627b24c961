//! Oakum wire protocol and streaming engines
//!
//! The transfer core of the Oakum swarm streaming engine: packet framing,
//! the pre-allocated slot pool, out-of-order reassembly, Reed-Solomon
//! forward error correction, and the sender/receiver/swarm engines that
//! drive a transfer over unreliable datagram transports.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod fec;
pub mod pool;
pub mod reorder;
pub mod swarm;
pub mod transfer;
pub mod wire;

pub use config::TransferConfig;
pub use error::ProtocolError;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;
