//! Oakum transport boundary
//!
//! The streaming engine never talks to a socket directly. It sends packets
//! through the [`DatagramChannel`] trait and reacts to the channel's event
//! stream (inbound datagrams, send-buffer drain, closure). Real transports
//! (QUIC datagrams, DTLS, a WebRTC data channel) live outside this
//! repository and implement the same trait; the in-memory channel here backs
//! tests and local loopback transfers.

#![forbid(unsafe_code)]

pub mod channel;
pub mod error;
pub mod memory;

pub use channel::{ChannelEvent, DatagramChannel};
pub use error::NetworkError;
pub use memory::{channel_pair, MemoryChannel, MemoryChannelConfig};

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;
