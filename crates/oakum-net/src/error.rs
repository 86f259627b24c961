//! Network error types

use std::fmt;

/// Network layer errors
#[derive(Debug)]
pub enum NetworkError {
    /// The channel is closed; the peer is unreachable
    ChannelClosed,
    /// The transport send buffer is full; retry after a drain event
    SendBufferFull {
        /// Bytes currently queued in the send buffer
        buffered: usize,
        /// Send buffer capacity
        capacity: usize,
    },
    /// Datagram exceeds the channel's maximum datagram size
    DatagramTooLarge {
        /// Attempted datagram size
        size: usize,
        /// Maximum the channel accepts
        max: usize,
    },
    /// IO error
    Io(std::io::Error),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelClosed => write!(f, "Channel closed"),
            Self::SendBufferFull { buffered, capacity } => {
                write!(f, "Send buffer full: {} of {} bytes queued", buffered, capacity)
            }
            Self::DatagramTooLarge { size, max } => {
                write!(f, "Datagram too large: {} bytes (max {})", size, max)
            }
            Self::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for NetworkError {}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
