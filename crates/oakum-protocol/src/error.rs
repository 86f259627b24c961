//! Protocol error types

use std::fmt;

/// Protocol-layer errors
#[derive(Debug)]
pub enum ProtocolError {
    /// Frame too short, length fields inconsistent, or bad version byte
    MalformedFrame(String),
    /// Plain-frame CRC32 did not match the payload
    ChecksumMismatch {
        /// Checksum carried in the header
        expected: u32,
        /// Checksum recomputed over the payload
        actual: u32,
    },
    /// AEAD authentication failed for one frame
    DecryptionFailure(String),
    /// Session-fatal cryptographic failure (e.g. nonce exhaustion)
    SessionFailure(String),
    /// Control message was not valid JSON or had an unknown shape
    InvalidControl(String),
    /// Configuration rejected by validation
    InvalidConfig(String),
    /// Forward-error-correction encode/decode failure
    Fec(String),
    /// Peer table is at capacity or the peer is unknown
    PeerRejected(String),
    /// Transfer failed
    TransferFailed(String),
    /// The transport channel reported an error
    Channel(oakum_net::NetworkError),
    /// IO error
    Io(std::io::Error),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedFrame(msg) => write!(f, "Malformed frame: {}", msg),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "Checksum mismatch: header={:#010x}, payload={:#010x}", expected, actual)
            }
            Self::DecryptionFailure(msg) => write!(f, "Decryption failure: {}", msg),
            Self::SessionFailure(msg) => write!(f, "Session failure: {}", msg),
            Self::InvalidControl(msg) => write!(f, "Invalid control message: {}", msg),
            Self::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Self::Fec(msg) => write!(f, "FEC error: {}", msg),
            Self::PeerRejected(msg) => write!(f, "Peer rejected: {}", msg),
            Self::TransferFailed(msg) => write!(f, "Transfer failed: {}", msg),
            Self::Channel(err) => write!(f, "Channel error: {}", err),
            Self::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<oakum_net::NetworkError> for ProtocolError {
    fn from(err: oakum_net::NetworkError) -> Self {
        Self::Channel(err)
    }
}
