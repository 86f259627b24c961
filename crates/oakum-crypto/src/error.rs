//! Error types for cryptographic operations

use thiserror::Error;

/// Result type alias using CryptoError
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Error during encryption
    #[error("Encryption failed: {0}")]
    Encryption(String),

    /// Error during decryption (includes authentication-tag mismatch)
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// Invalid key material
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Sequence counter ran out; the session must be torn down and re-keyed
    #[error("Nonce space exhausted for this session key")]
    NonceExhausted,

    /// The session was reset and its key material zeroised
    #[error("Session closed")]
    SessionClosed,

    /// A sequential-mode operation was invoked on a per-chunk session or
    /// vice versa; the two nonce constructions must never share a key
    #[error("Nonce mode misuse: session is {mode}, operation requires {required}")]
    ModeMisuse {
        /// The mode the session was constructed with
        mode: &'static str,
        /// The mode the invoked operation requires
        required: &'static str,
    },

    /// Buffer size too small for operation
    #[error("Buffer too small: need {needed} bytes, got {actual}")]
    BufferTooSmall {
        /// Required buffer size
        needed: usize,
        /// Actual buffer size
        actual: usize,
    },
}
