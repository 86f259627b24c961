//! # Oakum Cryptography Library
//!
//! Symmetric transfer-session cryptography for the Oakum streaming engine:
//! AES-256-GCM with deterministic nonce construction, in-place packet
//! encryption, and automatic zeroisation of session key material.
//!
//! Key agreement is not performed here. The enclosing application derives a
//! 32-byte session key and an 8-byte random nonce prefix (typically via
//! ECDH + HKDF) and hands both to [`SessionCipher`].

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod error;
pub mod session;

pub use error::{CryptoError, Result};
pub use session::{NonceMode, SessionCipher};

/// Session key length in bytes (AES-256)
pub const KEY_LEN: usize = 32;

/// Random nonce-prefix length in bytes
pub const PREFIX_LEN: usize = 8;

/// AES-GCM nonce length in bytes
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length in bytes
pub const TAG_LEN: usize = 16;
