//! AES-256-GCM transfer session with deterministic nonces
//!
//! A [`SessionCipher`] owns the symmetric key material for one transfer
//! session and constructs every nonce deterministically, so sender and
//! receiver agree on the nonce from the packet header alone and no nonce is
//! ever transmitted twice under the same key.
//!
//! Two constructions exist and must never share a key:
//!
//! - **Sequential**: `prefix[0..4] || sequence (u32 BE) || 0x00000000`,
//!   driven by a monotone per-session counter.
//! - **Per-chunk**: `prefix[0..4] || chunk_index (u64 BE)`, for workers
//!   encrypting disjoint chunks without sharing counter state.
//!
//! A session is constructed in exactly one mode; invoking the other mode's
//! operation returns [`CryptoError::ModeMisuse`].

use aes_gcm::{
    aead::{Aead, AeadInPlace, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{CryptoError, Result};
use crate::{KEY_LEN, NONCE_LEN, PREFIX_LEN, TAG_LEN};

/// Which nonce construction a session uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceMode {
    /// Counter-driven nonces; one monotone sequence per session
    Sequential,
    /// Nonces derived from an externally assigned chunk index
    PerChunk,
}

impl NonceMode {
    fn name(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::PerChunk => "per-chunk",
        }
    }
}

/// Symmetric session state for one transfer
///
/// Owns the 32-byte key and 8-byte random prefix provided by the
/// key-agreement layer. Key material is zeroised on drop and on
/// [`SessionCipher::reset`].
pub struct SessionCipher {
    key: [u8; KEY_LEN],
    prefix: [u8; PREFIX_LEN],
    sequence: u32,
    mode: NonceMode,
    exhausted: bool,
    closed: bool,
}

impl Zeroize for SessionCipher {
    fn zeroize(&mut self) {
        self.key.zeroize();
        self.prefix.zeroize();
        self.sequence.zeroize();
    }
}

impl Drop for SessionCipher {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl SessionCipher {
    /// Create a session using the sequential (counter) nonce construction
    ///
    /// # Arguments
    ///
    /// * `key` - 32-byte session key from the key-agreement layer
    /// * `prefix` - 8-byte random nonce prefix from the key-agreement layer
    pub fn sequential(key: [u8; KEY_LEN], prefix: [u8; PREFIX_LEN]) -> Self {
        Self::new(key, prefix, NonceMode::Sequential)
    }

    /// Create a session using the per-chunk nonce construction
    pub fn per_chunk(key: [u8; KEY_LEN], prefix: [u8; PREFIX_LEN]) -> Self {
        Self::new(key, prefix, NonceMode::PerChunk)
    }

    fn new(key: [u8; KEY_LEN], prefix: [u8; PREFIX_LEN], mode: NonceMode) -> Self {
        Self {
            key,
            prefix,
            sequence: 0,
            mode,
            exhausted: false,
            closed: false,
        }
    }

    /// Generate a fresh random 8-byte nonce prefix
    pub fn random_prefix() -> [u8; PREFIX_LEN] {
        let mut prefix = [0u8; PREFIX_LEN];
        rand::rngs::OsRng.fill_bytes(&mut prefix);
        prefix
    }

    /// The nonce mode this session was constructed with
    pub fn mode(&self) -> NonceMode {
        self.mode
    }

    /// Current sequence counter (sequential mode; next nonce to be issued)
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Zeroise key material and make the session unusable
    pub fn reset(&mut self) {
        self.zeroize();
        self.closed = true;
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(CryptoError::SessionClosed);
        }
        Ok(())
    }

    fn check_mode(&self, required: NonceMode) -> Result<()> {
        if self.mode != required {
            return Err(CryptoError::ModeMisuse {
                mode: self.mode.name(),
                required: required.name(),
            });
        }
        Ok(())
    }

    /// Take the next sequential nonce, advancing the counter exactly once.
    ///
    /// The counter is never reused: once all 2^32 values have been issued
    /// the session is exhausted and every further call fails.
    fn next_nonce(&mut self) -> Result<[u8; NONCE_LEN]> {
        if self.exhausted {
            return Err(CryptoError::NonceExhausted);
        }
        let seq = self.sequence;
        match self.sequence.checked_add(1) {
            Some(next) => self.sequence = next,
            None => self.exhausted = true,
        }
        Ok(Self::sequential_nonce(&self.prefix, seq))
    }

    /// Sequential nonce layout: `prefix[0..4] || seq (u32 BE) || 0x00000000`
    pub fn sequential_nonce(prefix: &[u8; PREFIX_LEN], sequence: u32) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&prefix[..4]);
        nonce[4..8].copy_from_slice(&sequence.to_be_bytes());
        nonce
    }

    /// Per-chunk nonce layout: `prefix[0..4] || chunk_index (u64 BE)`
    pub fn chunk_nonce(prefix: &[u8; PREFIX_LEN], chunk_index: u64) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[..4].copy_from_slice(&prefix[..4]);
        nonce[4..].copy_from_slice(&chunk_index.to_be_bytes());
        nonce
    }

    /// Encrypt a buffer region in place (sequential mode).
    ///
    /// Encrypts `buffer[data_offset..data_offset + data_len]`, increments
    /// the sequence counter exactly once, and returns the nonce (for the
    /// packet header) and the detached 16-byte tag (appended to the frame
    /// by the caller). AAD is empty.
    ///
    /// # Arguments
    ///
    /// * `buffer` - Backing buffer; the region must lie within it
    /// * `data_offset` - Start of the plaintext region
    /// * `data_len` - Length of the plaintext region
    pub fn seal_in_place(
        &mut self,
        buffer: &mut [u8],
        data_offset: usize,
        data_len: usize,
    ) -> Result<([u8; NONCE_LEN], [u8; TAG_LEN])> {
        self.check_open()?;
        self.check_mode(NonceMode::Sequential)?;
        let end = data_offset
            .checked_add(data_len)
            .ok_or(CryptoError::BufferTooSmall {
                needed: usize::MAX,
                actual: buffer.len(),
            })?;
        if end > buffer.len() {
            return Err(CryptoError::BufferTooSmall {
                needed: end,
                actual: buffer.len(),
            });
        }

        let nonce = self.next_nonce()?;
        let cipher = Aes256Gcm::new((&self.key).into());
        let tag = cipher
            .encrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                b"",
                &mut buffer[data_offset..end],
            )
            .map_err(|e| CryptoError::Encryption(format!("AES-GCM encryption failed: {}", e)))?;
        Ok((nonce, tag.into()))
    }

    /// Encrypt one chunk keyed by its index (per-chunk mode).
    ///
    /// Returns ciphertext with the authentication tag appended. Disjoint
    /// chunk indices give disjoint nonces, so independent workers can
    /// encrypt concurrently without sharing counter state.
    pub fn seal_chunk(&self, chunk_index: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.check_open()?;
        self.check_mode(NonceMode::PerChunk)?;
        let nonce = Self::chunk_nonce(&self.prefix, chunk_index);
        let cipher = Aes256Gcm::new((&self.key).into());
        cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CryptoError::Encryption(format!("AES-GCM encryption failed: {}", e)))
    }

    /// Decrypt ciphertext (with appended tag) under an explicit nonce.
    ///
    /// The receive path takes the nonce from the packet header, so this
    /// works for frames produced in either mode. Authentication failure is
    /// an error for this frame only; the session remains usable.
    pub fn open(&self, nonce: &[u8; NONCE_LEN], ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.check_open()?;
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::BufferTooSmall {
                needed: TAG_LEN,
                actual: ciphertext.len(),
            });
        }
        let cipher = Aes256Gcm::new((&self.key).into());
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| CryptoError::Decryption(format!("AES-GCM decryption failed: {}", e)))
    }

    /// Decrypt one chunk keyed by its index (per-chunk mode).
    pub fn open_chunk(&self, chunk_index: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.check_mode(NonceMode::PerChunk)?;
        let nonce = Self::chunk_nonce(&self.prefix, chunk_index);
        self.open(&nonce, ciphertext)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher")
            .field("key", &"<REDACTED>")
            .field("prefix", &"<REDACTED>")
            .field("sequence", &self.sequence)
            .field("mode", &self.mode)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
