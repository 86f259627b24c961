//! Packet framing: plain and encrypted headers
//!
//! Two self-describing frame layouts travel on the data plane. Integer
//! fields are little-endian; the nonce is raw bytes.
//!
//! Plain frame (22-byte header + payload):
//!
//! ```text
//! offset  size  field
//!  0      2     file_index          (0xFFFF = end of stream)
//!  2      4     chunk_index
//!  6      8     offset
//! 14      4     length
//! 18      4     checksum (CRC32 of payload)
//! ```
//!
//! Encrypted frame (38-byte header + ciphertext + 16-byte tag):
//!
//! ```text
//! offset  size  field
//!  0      1     version = 0x02
//!  1      1     flags (bit0 = encrypted)
//!  2      2     file_index
//!  4      4     chunk_index
//!  8      8     offset
//! 16      4     plaintext_length
//! 20     12     nonce
//! 32      6     reserved
//! ```
//!
//! A frame whose first byte is `0x02` is encrypted; anything else is plain.

use crate::{ProtocolError, Result};

/// Plain header length in bytes
pub const PLAIN_HEADER_LEN: usize = 22;

/// Encrypted header length in bytes
pub const ENCRYPTED_HEADER_LEN: usize = 38;

/// Largest header either layout uses; slots reserve this much prefix room
pub const MAX_HEADER_LEN: usize = ENCRYPTED_HEADER_LEN;

/// AES-GCM tag length appended to encrypted frames
pub const TAG_LEN: usize = oakum_crypto::TAG_LEN;

/// Nonce length carried in the encrypted header
pub const NONCE_LEN: usize = oakum_crypto::NONCE_LEN;

/// Sentinel file index marking end of stream
pub const EOS_FILE_INDEX: u16 = 0xFFFF;

/// Version byte of the encrypted layout
pub const ENCRYPTED_VERSION: u8 = 0x02;

/// Flags bit 0: payload is encrypted (must be set)
pub const FLAG_ENCRYPTED: u8 = 0b0000_0001;

/// Flags bit 1: payload is compressed (reserved)
pub const FLAG_COMPRESSED: u8 = 0b0000_0010;

/// Parsers accept payloads up to this size to support large-slot setups
pub const MAX_ACCEPTED_PAYLOAD: usize = 1024 * 1024;

/// Advisory chunk index for a byte offset
pub fn chunk_index_for(offset: u64, max_chunk_size: u32) -> u32 {
    (offset / u64::from(max_chunk_size)) as u32
}

/// Parsed plain-frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlainHeader {
    /// Logical index into the sender's file list
    pub file_index: u16,
    /// Advisory chunk index (`offset / max_chunk_size`)
    pub chunk_index: u32,
    /// Byte offset of the payload within the logical file
    pub offset: u64,
    /// Payload length in bytes
    pub length: u32,
    /// CRC32 over the payload bytes
    pub checksum: u32,
}

impl PlainHeader {
    /// Whether this frame marks end of stream
    pub fn is_eos(&self) -> bool {
        self.file_index == EOS_FILE_INDEX
    }
}

/// Parsed encrypted-frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptedHeader {
    /// Flags byte (bit 0 set)
    pub flags: u8,
    /// Logical index into the sender's file list
    pub file_index: u16,
    /// Advisory chunk index
    pub chunk_index: u32,
    /// Byte offset of the plaintext within the logical file
    pub offset: u64,
    /// Plaintext length in bytes (ciphertext is this plus the tag)
    pub plaintext_length: u32,
    /// AEAD nonce used for this frame
    pub nonce: [u8; NONCE_LEN],
}

impl EncryptedHeader {
    /// Whether this frame marks end of stream
    pub fn is_eos(&self) -> bool {
        self.file_index == EOS_FILE_INDEX
    }
}

/// Write a plain header into the first [`PLAIN_HEADER_LEN`] bytes of `buf`.
pub fn write_plain_header(buf: &mut [u8], header: &PlainHeader) {
    buf[0..2].copy_from_slice(&header.file_index.to_le_bytes());
    buf[2..6].copy_from_slice(&header.chunk_index.to_le_bytes());
    buf[6..14].copy_from_slice(&header.offset.to_le_bytes());
    buf[14..18].copy_from_slice(&header.length.to_le_bytes());
    buf[18..22].copy_from_slice(&header.checksum.to_le_bytes());
}

/// Write an encrypted header into the first [`ENCRYPTED_HEADER_LEN`] bytes
/// of `buf`. Reserved bytes are zeroed.
pub fn write_encrypted_header(buf: &mut [u8], header: &EncryptedHeader) {
    buf[0] = ENCRYPTED_VERSION;
    buf[1] = header.flags | FLAG_ENCRYPTED;
    buf[2..4].copy_from_slice(&header.file_index.to_le_bytes());
    buf[4..8].copy_from_slice(&header.chunk_index.to_le_bytes());
    buf[8..16].copy_from_slice(&header.offset.to_le_bytes());
    buf[16..20].copy_from_slice(&header.plaintext_length.to_le_bytes());
    buf[20..32].copy_from_slice(&header.nonce);
    buf[32..ENCRYPTED_HEADER_LEN].fill(0);
}

/// Encode a standalone plain frame from a payload.
///
/// The slot pool writes headers in place for the hot path; this allocating
/// variant serves control paths and tests.
pub fn encode_plain(payload: &[u8], file_index: u16, offset: u64, max_chunk_size: u32) -> Vec<u8> {
    let header = PlainHeader {
        file_index,
        chunk_index: chunk_index_for(offset, max_chunk_size),
        offset,
        length: payload.len() as u32,
        checksum: crc32fast::hash(payload),
    };
    let mut frame = vec![0u8; PLAIN_HEADER_LEN + payload.len()];
    write_plain_header(&mut frame, &header);
    frame[PLAIN_HEADER_LEN..].copy_from_slice(payload);
    frame
}

/// Encode the end-of-stream frame (plain layout, empty payload).
pub fn encode_eos() -> Vec<u8> {
    let mut frame = vec![0u8; PLAIN_HEADER_LEN];
    write_plain_header(
        &mut frame,
        &PlainHeader {
            file_index: EOS_FILE_INDEX,
            chunk_index: 0,
            offset: 0,
            length: 0,
            checksum: crc32fast::hash(&[]),
        },
    );
    frame
}

/// Parse a plain frame, validating structural consistency.
pub fn parse_plain(frame: &[u8]) -> Result<PlainHeader> {
    if frame.len() < PLAIN_HEADER_LEN {
        return Err(ProtocolError::MalformedFrame(format!(
            "{} bytes, need at least {}",
            frame.len(),
            PLAIN_HEADER_LEN
        )));
    }
    let header = PlainHeader {
        file_index: u16::from_le_bytes([frame[0], frame[1]]),
        chunk_index: u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]),
        offset: u64::from_le_bytes([
            frame[6], frame[7], frame[8], frame[9], frame[10], frame[11], frame[12], frame[13],
        ]),
        length: u32::from_le_bytes([frame[14], frame[15], frame[16], frame[17]]),
        checksum: u32::from_le_bytes([frame[18], frame[19], frame[20], frame[21]]),
    };
    if header.length as usize > MAX_ACCEPTED_PAYLOAD {
        return Err(ProtocolError::MalformedFrame(format!(
            "payload length {} exceeds cap",
            header.length
        )));
    }
    if frame.len() != PLAIN_HEADER_LEN + header.length as usize {
        return Err(ProtocolError::MalformedFrame(format!(
            "frame is {} bytes but header declares {} payload bytes",
            frame.len(),
            header.length
        )));
    }
    if header.is_eos() && header.length != 0 {
        return Err(ProtocolError::MalformedFrame(
            "end-of-stream frame with non-empty payload".into(),
        ));
    }
    Ok(header)
}

/// Payload bytes of a parsed plain frame
pub fn plain_payload(frame: &[u8]) -> &[u8] {
    &frame[PLAIN_HEADER_LEN..]
}

/// Parse a plain frame and recompute its CRC32.
pub fn verify_plain(frame: &[u8]) -> bool {
    match parse_plain(frame) {
        Ok(header) => crc32fast::hash(plain_payload(frame)) == header.checksum,
        Err(_) => false,
    }
}

/// Whether this frame is the end-of-stream marker
pub fn is_eos(frame: &[u8]) -> bool {
    frame.len() >= 2 && u16::from_le_bytes([frame[0], frame[1]]) == EOS_FILE_INDEX
}

/// Whether this frame uses the encrypted layout
pub fn is_encrypted(frame: &[u8]) -> bool {
    !frame.is_empty() && frame[0] == ENCRYPTED_VERSION
}

/// Parse an encrypted frame header, validating version, flags, and sizing.
pub fn parse_encrypted(frame: &[u8]) -> Result<EncryptedHeader> {
    if frame.len() < ENCRYPTED_HEADER_LEN {
        return Err(ProtocolError::MalformedFrame(format!(
            "{} bytes, need at least {}",
            frame.len(),
            ENCRYPTED_HEADER_LEN
        )));
    }
    if frame[0] != ENCRYPTED_VERSION {
        return Err(ProtocolError::MalformedFrame(format!(
            "unknown version byte {:#04x}",
            frame[0]
        )));
    }
    let flags = frame[1];
    if flags & FLAG_ENCRYPTED == 0 {
        return Err(ProtocolError::MalformedFrame(
            "encrypted layout without the encrypted flag".into(),
        ));
    }
    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&frame[20..32]);
    let header = EncryptedHeader {
        flags,
        file_index: u16::from_le_bytes([frame[2], frame[3]]),
        chunk_index: u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]),
        offset: u64::from_le_bytes([
            frame[8], frame[9], frame[10], frame[11], frame[12], frame[13], frame[14], frame[15],
        ]),
        plaintext_length: u32::from_le_bytes([frame[16], frame[17], frame[18], frame[19]]),
        nonce,
    };
    if header.plaintext_length as usize > MAX_ACCEPTED_PAYLOAD {
        return Err(ProtocolError::MalformedFrame(format!(
            "plaintext length {} exceeds cap",
            header.plaintext_length
        )));
    }
    let expected = ENCRYPTED_HEADER_LEN + header.plaintext_length as usize + TAG_LEN;
    if frame.len() != expected {
        return Err(ProtocolError::MalformedFrame(format!(
            "frame is {} bytes but header implies {}",
            frame.len(),
            expected
        )));
    }
    if header.is_eos() && header.plaintext_length != 0 {
        return Err(ProtocolError::MalformedFrame(
            "end-of-stream frame with non-empty payload".into(),
        ));
    }
    Ok(header)
}

/// Ciphertext plus tag of a parsed encrypted frame
pub fn encrypted_ciphertext(frame: &[u8]) -> &[u8] {
    &frame[ENCRYPTED_HEADER_LEN..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_roundtrip() {
        let payload = b"twenty-two header bytes";
        let frame = encode_plain(payload, 3, 128 * 1024, 64 * 1024);
        assert_eq!(frame.len(), PLAIN_HEADER_LEN + payload.len());

        let header = parse_plain(&frame).unwrap();
        assert_eq!(header.file_index, 3);
        assert_eq!(header.chunk_index, 2);
        assert_eq!(header.offset, 128 * 1024);
        assert_eq!(header.length as usize, payload.len());
        assert_eq!(plain_payload(&frame), payload);
        assert!(verify_plain(&frame));
    }

    #[test]
    fn test_parse_rejects_short_frame() {
        assert!(parse_plain(&[0u8; 21]).is_err());
    }

    #[test]
    fn test_parse_rejects_length_mismatch() {
        let mut frame = encode_plain(b"abc", 0, 0, 64 * 1024);
        frame.push(0); // trailing junk
        assert!(parse_plain(&frame).is_err());
    }

    #[test]
    fn test_verify_detects_corruption() {
        let mut frame = encode_plain(b"payload bytes", 0, 0, 64 * 1024);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(!verify_plain(&frame));
    }

    #[test]
    fn test_zero_length_payload_is_valid() {
        let frame = encode_plain(&[], 7, 0, 64 * 1024);
        let header = parse_plain(&frame).unwrap();
        assert_eq!(header.length, 0);
        assert!(verify_plain(&frame));
    }

    #[test]
    fn test_eos_detection() {
        let frame = encode_eos();
        assert!(is_eos(&frame));
        assert!(parse_plain(&frame).unwrap().is_eos());
        assert!(!is_eos(&encode_plain(b"x", 0, 0, 64 * 1024)));
        assert!(!is_eos(&[0xFF]));
    }

    #[test]
    fn test_eos_with_payload_is_malformed() {
        let frame = encode_plain(b"junk", EOS_FILE_INDEX, 0, 64 * 1024);
        assert!(parse_plain(&frame).is_err());
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut frame = vec![0u8; PLAIN_HEADER_LEN];
        write_plain_header(
            &mut frame,
            &PlainHeader {
                file_index: 0,
                chunk_index: 0,
                offset: 0,
                length: (MAX_ACCEPTED_PAYLOAD + 1) as u32,
                checksum: 0,
            },
        );
        assert!(parse_plain(&frame).is_err());
    }

    #[test]
    fn test_encrypted_header_roundtrip() {
        let header = EncryptedHeader {
            flags: FLAG_ENCRYPTED,
            file_index: 1,
            chunk_index: 5,
            offset: 5 * 64 * 1024,
            plaintext_length: 9,
            nonce: [7u8; NONCE_LEN],
        };
        let mut frame = vec![0u8; ENCRYPTED_HEADER_LEN + 9 + TAG_LEN];
        write_encrypted_header(&mut frame, &header);
        assert!(is_encrypted(&frame));

        let parsed = parse_encrypted(&frame).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(encrypted_ciphertext(&frame).len(), 9 + TAG_LEN);
    }

    #[test]
    fn test_encrypted_rejects_bad_version_and_flags() {
        let header = EncryptedHeader {
            flags: FLAG_ENCRYPTED,
            file_index: 0,
            chunk_index: 0,
            offset: 0,
            plaintext_length: 0,
            nonce: [0u8; NONCE_LEN],
        };
        let mut frame = vec![0u8; ENCRYPTED_HEADER_LEN + TAG_LEN];
        write_encrypted_header(&mut frame, &header);

        let mut bad_version = frame.clone();
        bad_version[0] = 0x03;
        assert!(parse_encrypted(&bad_version).is_err());

        let mut bad_flags = frame;
        bad_flags[1] = 0;
        assert!(parse_encrypted(&bad_flags).is_err());
    }

    #[test]
    fn test_encrypted_size_must_match_header() {
        let header = EncryptedHeader {
            flags: FLAG_ENCRYPTED,
            file_index: 0,
            chunk_index: 0,
            offset: 0,
            plaintext_length: 32,
            nonce: [0u8; NONCE_LEN],
        };
        let mut frame = vec![0u8; ENCRYPTED_HEADER_LEN + 31 + TAG_LEN];
        write_encrypted_header(&mut frame, &header);
        assert!(parse_encrypted(&frame).is_err());
    }
}
