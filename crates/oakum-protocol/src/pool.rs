//! Pre-allocated packet slot pool
//!
//! One contiguous arena divided into fixed-size slots. A producer acquires
//! a slot, writes payload bytes into its data region, and commits; commit
//! writes the frame header into the slot prefix (and for encrypted commits
//! runs the AEAD in place and appends the tag), so the finished packet is a
//! single contiguous region handed to the transport without copying.
//!
//! Every slot carries a generation counter bumped on release. Handles carry
//! the generation they were issued under; a commit or view with a stale
//! generation resolves to the 0/empty sentinel and never touches the slot's
//! current tenant. The pool is owned by the sender task; calls are never
//! concurrent.
//!
//! Slot layout (`S` = slot start):
//!
//! ```text
//! S        S+16       S+38                     S+38+len
//! |        |          |                        |
//! | enc hdr| plain hdr|  payload ...           | tag (encrypted only)
//! ```
//!
//! A plain commit writes its 22-byte header at `S+16`; an encrypted commit
//! writes its 38-byte header at `S`. Either way header and payload are
//! contiguous.

use bytes::Bytes;
use oakum_crypto::{CryptoError, SessionCipher};

use crate::config::TransferConfig;
use crate::wire::frame::{
    self, EncryptedHeader, PlainHeader, ENCRYPTED_HEADER_LEN, FLAG_ENCRYPTED, MAX_HEADER_LEN,
    PLAIN_HEADER_LEN, TAG_LEN,
};
use crate::{ProtocolError, Result};

/// Offset of the plain header within a slot
const PLAIN_HEADER_OFFSET: usize = MAX_HEADER_LEN - PLAIN_HEADER_LEN;

/// Lifecycle state of one slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Unowned; available to `acquire`
    Free,
    /// Handed to a producer; payload region writable
    Acquired,
    /// Framed packet ready; readable via `packet_view`
    Committed,
}

#[derive(Debug, Clone, Copy)]
struct SlotMeta {
    state: SlotState,
    generation: u32,
    packet_start: usize,
    packet_len: usize,
}

/// Handle returned by `acquire`; the generation pins it to one tenancy
#[derive(Debug, Clone, Copy)]
pub struct SlotGrant {
    /// Slot index
    pub slot: u32,
    /// Generation the grant was issued under
    pub generation: u32,
    /// Maximum payload bytes this slot accepts
    pub capacity: usize,
}

/// One element of a batch commit
#[derive(Debug, Clone, Copy)]
pub struct CommitRequest {
    /// Slot index
    pub slot: u32,
    /// Generation from the grant
    pub generation: u32,
    /// Payload bytes written by the producer
    pub data_len: usize,
    /// Logical file the payload belongs to
    pub file_index: u16,
    /// Byte offset of the payload within that file
    pub offset: u64,
}

/// Counter snapshot of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total slots in the arena
    pub slot_count: usize,
    /// Slots currently free
    pub free_slots: usize,
    /// Sum of `packet_len` over committed slots
    pub committed_bytes: u64,
    /// Cumulative bytes ever committed
    pub total_bytes: u64,
}

/// Fixed-size slot pool backed by one contiguous arena
pub struct SlotPool {
    arena: Vec<u8>,
    slots: Vec<SlotMeta>,
    free: Vec<u32>,
    slot_size: usize,
    max_chunk_size: u32,
    committed_bytes: u64,
    total_bytes: u64,
}

impl SlotPool {
    /// Build a pool from a validated configuration.
    pub fn new(config: &TransferConfig) -> Result<Self> {
        config.validate()?;
        Self::with_geometry(config.slot_count, config.slot_size, config.max_chunk_size)
    }

    /// Build a pool with explicit geometry.
    ///
    /// # Arguments
    ///
    /// * `slot_count` - Number of slots
    /// * `slot_size` - Bytes per slot; must fit header + payload + tag
    /// * `max_chunk_size` - Used for advisory chunk indices in headers
    pub fn with_geometry(slot_count: usize, slot_size: usize, max_chunk_size: u32) -> Result<Self> {
        if slot_count == 0 || slot_size < MAX_HEADER_LEN + TAG_LEN + 1 {
            return Err(ProtocolError::InvalidConfig(format!(
                "unusable pool geometry: {} slots of {} bytes",
                slot_count, slot_size
            )));
        }
        Ok(Self {
            arena: vec![0u8; slot_count * slot_size],
            slots: vec![
                SlotMeta {
                    state: SlotState::Free,
                    generation: 0,
                    packet_start: 0,
                    packet_len: 0,
                };
                slot_count
            ],
            // Reverse so slot 0 is handed out first; purely cosmetic order.
            free: (0..slot_count as u32).rev().collect(),
            slot_size,
            max_chunk_size,
            committed_bytes: 0,
            total_bytes: 0,
        })
    }

    /// Maximum payload bytes any slot accepts
    pub fn slot_capacity(&self) -> usize {
        self.slot_size - MAX_HEADER_LEN - TAG_LEN
    }

    fn slot_start(&self, slot: u32) -> usize {
        slot as usize * self.slot_size
    }

    fn check(&self, slot: u32, generation: u32, state: SlotState) -> bool {
        match self.slots.get(slot as usize) {
            Some(meta) => meta.generation == generation && meta.state == state,
            None => false,
        }
    }

    /// Take a free slot, or `None` when the pool is saturated.
    ///
    /// Saturation is transient: the caller yields and retries after the
    /// next `release`.
    pub fn acquire(&mut self) -> Option<SlotGrant> {
        let slot = self.free.pop()?;
        let meta = &mut self.slots[slot as usize];
        meta.state = SlotState::Acquired;
        Some(SlotGrant {
            slot,
            generation: meta.generation,
            capacity: self.slot_size - MAX_HEADER_LEN - TAG_LEN,
        })
    }

    /// Take up to `count` free slots.
    pub fn acquire_batch(&mut self, count: usize) -> Vec<SlotGrant> {
        let mut grants = Vec::with_capacity(count.min(self.free.len()));
        for _ in 0..count {
            match self.acquire() {
                Some(grant) => grants.push(grant),
                None => break,
            }
        }
        grants
    }

    /// Writable payload region of an acquired slot.
    pub fn payload_mut(&mut self, slot: u32, generation: u32) -> Option<&mut [u8]> {
        if !self.check(slot, generation, SlotState::Acquired) {
            return None;
        }
        let start = self.slot_start(slot) + MAX_HEADER_LEN;
        let end = self.slot_start(slot) + self.slot_size - TAG_LEN;
        Some(&mut self.arena[start..end])
    }

    /// Commit an acquired slot as a plain frame.
    ///
    /// Computes CRC32 over the payload and writes the 22-byte header
    /// immediately before it. Returns the packet length, or 0 when the
    /// generation is stale (the slot is left untouched).
    pub fn commit_plain(
        &mut self,
        slot: u32,
        data_len: usize,
        file_index: u16,
        offset: u64,
        generation: u32,
    ) -> usize {
        if !self.check(slot, generation, SlotState::Acquired) || data_len > self.slot_capacity() {
            return 0;
        }
        let start = self.slot_start(slot);
        let data_start = start + MAX_HEADER_LEN;
        let checksum = crc32fast::hash(&self.arena[data_start..data_start + data_len]);
        let header = PlainHeader {
            file_index,
            chunk_index: frame::chunk_index_for(offset, self.max_chunk_size),
            offset,
            length: data_len as u32,
            checksum,
        };
        let header_start = start + PLAIN_HEADER_OFFSET;
        frame::write_plain_header(&mut self.arena[header_start..data_start], &header);

        let packet_len = PLAIN_HEADER_LEN + data_len;
        let meta = &mut self.slots[slot as usize];
        meta.state = SlotState::Committed;
        meta.packet_start = header_start;
        meta.packet_len = packet_len;
        self.committed_bytes += packet_len as u64;
        self.total_bytes += packet_len as u64;
        packet_len
    }

    /// Commit an acquired slot as an encrypted frame.
    ///
    /// Encrypts the payload region in place through `session`, appends the
    /// tag, and writes the 38-byte header at the slot start. Returns
    /// `Ok(0)` on a stale generation; cryptographic failure (counter
    /// exhaustion) is session-fatal and propagates.
    pub fn commit_encrypted(
        &mut self,
        slot: u32,
        data_len: usize,
        file_index: u16,
        offset: u64,
        session: &mut SessionCipher,
        generation: u32,
    ) -> Result<usize> {
        if !self.check(slot, generation, SlotState::Acquired) || data_len > self.slot_capacity() {
            return Ok(0);
        }
        let start = self.slot_start(slot);
        let data_start = start + MAX_HEADER_LEN;

        let (nonce, tag) = session
            .seal_in_place(&mut self.arena, data_start, data_len)
            .map_err(|e| match e {
                CryptoError::NonceExhausted => {
                    ProtocolError::SessionFailure("nonce space exhausted".into())
                }
                other => ProtocolError::SessionFailure(other.to_string()),
            })?;
        self.arena[data_start + data_len..data_start + data_len + TAG_LEN].copy_from_slice(&tag);

        let header = EncryptedHeader {
            flags: FLAG_ENCRYPTED,
            file_index,
            chunk_index: frame::chunk_index_for(offset, self.max_chunk_size),
            offset,
            plaintext_length: data_len as u32,
            nonce,
        };
        frame::write_encrypted_header(&mut self.arena[start..data_start], &header);

        let packet_len = ENCRYPTED_HEADER_LEN + data_len + TAG_LEN;
        let meta = &mut self.slots[slot as usize];
        meta.state = SlotState::Committed;
        meta.packet_start = start;
        meta.packet_len = packet_len;
        self.committed_bytes += packet_len as u64;
        self.total_bytes += packet_len as u64;
        Ok(packet_len)
    }

    /// Commit a batch of plain frames; each element resolves independently.
    ///
    /// The returned vector is parallel to `requests`; stale elements yield 0.
    pub fn commit_plain_batch(&mut self, requests: &[CommitRequest]) -> Vec<usize> {
        requests
            .iter()
            .map(|r| self.commit_plain(r.slot, r.data_len, r.file_index, r.offset, r.generation))
            .collect()
    }

    /// Commit a batch of encrypted frames.
    ///
    /// Stale elements yield 0 like the plain variant; a cryptographic
    /// failure aborts the batch, as it is fatal for the whole session.
    pub fn commit_encrypted_batch(
        &mut self,
        requests: &[CommitRequest],
        session: &mut SessionCipher,
    ) -> Result<Vec<usize>> {
        requests
            .iter()
            .map(|r| {
                self.commit_encrypted(r.slot, r.data_len, r.file_index, r.offset, session, r.generation)
            })
            .collect()
    }

    /// Finished packet bytes of a committed slot.
    pub fn packet_view(&self, slot: u32, generation: u32) -> Option<&[u8]> {
        if !self.check(slot, generation, SlotState::Committed) {
            return None;
        }
        let meta = &self.slots[slot as usize];
        Some(&self.arena[meta.packet_start..meta.packet_start + meta.packet_len])
    }

    /// Owned copy of a committed packet, for handing to a transport that
    /// outlives the slot tenancy.
    pub fn packet_bytes(&self, slot: u32, generation: u32) -> Option<Bytes> {
        self.packet_view(slot, generation)
            .map(Bytes::copy_from_slice)
    }

    /// Return a slot to the free list, bumping its generation.
    ///
    /// Releasing a free slot is a no-op.
    pub fn release(&mut self, slot: u32) {
        let Some(meta) = self.slots.get_mut(slot as usize) else {
            return;
        };
        if meta.state == SlotState::Free {
            return;
        }
        if meta.state == SlotState::Committed {
            self.committed_bytes -= meta.packet_len as u64;
        }
        meta.state = SlotState::Free;
        meta.generation = meta.generation.wrapping_add(1);
        meta.packet_len = 0;
        self.free.push(slot);
    }

    /// Release a batch of slots.
    pub fn release_batch(&mut self, slots: &[u32]) {
        for &slot in slots {
            self.release(slot);
        }
    }

    /// Release every slot and invalidate all outstanding handles.
    ///
    /// Used by `abort()`: any in-flight worker result carrying an old
    /// generation is rejected by the guard afterwards.
    pub fn drain(&mut self) {
        for slot in 0..self.slots.len() as u32 {
            self.release(slot);
        }
    }

    /// Slots currently free
    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            slot_count: self.slots.len(),
            free_slots: self.free.len(),
            committed_bytes: self.committed_bytes,
            total_bytes: self.total_bytes,
        }
    }
}
