//! Out-of-order chunk reassembly
//!
//! Restores byte-offset-ordered delivery of chunks arriving from a
//! parallelised sender or a lossy, reordering transport. Memory is bounded
//! two ways: a high-water mark evicts the oldest buffered entries, and a
//! staleness sweep expires entries past their TTL. Evicted bytes are
//! treated as lost; recovery belongs to the layers around this one.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::TransferConfig;

/// Eviction drains usage to this fraction of the high-water mark
const EVICT_TARGET_NUM: usize = 4;
const EVICT_TARGET_DEN: usize = 5;

#[derive(Debug)]
struct PendingChunk {
    bytes: Bytes,
    inserted: Instant,
}

/// Counter snapshot of the buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReorderStats {
    /// Bytes currently buffered out of order
    pub buffered_bytes: usize,
    /// Entries currently buffered
    pub pending_entries: usize,
    /// Bytes delivered in order so far
    pub total_processed: u64,
    /// Duplicate chunks dropped
    pub duplicates: u64,
    /// Entries evicted by the high-water mark
    pub evicted_entries: u64,
    /// Entries expired by the staleness sweep
    pub expired_entries: u64,
}

/// Offset-keyed reorder buffer with bounded memory
#[derive(Debug)]
pub struct ReorderBuffer {
    next_expected: u64,
    pending: BTreeMap<u64, PendingChunk>,
    buffered_bytes: usize,
    total_processed: u64,
    high_water: usize,
    ttl: Duration,
    duplicates: u64,
    evicted_entries: u64,
    expired_entries: u64,
}

impl ReorderBuffer {
    /// Create a buffer with the configured bounds.
    pub fn new(config: &TransferConfig) -> Self {
        Self::with_bounds(config.reorder_high_water, config.reorder_ttl)
    }

    /// Create a buffer with explicit bounds.
    pub fn with_bounds(high_water: usize, ttl: Duration) -> Self {
        Self {
            next_expected: 0,
            pending: BTreeMap::new(),
            buffered_bytes: 0,
            total_processed: 0,
            high_water,
            ttl,
            duplicates: 0,
            evicted_entries: 0,
            expired_entries: 0,
        }
    }

    /// Next byte offset the consumer is waiting for
    pub fn next_expected(&self) -> u64 {
        self.next_expected
    }

    /// Bytes currently buffered out of order
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// Accept a chunk at a byte offset; returns every chunk now deliverable
    /// in order.
    ///
    /// Duplicates (entirely below the delivery point) are dropped and the
    /// call is idempotent. A chunk straddling the delivery point is split:
    /// the already-delivered head is discarded, the tail retained. Chunks
    /// beyond the delivery point are buffered, evicting the oldest entries
    /// first if the high-water mark would be breached.
    pub fn push(&mut self, offset: u64, bytes: Bytes) -> Vec<Bytes> {
        let mut offset = offset;
        let mut bytes = bytes;
        let end = offset + bytes.len() as u64;

        if end <= self.next_expected {
            self.duplicates += 1;
            return Vec::new();
        }
        if offset < self.next_expected {
            // Straddles the delivery point: drop the duplicate head.
            let skip = (self.next_expected - offset) as usize;
            bytes = bytes.slice(skip..);
            offset = self.next_expected;
        }

        if offset > self.next_expected {
            self.buffer_chunk(offset, bytes);
            return Vec::new();
        }

        let mut out = Vec::with_capacity(1 + self.pending.len());
        self.total_processed += bytes.len() as u64;
        self.next_expected += bytes.len() as u64;
        out.push(bytes);
        self.drain_contiguous(&mut out);
        out
    }

    /// Move every now-contiguous pending entry into `out`.
    fn drain_contiguous(&mut self, out: &mut Vec<Bytes>) {
        while let Some((&offset, _)) = self.pending.first_key_value() {
            if offset > self.next_expected {
                break;
            }
            let chunk = self.pending.remove(&offset).map(|p| p.bytes).unwrap_or_default();
            self.buffered_bytes -= chunk.len();
            let end = offset + chunk.len() as u64;
            if end <= self.next_expected {
                // Fully overtaken by an overlapping earlier delivery.
                self.duplicates += 1;
                continue;
            }
            let chunk = if offset < self.next_expected {
                chunk.slice((self.next_expected - offset) as usize..)
            } else {
                chunk
            };
            self.total_processed += chunk.len() as u64;
            self.next_expected += chunk.len() as u64;
            out.push(chunk);
        }
    }

    fn buffer_chunk(&mut self, offset: u64, bytes: Bytes) {
        if self.pending.contains_key(&offset) {
            // Same offset buffered twice; keep the first arrival.
            self.duplicates += 1;
            return;
        }
        if self.buffered_bytes + bytes.len() > self.high_water {
            self.evict_oldest(bytes.len());
        }
        self.buffered_bytes += bytes.len();
        self.pending.insert(
            offset,
            PendingChunk {
                bytes,
                inserted: Instant::now(),
            },
        );
    }

    /// Evict oldest-inserted entries until usage sits at or below 80% of
    /// the high-water mark.
    fn evict_oldest(&mut self, incoming: usize) {
        let target = self.high_water / EVICT_TARGET_DEN * EVICT_TARGET_NUM;
        let mut evicted = 0u64;
        let mut freed = 0usize;
        while self.buffered_bytes > target {
            let Some((&offset, _)) = self
                .pending
                .iter()
                .min_by_key(|(_, chunk)| chunk.inserted)
            else {
                break;
            };
            let chunk = self.pending.remove(&offset).map(|p| p.bytes).unwrap_or_default();
            self.buffered_bytes -= chunk.len();
            freed += chunk.len();
            evicted += 1;
        }
        self.evicted_entries += evicted;
        tracing::warn!(
            evicted,
            freed_bytes = freed,
            incoming_bytes = incoming,
            buffered_bytes = self.buffered_bytes,
            "reorder buffer breached high-water mark, evicted oldest entries"
        );
    }

    /// Expire entries older than the TTL. Returns the number removed.
    ///
    /// The owning task runs this on a fixed cadence; expiry trades data
    /// loss for bounded memory and does not retransmit.
    pub fn sweep(&mut self) -> usize {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, chunk)| now.duration_since(chunk.inserted) > self.ttl)
            .map(|(&offset, _)| offset)
            .collect();
        for offset in &expired {
            if let Some(chunk) = self.pending.remove(offset) {
                self.buffered_bytes -= chunk.bytes.len();
            }
        }
        if !expired.is_empty() {
            self.expired_entries += expired.len() as u64;
            tracing::warn!(
                expired = expired.len(),
                "reorder buffer expired stale entries"
            );
        }
        expired.len()
    }

    /// Counter snapshot
    pub fn stats(&self) -> ReorderStats {
        ReorderStats {
            buffered_bytes: self.buffered_bytes,
            pending_entries: self.pending.len(),
            total_processed: self.total_processed,
            duplicates: self.duplicates,
            evicted_entries: self.evicted_entries,
            expired_entries: self.expired_entries,
        }
    }
}
