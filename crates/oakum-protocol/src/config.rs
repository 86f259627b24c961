//! Transfer configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{ProtocolError, Result};
use crate::wire::frame::{MAX_ACCEPTED_PAYLOAD, MAX_HEADER_LEN, TAG_LEN};

/// Default per-frame payload cap (64 KiB)
fn default_max_chunk_size() -> u32 {
    64 * 1024
}

/// Default slot count
fn default_slot_count() -> usize {
    256
}

/// Slot geometry headroom beyond the payload (header + tag + slack)
pub const SLOT_OVERHEAD: usize = 64;

/// Default slot size: default payload cap plus overhead
fn default_slot_size() -> usize {
    default_max_chunk_size() as usize + SLOT_OVERHEAD
}

/// Tunables for one transfer session.
///
/// Durations deserialize from integer milliseconds. `Default` produces the
/// documented defaults; call [`TransferConfig::validate`] after loading
/// external values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Sender's per-frame payload cap in bytes
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u32,
    /// Number of slots in the packet pool
    #[serde(default = "default_slot_count")]
    pub slot_count: usize,
    /// Size of each slot in bytes (must fit header + payload + tag)
    #[serde(default = "default_slot_size")]
    pub slot_size: usize,
    /// Sender transport watermark: request more below this
    pub buffer_low: usize,
    /// Sender transport watermark: throttle at or above this
    pub buffer_high: usize,
    /// Receiver sink watermark: resume at or below this
    pub write_low: usize,
    /// Receiver sink watermark: pause at or above this
    pub write_high: usize,
    /// Receiver drains ordered bytes to the sink in batches of at least this
    pub write_batch: usize,
    /// Reordering buffer high-water mark in bytes
    pub reorder_high_water: usize,
    /// Reordering entry time-to-live (ms)
    #[serde(with = "duration_ms")]
    pub reorder_ttl: Duration,
    /// Cadence of the reordering staleness sweep (ms)
    #[serde(with = "duration_ms")]
    pub reorder_sweep_interval: Duration,
    /// How long to wait for stragglers before starting a 1:N batch (ms)
    #[serde(with = "duration_ms")]
    pub ready_wait: Duration,
    /// How long a peer may stay in Connecting before removal (ms)
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
    /// Keep-alive cadence while idle (ms)
    #[serde(with = "duration_ms")]
    pub keep_alive_interval: Duration,
    /// Hard cap on simultaneously connected peers
    pub max_direct_peers: usize,
    /// DOWNLOAD_COMPLETE retransmission count
    pub complete_ack_repeats: u32,
    /// Spacing between DOWNLOAD_COMPLETE retransmissions (ms)
    #[serde(with = "duration_ms")]
    pub complete_ack_spacing: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        let max_chunk_size = default_max_chunk_size();
        Self {
            max_chunk_size,
            slot_count: default_slot_count(),
            slot_size: max_chunk_size as usize + SLOT_OVERHEAD,
            buffer_low: 1024 * 1024,
            buffer_high: 4 * 1024 * 1024,
            write_low: 16 * 1024 * 1024,
            write_high: 32 * 1024 * 1024,
            write_batch: 8 * 1024 * 1024,
            reorder_high_water: 128 * 1024 * 1024,
            reorder_ttl: Duration::from_secs(30),
            reorder_sweep_interval: Duration::from_secs(5),
            ready_wait: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(5),
            max_direct_peers: 3,
            complete_ack_repeats: 3,
            complete_ack_spacing: Duration::from_millis(100),
        }
    }
}

impl TransferConfig {
    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 {
            return Err(ProtocolError::InvalidConfig("max_chunk_size must be non-zero".into()));
        }
        if self.max_chunk_size as usize > MAX_ACCEPTED_PAYLOAD {
            return Err(ProtocolError::InvalidConfig(format!(
                "max_chunk_size {} exceeds the {} byte frame cap",
                self.max_chunk_size, MAX_ACCEPTED_PAYLOAD
            )));
        }
        if self.slot_count == 0 {
            return Err(ProtocolError::InvalidConfig("slot_count must be non-zero".into()));
        }
        let needed = self.max_chunk_size as usize + MAX_HEADER_LEN + TAG_LEN;
        if self.slot_size < needed {
            return Err(ProtocolError::InvalidConfig(format!(
                "slot_size {} cannot hold header + {} byte payload + tag ({} needed)",
                self.slot_size, self.max_chunk_size, needed
            )));
        }
        if self.buffer_low >= self.buffer_high {
            return Err(ProtocolError::InvalidConfig(
                "buffer_low must be below buffer_high".into(),
            ));
        }
        if self.write_low >= self.write_high {
            return Err(ProtocolError::InvalidConfig(
                "write_low must be below write_high".into(),
            ));
        }
        if self.max_direct_peers == 0 || self.max_direct_peers > 3 {
            return Err(ProtocolError::InvalidConfig(
                "max_direct_peers must be between 1 and 3".into(),
            ));
        }
        Ok(())
    }
}

/// Serialize/deserialize `Duration` as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
