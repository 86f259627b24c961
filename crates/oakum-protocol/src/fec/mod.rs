//! Forward error correction
//!
//! Reed-Solomon block coding over GF(2^8): every block covers `K` data
//! shards and adds `M` parity shards, and any `K` of the `K + M` shards
//! reconstruct the data. An adaptive controller widens or narrows the
//! data-to-parity ratio from measured loss, trading bandwidth for loss
//! tolerance. FEC sits between the sender engine and the transport when
//! enabled; blocks that cannot be reconstructed in time are abandoned, and
//! recovery beyond that belongs to the enclosing transport.

pub mod adaptive;
pub mod decoder;
pub mod encoder;

pub use adaptive::AdaptiveParity;
pub use decoder::{FecDecoder, FecStats};
pub use encoder::FecEncoder;

use crate::{ProtocolError, Result};

/// Block geometry: data shards, parity shards, shard size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecConfig {
    /// Data shards per block (K)
    pub data_shards: usize,
    /// Parity shards per block (M)
    pub parity_shards: usize,
    /// Bytes per shard
    pub shard_size: usize,
}

impl FecConfig {
    /// Geometry used until the first loss report arrives
    pub fn low_loss(shard_size: usize) -> Self {
        Self {
            data_shards: 16,
            parity_shards: 2,
            shard_size,
        }
    }

    /// Total shards per block (K + M)
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Check the geometry is usable.
    pub fn validate(&self) -> Result<()> {
        if self.data_shards == 0 || self.parity_shards == 0 || self.shard_size == 0 {
            return Err(ProtocolError::InvalidConfig(format!(
                "degenerate FEC geometry ({}+{}, {} byte shards)",
                self.data_shards, self.parity_shards, self.shard_size
            )));
        }
        if self.total_shards() > 255 {
            return Err(ProtocolError::InvalidConfig(
                "GF(2^8) supports at most 255 shards per block".into(),
            ));
        }
        Ok(())
    }
}

impl Default for FecConfig {
    fn default() -> Self {
        Self::low_loss(64 * 1024)
    }
}

/// One shard of one block, as it travels to the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FecShard {
    /// Monotone block identifier
    pub block_index: u64,
    /// Block-local index: `0..K` data, `K..K+M` parity
    pub shard_index: u32,
    /// Data shards (K) in this block
    pub data_shards: u32,
    /// Total shards (K + M) in this block
    pub total_shards: u32,
    /// Shard payload
    pub bytes: Vec<u8>,
}

impl FecShard {
    /// Whether this shard carries data rather than parity
    pub fn is_data(&self) -> bool {
        self.shard_index < self.data_shards
    }
}
