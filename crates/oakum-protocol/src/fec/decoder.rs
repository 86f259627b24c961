//! Block decoder

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reed_solomon_erasure::galois_8::ReedSolomon;

use super::FecShard;
use crate::{ProtocolError, Result};

/// Counter snapshot of the decoder
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FecStats {
    /// Blocks reconstructed
    pub recovered_blocks: u64,
    /// Blocks abandoned without enough shards
    pub lost_blocks: u64,
    /// Shards ignored as duplicates or late arrivals
    pub duplicate_shards: u64,
    /// Blocks currently awaiting shards
    pub pending_blocks: usize,
}

struct BlockState {
    shards: Vec<Option<Vec<u8>>>,
    data_shards: usize,
    shard_size: usize,
    received: usize,
    first_seen: Instant,
    decoded: bool,
}

/// Collects shards and reconstructs each block as soon as any `K` of its
/// `K + M` shards have arrived.
pub struct FecDecoder {
    blocks: HashMap<u64, BlockState>,
    recovered_blocks: u64,
    lost_blocks: u64,
    duplicate_shards: u64,
}

impl FecDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self {
            blocks: HashMap::new(),
            recovered_blocks: 0,
            lost_blocks: 0,
            duplicate_shards: 0,
        }
    }

    /// Accept one shard.
    ///
    /// Returns the block's data shards (in index order) the moment enough
    /// shards are present; earlier and later calls for the same block
    /// return `None`. Shards disagreeing with the block's established
    /// geometry are rejected.
    pub fn receive_shard(&mut self, shard: FecShard) -> Result<Option<Vec<Vec<u8>>>> {
        let total = shard.total_shards as usize;
        let data = shard.data_shards as usize;
        if data == 0 || total <= data || shard.shard_index as usize >= total {
            return Err(ProtocolError::Fec(format!(
                "inconsistent shard indices: {}/{} of {}",
                shard.shard_index, data, total
            )));
        }

        let block = self.blocks.entry(shard.block_index).or_insert_with(|| BlockState {
            shards: vec![None; total],
            data_shards: data,
            shard_size: shard.bytes.len(),
            received: 0,
            first_seen: Instant::now(),
            decoded: false,
        });

        if block.decoded {
            self.duplicate_shards += 1;
            return Ok(None);
        }
        if block.shards.len() != total || block.data_shards != data {
            return Err(ProtocolError::Fec(format!(
                "shard geometry changed mid-block {}",
                shard.block_index
            )));
        }
        if shard.bytes.len() != block.shard_size {
            return Err(ProtocolError::Fec(format!(
                "shard size changed mid-block {}",
                shard.block_index
            )));
        }
        let slot = &mut block.shards[shard.shard_index as usize];
        if slot.is_some() {
            self.duplicate_shards += 1;
            return Ok(None);
        }
        *slot = Some(shard.bytes);
        block.received += 1;

        if block.received < block.data_shards {
            return Ok(None);
        }
        let data = Self::reconstruct(block)?;
        self.recovered_blocks += 1;
        Ok(Some(data))
    }

    /// Attempt reconstruction of a block regardless of arrival count.
    ///
    /// Called when the block's deadline elapsed. With fewer than `K` shards
    /// the block is unrecoverable: it is discarded, logged, and its bytes
    /// are lost.
    pub fn force_decode_block(&mut self, block_index: u64) -> Result<Option<Vec<Vec<u8>>>> {
        let Some(mut block) = self.blocks.remove(&block_index) else {
            return Ok(None);
        };
        if block.decoded {
            return Ok(None);
        }
        if block.received < block.data_shards {
            self.lost_blocks += 1;
            tracing::warn!(
                block_index,
                received = block.received,
                needed = block.data_shards,
                "FEC block unrecoverable at deadline, bytes lost"
            );
            return Ok(None);
        }
        let data = Self::reconstruct(&mut block)?;
        self.recovered_blocks += 1;
        Ok(Some(data))
    }

    /// Discard incomplete blocks older than `timeout`. Returns the number
    /// discarded; their bytes are lost unless a higher layer retransmits.
    pub fn cleanup_stale_blocks(&mut self, timeout: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<u64> = self
            .blocks
            .iter()
            .filter(|(_, b)| now.duration_since(b.first_seen) > timeout)
            .map(|(&i, _)| i)
            .collect();
        let mut lost = 0;
        for index in stale {
            if let Some(block) = self.blocks.remove(&index) {
                if !block.decoded {
                    lost += 1;
                }
            }
        }
        if lost > 0 {
            self.lost_blocks += lost as u64;
            tracing::warn!(lost, "discarded stale FEC blocks");
        }
        lost
    }

    /// Counter snapshot
    pub fn stats(&self) -> FecStats {
        FecStats {
            recovered_blocks: self.recovered_blocks,
            lost_blocks: self.lost_blocks,
            duplicate_shards: self.duplicate_shards,
            pending_blocks: self.blocks.values().filter(|b| !b.decoded).count(),
        }
    }

    /// Run Reed-Solomon reconstruction and hand back the data shards.
    ///
    /// Shard storage is dropped afterwards; only the decoded marker stays
    /// so late shards are recognised as duplicates.
    fn reconstruct(block: &mut BlockState) -> Result<Vec<Vec<u8>>> {
        let parity = block.shards.len() - block.data_shards;
        let codec = ReedSolomon::new(block.data_shards, parity)
            .map_err(|e| ProtocolError::Fec(format!("codec init: {:?}", e)))?;
        codec
            .reconstruct_data(&mut block.shards)
            .map_err(|e| ProtocolError::Fec(format!("reconstruct: {:?}", e)))?;

        let data = block
            .shards
            .iter_mut()
            .take(block.data_shards)
            .map(|s| s.take().unwrap_or_default())
            .collect();
        block.shards.clear();
        block.received = 0;
        block.decoded = true;
        Ok(data)
    }
}

impl Default for FecDecoder {
    fn default() -> Self {
        Self::new()
    }
}
