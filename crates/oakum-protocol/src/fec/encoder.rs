//! Block encoder

use reed_solomon_erasure::galois_8::ReedSolomon;

use super::{FecConfig, FecShard};
use crate::{ProtocolError, Result};

/// Buffers outbound bytes into blocks and emits coded shards.
///
/// Bytes accumulate until a full block (`K * shard_size`) is available,
/// then the block's `K + M` shards are emitted. Geometry changes requested
/// mid-stream take effect at the next block boundary, never inside a block.
pub struct FecEncoder {
    config: FecConfig,
    pending_config: Option<FecConfig>,
    codec: ReedSolomon,
    buffer: Vec<u8>,
    block_index: u64,
}

impl FecEncoder {
    /// Create an encoder with the given geometry.
    pub fn new(config: FecConfig) -> Result<Self> {
        config.validate()?;
        let codec = ReedSolomon::new(config.data_shards, config.parity_shards)
            .map_err(|e| ProtocolError::Fec(format!("codec init: {:?}", e)))?;
        Ok(Self {
            config,
            pending_config: None,
            codec,
            buffer: Vec::with_capacity(config.data_shards * config.shard_size),
            block_index: 0,
        })
    }

    /// Current geometry
    pub fn config(&self) -> FecConfig {
        self.config
    }

    /// Index the next emitted block will carry
    pub fn block_index(&self) -> u64 {
        self.block_index
    }

    /// Request a geometry change.
    ///
    /// Takes effect immediately when no block is in flight; otherwise at
    /// the next block boundary. A block never changes geometry mid-way.
    pub fn reconfigure(&mut self, config: FecConfig) -> Result<()> {
        config.validate()?;
        if config == self.config {
            self.pending_config = None;
        } else if self.buffer.is_empty() {
            self.codec = ReedSolomon::new(config.data_shards, config.parity_shards)
                .map_err(|e| ProtocolError::Fec(format!("codec init: {:?}", e)))?;
            self.config = config;
            self.pending_config = None;
        } else {
            self.pending_config = Some(config);
        }
        Ok(())
    }

    fn apply_pending_config(&mut self) -> Result<()> {
        if let Some(config) = self.pending_config.take() {
            self.codec = ReedSolomon::new(config.data_shards, config.parity_shards)
                .map_err(|e| ProtocolError::Fec(format!("codec init: {:?}", e)))?;
            self.config = config;
        }
        Ok(())
    }

    /// Add outbound bytes; returns the shards of every block completed by
    /// this call (possibly none, possibly several for a large chunk).
    pub fn add_chunk(&mut self, data: &[u8]) -> Result<Vec<FecShard>> {
        self.buffer.extend_from_slice(data);
        let mut shards = Vec::new();
        let mut block_len = self.config.data_shards * self.config.shard_size;
        while self.buffer.len() >= block_len {
            let block: Vec<u8> = self.buffer.drain(..block_len).collect();
            shards.extend(self.emit_block(&block)?);
            // The geometry may have changed at the block boundary.
            block_len = self.config.data_shards * self.config.shard_size;
        }
        Ok(shards)
    }

    /// Emit the final, zero-padded block, if any bytes are buffered.
    pub fn flush(&mut self) -> Result<Option<Vec<FecShard>>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let block_len = self.config.data_shards * self.config.shard_size;
        let mut block = std::mem::take(&mut self.buffer);
        block.resize(block_len, 0);
        Ok(Some(self.emit_block(&block)?))
    }

    /// Encode one block-sized byte run into `K + M` shards.
    fn emit_block(&mut self, block: &[u8]) -> Result<Vec<FecShard>> {
        let FecConfig {
            data_shards,
            parity_shards,
            shard_size,
        } = self.config;

        let mut shards: Vec<Vec<u8>> = block
            .chunks(shard_size)
            .map(|c| c.to_vec())
            .collect();
        shards.resize(data_shards + parity_shards, vec![0u8; shard_size]);

        self.codec
            .encode(&mut shards)
            .map_err(|e| ProtocolError::Fec(format!("encode: {:?}", e)))?;

        let block_index = self.block_index;
        self.block_index += 1;
        self.apply_pending_config()?;

        Ok(shards
            .into_iter()
            .enumerate()
            .map(|(i, bytes)| FecShard {
                block_index,
                shard_index: i as u32,
                data_shards: data_shards as u32,
                total_shards: (data_shards + parity_shards) as u32,
                bytes,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(k: usize, m: usize, s: usize) -> FecConfig {
        FecConfig {
            data_shards: k,
            parity_shards: m,
            shard_size: s,
        }
    }

    #[test]
    fn test_emits_block_when_full() {
        let mut encoder = FecEncoder::new(config(4, 2, 8)).unwrap();
        assert!(encoder.add_chunk(&[1u8; 16]).unwrap().is_empty());
        let shards = encoder.add_chunk(&[2u8; 16]).unwrap();
        assert_eq!(shards.len(), 6);
        assert_eq!(shards[0].block_index, 0);
        assert!(shards[3].is_data());
        assert!(!shards[4].is_data());
        assert_eq!(encoder.block_index(), 1);
    }

    #[test]
    fn test_large_chunk_emits_multiple_blocks() {
        let mut encoder = FecEncoder::new(config(2, 1, 4)).unwrap();
        let shards = encoder.add_chunk(&[0u8; 24]).unwrap();
        // 24 bytes = 3 blocks of 2x4 data bytes, 3 shards each.
        assert_eq!(shards.len(), 9);
        assert_eq!(shards.last().unwrap().block_index, 2);
    }

    #[test]
    fn test_flush_pads_final_block() {
        let mut encoder = FecEncoder::new(config(4, 2, 8)).unwrap();
        encoder.add_chunk(&[7u8; 10]).unwrap();
        let shards = encoder.flush().unwrap().unwrap();
        assert_eq!(shards.len(), 6);
        // Second data shard: 2 real bytes then zero padding.
        assert_eq!(&shards[1].bytes[..2], &[7, 7]);
        assert!(shards[1].bytes[2..].iter().all(|&b| b == 0));
        assert!(encoder.flush().unwrap().is_none());
    }

    #[test]
    fn test_reconfigure_applies_at_block_boundary() {
        let mut encoder = FecEncoder::new(config(4, 2, 8)).unwrap();
        encoder.add_chunk(&[1u8; 16]).unwrap();
        encoder.reconfigure(config(2, 2, 8)).unwrap();
        // Current block still uses the old geometry.
        let shards = encoder.add_chunk(&[1u8; 16]).unwrap();
        assert_eq!(shards.len(), 6);
        assert_eq!(shards[0].data_shards, 4);
        // The next block uses the new one.
        let shards = encoder.add_chunk(&[2u8; 16]).unwrap();
        assert_eq!(shards.len(), 4);
        assert_eq!(shards[0].data_shards, 2);
    }

    #[test]
    fn test_rejects_degenerate_geometry() {
        assert!(FecEncoder::new(config(0, 2, 8)).is_err());
        assert!(FecEncoder::new(config(4, 0, 8)).is_err());
        assert!(FecEncoder::new(config(200, 100, 8)).is_err());
    }
}
