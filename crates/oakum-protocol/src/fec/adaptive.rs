//! Adaptive parity controller
//!
//! Chooses block geometry from measured loss. Loss reports are smoothed
//! with an exponentially weighted moving average and mapped onto a small
//! set of fixed tuples: wide blocks while the link is clean, narrow blocks
//! (more parity per data byte) as loss climbs. A choice only affects
//! blocks started after it.

use super::FecConfig;

/// EWMA smoothing factor for loss reports
const LOSS_ALPHA: f64 = 0.25;

/// (loss threshold, data shards) pairs, first match wins
const LOSS_TIERS: [(f64, usize); 3] = [(0.01, 16), (0.05, 8), (1.0, 4)];

/// Parity shards per block before clamping
const BASE_PARITY: usize = 2;

/// Maps smoothed loss onto block geometry
#[derive(Debug, Clone)]
pub struct AdaptiveParity {
    smoothed_loss: Option<f64>,
    shard_size: usize,
    min_parity: usize,
    max_parity: usize,
    current: FecConfig,
}

impl AdaptiveParity {
    /// Create a controller emitting shards of `shard_size` bytes.
    pub fn new(shard_size: usize) -> Self {
        Self::with_parity_bounds(shard_size, 1, 4)
    }

    /// Create a controller with explicit parity clamps.
    pub fn with_parity_bounds(shard_size: usize, min_parity: usize, max_parity: usize) -> Self {
        Self {
            smoothed_loss: None,
            shard_size,
            min_parity,
            max_parity,
            current: FecConfig::low_loss(shard_size),
        }
    }

    /// Geometry for blocks started now
    pub fn current(&self) -> FecConfig {
        self.current
    }

    /// Smoothed loss fraction, if any report has arrived
    pub fn smoothed_loss(&self) -> Option<f64> {
        self.smoothed_loss
    }

    /// Fold in a loss report and return the geometry for subsequent blocks.
    ///
    /// # Arguments
    ///
    /// * `total_sent` - Shards sent over the report window
    /// * `lost` - Shards reported lost over the same window
    pub fn report(&mut self, total_sent: u64, lost: u64) -> FecConfig {
        if total_sent == 0 {
            return self.current;
        }
        let loss = lost.min(total_sent) as f64 / total_sent as f64;
        let smoothed = match self.smoothed_loss {
            Some(previous) => LOSS_ALPHA * loss + (1.0 - LOSS_ALPHA) * previous,
            None => loss,
        };
        self.smoothed_loss = Some(smoothed);

        let data_shards = LOSS_TIERS
            .iter()
            .find(|(threshold, _)| smoothed < *threshold)
            .map(|(_, k)| *k)
            .unwrap_or(4);
        let parity_shards = BASE_PARITY.clamp(self.min_parity, self.max_parity);

        self.current = FecConfig {
            data_shards,
            parity_shards,
            shard_size: self.shard_size,
        };
        self.current
    }
}
