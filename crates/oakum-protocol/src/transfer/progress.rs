//! Transfer progress tracking

use std::time::{Duration, Instant};

/// Progress snapshot maintained by the sender and receiver engines
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Bytes transferred so far
    pub bytes_transferred: u64,
    /// Total bytes expected (0 when unknown)
    pub total_bytes: u64,
    /// Recent transfer rate in bytes/second
    pub rate_bps: u64,
    start_time: Instant,
    window_start: Instant,
    window_bytes: u64,
}

impl TransferProgress {
    /// Create a tracker expecting `total_bytes` in all.
    pub fn new(total_bytes: u64) -> Self {
        let now = Instant::now();
        Self {
            bytes_transferred: 0,
            total_bytes,
            rate_bps: 0,
            start_time: now,
            window_start: now,
            window_bytes: 0,
        }
    }

    /// Record that the running total reached `bytes_transferred`.
    ///
    /// The rate is computed over a sliding one-second window so stalls and
    /// bursts show up quickly instead of being averaged away.
    pub fn update(&mut self, bytes_transferred: u64) {
        let delta = bytes_transferred.saturating_sub(self.bytes_transferred);
        self.bytes_transferred = bytes_transferred;
        self.window_bytes += delta;

        let window = self.window_start.elapsed();
        if window >= Duration::from_secs(1) {
            self.rate_bps = (self.window_bytes as f64 / window.as_secs_f64()) as u64;
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
    }

    /// Completion percentage (0 when the total is unknown)
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.bytes_transferred as f64 / self.total_bytes as f64) * 100.0
    }

    /// Seconds remaining at the current rate, if computable
    pub fn eta_seconds(&self) -> Option<u64> {
        if self.rate_bps == 0 || self.total_bytes == 0 {
            return None;
        }
        Some(self.total_bytes.saturating_sub(self.bytes_transferred) / self.rate_bps)
    }

    /// Time since tracking began
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}
