//! Sender-side flow control
//!
//! Two independent gates decide whether the sender may request another
//! batch from the reader:
//!
//! - a hysteresis latch on the maximum transport send-buffer depth across
//!   the current batch (throttle at `buffer_high`, release only once the
//!   buffer drains below `buffer_low`), and
//! - per-peer pause flags driven by receiver `CONTROL(PAUSE|RESUME)`
//!   messages.
//!
//! Both must be clear for `can_request_more` to hold.

use std::collections::{HashMap, HashSet};

use crate::config::TransferConfig;
use crate::swarm::peer::PeerId;

/// Watermark-and-pause gate for the sender
#[derive(Debug)]
pub struct FlowControl {
    buffer_low: usize,
    buffer_high: usize,
    throttled: bool,
    buffered: HashMap<PeerId, usize>,
    paused: HashSet<PeerId>,
}

impl FlowControl {
    /// Create a gate with the configured watermarks.
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            buffer_low: config.buffer_low,
            buffer_high: config.buffer_high,
            throttled: false,
            buffered: HashMap::new(),
            paused: HashSet::new(),
        }
    }

    /// Track a peer; its buffer starts empty.
    pub fn add_peer(&mut self, peer: PeerId) {
        self.buffered.entry(peer).or_insert(0);
    }

    /// Forget a peer entirely.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.buffered.remove(peer);
        self.paused.remove(peer);
        self.reevaluate();
    }

    /// Record the peer's current transport send-buffer depth.
    pub fn update_buffered(&mut self, peer: &PeerId, bytes: usize) {
        if let Some(entry) = self.buffered.get_mut(peer) {
            *entry = bytes;
        } else {
            self.buffered.insert(peer.clone(), bytes);
        }
        self.reevaluate();
    }

    /// Apply a receiver pause or resume.
    pub fn set_paused(&mut self, peer: &PeerId, paused: bool) {
        if paused {
            self.paused.insert(peer.clone());
        } else {
            self.paused.remove(peer);
        }
    }

    /// Largest send-buffer depth across tracked peers
    pub fn max_buffered(&self) -> usize {
        self.buffered.values().copied().max().unwrap_or(0)
    }

    /// Whether the watermark latch is currently engaged
    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    /// Whether any tracked peer has an outstanding pause
    pub fn any_paused(&self) -> bool {
        !self.paused.is_empty()
    }

    /// Whether the sender may request the next batch from the reader.
    pub fn can_request_more(&self) -> bool {
        !self.throttled && self.paused.is_empty()
    }

    fn reevaluate(&mut self) {
        let max = self.max_buffered();
        if max >= self.buffer_high {
            self.throttled = true;
        } else if max < self.buffer_low {
            self.throttled = false;
        }
        // Between the watermarks the latch keeps its previous state.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    fn flow() -> FlowControl {
        FlowControl::new(&TransferConfig::default())
    }

    #[test]
    fn test_starts_open() {
        let mut flow = flow();
        flow.add_peer("a".into());
        assert!(flow.can_request_more());
    }

    #[test]
    fn test_throttles_above_high_until_drained_below_low() {
        let mut flow = flow();
        let peer: PeerId = "a".into();
        flow.add_peer(peer.clone());

        flow.update_buffered(&peer, 5 * MIB);
        assert!(!flow.can_request_more(), "5 MiB is above buffer_high");

        // Draining into the hysteresis band keeps the latch engaged.
        flow.update_buffered(&peer, 2 * MIB);
        assert!(!flow.can_request_more());

        flow.update_buffered(&peer, MIB / 2);
        assert!(flow.can_request_more(), "below buffer_low the latch releases");
    }

    #[test]
    fn test_max_across_peers_governs() {
        let mut flow = flow();
        flow.add_peer("a".into());
        flow.add_peer("b".into());
        flow.update_buffered(&"a".into(), 0);
        flow.update_buffered(&"b".into(), 5 * MIB);
        assert!(!flow.can_request_more());

        // The slow peer leaving releases the latch.
        flow.remove_peer(&"b".into());
        assert!(flow.can_request_more());
    }

    #[test]
    fn test_pause_overrides_buffer_level() {
        let mut flow = flow();
        let peer: PeerId = "a".into();
        flow.add_peer(peer.clone());
        flow.update_buffered(&peer, 0);

        flow.set_paused(&peer, true);
        assert!(!flow.can_request_more(), "pause gates regardless of buffers");

        flow.set_paused(&peer, false);
        assert!(flow.can_request_more());
    }
}
