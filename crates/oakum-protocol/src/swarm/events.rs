//! Observable swarm events

use std::time::Duration;

use crate::swarm::peer::PeerId;

/// Events emitted by the coordinator as the session progresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    /// A peer announced `TRANSFER_READY`
    PeerReady {
        /// The peer
        peer: PeerId,
    },
    /// A peer signalled ready mid-batch and was queued
    PeerQueued {
        /// The peer
        peer: PeerId,
        /// 1-based queue position
        position: u32,
    },
    /// Some peers are ready; waiting for stragglers
    ReadyCountdownStart {
        /// How long the countdown runs
        wait: Duration,
    },
    /// A batch began transferring
    TransferBatchStart {
        /// Batch members
        peers: Vec<PeerId>,
    },
    /// A peer finished its download
    PeerComplete {
        /// The peer
        peer: PeerId,
    },
    /// The current batch finished (all complete or all gone)
    BatchComplete,
    /// Every connected peer has completed
    AllTransfersComplete,
    /// Batch done, but connected peers remain that never signalled ready
    ReadyForNext,
}
