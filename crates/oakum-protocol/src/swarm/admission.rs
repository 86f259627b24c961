//! Ready/queue admission state machine
//!
//! Decides when a batch of receivers starts, who waits in the queue, and
//! what happens as peers complete or disappear. The machine is
//! synchronous: every input returns the list of actions for the
//! coordinator to carry out (send a control message, start the countdown,
//! begin pumping data), which keeps the decision rules testable without
//! timers or channels.
//!
//! Admission rules (1:N semantics):
//!
//! - First `TRANSFER_READY` with a single connected peer starts a 1:1
//!   transfer immediately.
//! - When every connected peer is ready, the batch starts immediately.
//! - Otherwise a countdown starts; at expiry the batch is whoever is
//!   ready by then.
//! - `TRANSFER_READY` during a running batch queues the peer; the queue is
//!   promoted wholesale when the batch completes.

use std::collections::{HashSet, VecDeque};

use crate::swarm::events::SwarmEvent;
use crate::swarm::peer::{PeerId, PeerState, PeerTable};
use crate::wire::control::ControlMessage;
use crate::wire::manifest::TransferManifest;

/// Instructions handed back to the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionAction {
    /// Surface an observable event
    Emit(SwarmEvent),
    /// Send a control message to one peer
    Send {
        /// Recipient
        peer: PeerId,
        /// Message to deliver
        message: ControlMessage,
    },
    /// Arm the ready-wait countdown
    StartCountdown,
    /// Start pumping data to these peers
    BeginBatch {
        /// Batch members
        peers: Vec<PeerId>,
    },
    /// Every connected peer completed; the session is done
    SessionComplete,
    /// Unrecoverable session failure
    SessionFailed {
        /// What happened
        reason: String,
    },
}

/// Tracks ready/queued/completed peers and forms batches
#[derive(Debug)]
pub struct AdmissionMachine {
    manifest: TransferManifest,
    ready_wait: std::time::Duration,
    ready_set: Vec<PeerId>,
    queue: VecDeque<PeerId>,
    completed: HashSet<PeerId>,
    current_batch: Vec<PeerId>,
    countdown_running: bool,
}

impl AdmissionMachine {
    /// Create a machine announcing `manifest` to every batch.
    ///
    /// `ready_wait` is the straggler countdown armed when only some
    /// connected peers are ready.
    pub fn new(manifest: TransferManifest, ready_wait: std::time::Duration) -> Self {
        Self {
            manifest,
            ready_wait,
            ready_set: Vec::new(),
            queue: VecDeque::new(),
            completed: HashSet::new(),
            current_batch: Vec::new(),
            countdown_running: false,
        }
    }

    /// Whether a batch is currently transferring
    pub fn transferring(&self) -> bool {
        !self.current_batch.is_empty()
    }

    /// Members of the current batch
    pub fn current_batch(&self) -> &[PeerId] {
        &self.current_batch
    }

    /// Peers waiting for the next batch
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Peers that completed this session
    pub fn completed(&self) -> usize {
        self.completed.len()
    }

    /// Connected-or-ready peers that could still join a batch
    fn pending(&self, table: &PeerTable) -> Vec<PeerId> {
        table
            .iter()
            .filter(|p| matches!(p.state, PeerState::Connected | PeerState::Ready))
            .filter(|p| !self.completed.contains(&p.id))
            .map(|p| p.id.clone())
            .collect()
    }

    /// A peer announced `TRANSFER_READY`.
    pub fn on_peer_ready(&mut self, peer: &PeerId, table: &mut PeerTable) -> Vec<AdmissionAction> {
        if !table.contains(peer) || self.completed.contains(peer) {
            return Vec::new();
        }

        if self.transferring() {
            if self.current_batch.contains(peer) || self.queue.contains(peer) {
                return Vec::new();
            }
            if let Some(record) = table.get_mut(peer) {
                let _ = record.transition(PeerState::Queued);
            }
            self.queue.push_back(peer.clone());
            let position = self.queue.len() as u32;
            return vec![
                AdmissionAction::Send {
                    peer: peer.clone(),
                    message: ControlMessage::Queued {
                        message: "transfer in progress, queued for the next batch".into(),
                        position,
                    },
                },
                AdmissionAction::Emit(SwarmEvent::PeerQueued {
                    peer: peer.clone(),
                    position,
                }),
            ];
        }

        if self.ready_set.contains(peer) {
            return Vec::new();
        }
        if let Some(record) = table.get_mut(peer) {
            let _ = record.transition(PeerState::Ready);
        }
        self.ready_set.push(peer.clone());
        let mut actions = vec![AdmissionAction::Emit(SwarmEvent::PeerReady {
            peer: peer.clone(),
        })];

        let pending = self.pending(table);
        let everyone_ready = self.ready_set.len() == pending.len();
        if (pending.len() == 1 && self.ready_set.len() == 1) || everyone_ready {
            actions.extend(self.start_batch(table, false));
        } else if !self.countdown_running {
            self.countdown_running = true;
            actions.push(AdmissionAction::Emit(SwarmEvent::ReadyCountdownStart {
                wait: self.ready_wait,
            }));
            actions.push(AdmissionAction::StartCountdown);
        }
        actions
    }

    /// The ready-wait countdown expired.
    pub fn on_countdown_fired(&mut self, table: &mut PeerTable) -> Vec<AdmissionAction> {
        self.countdown_running = false;
        if self.transferring() || self.ready_set.is_empty() {
            return Vec::new();
        }
        self.start_batch(table, false)
    }

    /// A batch peer acknowledged `DOWNLOAD_COMPLETE`.
    ///
    /// Repeated acknowledgements from the same peer are ignored.
    pub fn on_peer_complete(
        &mut self,
        peer: &PeerId,
        table: &mut PeerTable,
    ) -> Vec<AdmissionAction> {
        let Some(index) = self.current_batch.iter().position(|p| p == peer) else {
            return Vec::new();
        };
        self.current_batch.remove(index);
        self.completed.insert(peer.clone());
        if let Some(record) = table.get_mut(peer) {
            let _ = record.transition(PeerState::Completed);
        }
        let mut actions = vec![AdmissionAction::Emit(SwarmEvent::PeerComplete {
            peer: peer.clone(),
        })];
        if self.current_batch.is_empty() {
            actions.extend(self.finish_batch(table));
        }
        actions
    }

    /// A peer left (close, error, timeout). The table entry is already
    /// removed.
    pub fn on_peer_removed(&mut self, peer: &PeerId, table: &mut PeerTable) -> Vec<AdmissionAction> {
        self.ready_set.retain(|p| p != peer);
        self.queue.retain(|p| p != peer);
        let Some(index) = self.current_batch.iter().position(|p| p == peer) else {
            return Vec::new();
        };
        self.current_batch.remove(index);
        if !self.current_batch.is_empty() {
            return Vec::new();
        }
        if table.is_empty() {
            return vec![AdmissionAction::SessionFailed {
                reason: "all peers disconnected mid-transfer".into(),
            }];
        }
        // The batch completed early; no retransmission for the departed.
        self.finish_batch(table)
    }

    /// Form a batch from the ready set (or from promoted queued peers).
    fn start_batch(&mut self, table: &mut PeerTable, promoted: bool) -> Vec<AdmissionAction> {
        let peers: Vec<PeerId> = std::mem::take(&mut self.ready_set);
        self.countdown_running = false;
        self.current_batch = peers.clone();

        let mut actions = Vec::new();
        for peer in &peers {
            if let Some(record) = table.get_mut(peer) {
                let _ = record.transition(PeerState::Transferring);
            }
            if promoted {
                actions.push(AdmissionAction::Send {
                    peer: peer.clone(),
                    message: ControlMessage::TransferStarting,
                });
            }
            actions.push(AdmissionAction::Send {
                peer: peer.clone(),
                message: ControlMessage::Manifest {
                    manifest: self.manifest.clone(),
                },
            });
            actions.push(AdmissionAction::Send {
                peer: peer.clone(),
                message: ControlMessage::TransferStarted,
            });
        }
        actions.push(AdmissionAction::Emit(SwarmEvent::TransferBatchStart {
            peers: peers.clone(),
        }));
        actions.push(AdmissionAction::BeginBatch { peers });
        actions
    }

    /// The current batch emptied: promote the queue or wind down.
    fn finish_batch(&mut self, table: &mut PeerTable) -> Vec<AdmissionAction> {
        let mut actions = vec![AdmissionAction::Emit(SwarmEvent::BatchComplete)];

        let promoted: Vec<PeerId> = self
            .queue
            .drain(..)
            .filter(|p| table.contains(p))
            .collect();
        if !promoted.is_empty() {
            self.ready_set = promoted;
            actions.extend(self.start_batch(table, true));
            return actions;
        }

        let remaining = table
            .iter()
            .filter(|p| p.state != PeerState::Closed && !self.completed.contains(&p.id))
            .count();
        if remaining > 0 {
            actions.push(AdmissionAction::Emit(SwarmEvent::ReadyForNext));
        } else {
            actions.push(AdmissionAction::Emit(SwarmEvent::AllTransfersComplete));
            actions.push(AdmissionAction::SessionComplete);
        }
        actions
    }
}
