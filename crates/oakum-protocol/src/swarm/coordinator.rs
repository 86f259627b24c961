//! Swarm coordinator actor
//!
//! One task owns the whole sending side: the sender engine (and through it
//! the slot pool), the peer table, the admission machine, the flow gate,
//! and every peer channel. Commands arrive on a handle; channel events are
//! merged into one inbox by lightweight forwarder tasks. Between messages
//! the coordinator pumps packet batches to the current batch of peers
//! whenever the flow gate is open.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use oakum_net::{ChannelEvent, DatagramChannel, NetworkError};
use tokio::sync::{mpsc, oneshot};

use crate::config::TransferConfig;
use crate::swarm::admission::{AdmissionAction, AdmissionMachine};
use crate::swarm::events::SwarmEvent;
use crate::swarm::peer::{PeerId, PeerState, PeerTable};
use crate::transfer::flow::FlowControl;
use crate::transfer::sender::SenderEngine;
use crate::transfer::source::ChunkSource;
use crate::wire::control::{self, ControlMessage, FlowAction};
use crate::{ProtocolError, Result};

/// Packets produced per pump step; small enough to stay responsive
const PUMP_BATCH: usize = 16;

/// Command inbox depth
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Merged channel-event inbox depth
const INBOX_DEPTH: usize = 1024;

/// Emitted event queue depth
const EVENT_QUEUE_DEPTH: usize = 256;

/// Commands accepted by the coordinator
pub enum SwarmCommand {
    /// Register a peer and its channel
    AddPeer {
        /// Peer identifier
        id: PeerId,
        /// Whether we initiated the connection
        initiator: bool,
        /// Established datagram channel to the peer
        channel: Box<dyn DatagramChannel>,
    },
    /// Drop a peer
    RemovePeer {
        /// Peer identifier
        id: PeerId,
        /// Reason, for logging
        reason: String,
    },
    /// Tear the session down
    Abort,
    /// Request a state snapshot
    Snapshot(oneshot::Sender<SwarmSnapshot>),
}

/// Point-in-time view of the session
#[derive(Debug, Clone)]
pub struct SwarmSnapshot {
    /// Peers and their states
    pub peers: Vec<(PeerId, PeerState)>,
    /// Whether a batch is transferring
    pub transferring: bool,
    /// Peers completed this session
    pub completed: usize,
    /// Peers waiting in the queue
    pub queued: usize,
    /// Payload bytes emitted so far
    pub total_sent: u64,
}

/// Cloneable handle for commanding the coordinator
#[derive(Clone)]
pub struct SwarmHandle {
    cmd_tx: mpsc::Sender<SwarmCommand>,
}

impl SwarmHandle {
    /// Create a coordinator around a sender engine.
    ///
    /// Returns the coordinator (drive it via [`SwarmCoordinator::run`]),
    /// the command handle, and the observable event stream.
    pub fn new<S: ChunkSource>(
        engine: SenderEngine<S>,
        config: TransferConfig,
    ) -> (SwarmCoordinator<S>, Self, mpsc::Receiver<SwarmEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_DEPTH);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        let admission = AdmissionMachine::new(engine.manifest().clone(), config.ready_wait);
        let coordinator = SwarmCoordinator {
            table: PeerTable::new(config.max_direct_peers),
            admission,
            flow: FlowControl::new(&config),
            engine,
            channels: HashMap::new(),
            pending_out: HashMap::new(),
            cmd_rx,
            self_cmd: cmd_tx.clone(),
            inbox_tx,
            inbox_rx,
            events_tx,
            countdown_deadline: None,
            complete: false,
            config,
        };
        (coordinator, Self { cmd_tx }, events_rx)
    }

    /// Register a peer and its established channel.
    pub async fn add_peer(
        &self,
        id: PeerId,
        initiator: bool,
        channel: Box<dyn DatagramChannel>,
    ) -> Result<()> {
        self.send(SwarmCommand::AddPeer {
            id,
            initiator,
            channel,
        })
        .await
    }

    /// Drop a peer (user left, signalling error).
    pub async fn remove_peer(&self, id: PeerId, reason: impl Into<String>) -> Result<()> {
        self.send(SwarmCommand::RemovePeer {
            id,
            reason: reason.into(),
        })
        .await
    }

    /// Tear the session down.
    pub async fn abort(&self) -> Result<()> {
        self.send(SwarmCommand::Abort).await
    }

    /// Fetch a state snapshot.
    pub async fn snapshot(&self) -> Result<SwarmSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(SwarmCommand::Snapshot(tx)).await?;
        rx.await
            .map_err(|_| ProtocolError::TransferFailed("snapshot response lost".into()))
    }

    async fn send(&self, command: SwarmCommand) -> Result<()> {
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| ProtocolError::TransferFailed("coordinator shut down".into()))
    }
}

/// The owning task for one sending session
pub struct SwarmCoordinator<S: ChunkSource> {
    engine: SenderEngine<S>,
    table: PeerTable,
    admission: AdmissionMachine,
    flow: FlowControl,
    channels: HashMap<PeerId, Box<dyn DatagramChannel>>,
    pending_out: HashMap<PeerId, VecDeque<Bytes>>,
    cmd_rx: mpsc::Receiver<SwarmCommand>,
    self_cmd: mpsc::Sender<SwarmCommand>,
    inbox_tx: mpsc::Sender<(PeerId, ChannelEvent)>,
    inbox_rx: mpsc::Receiver<(PeerId, ChannelEvent)>,
    events_tx: mpsc::Sender<SwarmEvent>,
    countdown_deadline: Option<tokio::time::Instant>,
    complete: bool,
    config: TransferConfig,
}

impl<S: ChunkSource> SwarmCoordinator<S> {
    /// Run the session until completion, abort, or a fatal error.
    pub async fn run(mut self) -> Result<()> {
        let mut keepalive = tokio::time::interval(self.config.keep_alive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut conncheck = tokio::time::interval(Duration::from_secs(1));
        conncheck.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.complete {
                self.close_all();
                return Ok(());
            }
            let pumping = self.admission.transferring()
                && !self.engine.is_finished()
                && self.flow.can_request_more()
                && self.pending_out.values().all(|q| q.is_empty());
            let countdown_at = self
                .countdown_deadline
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(command) => {
                            if self.handle_command(command).await? {
                                self.close_all();
                                return Ok(());
                            }
                        }
                        None => {
                            self.close_all();
                            return Ok(());
                        }
                    }
                }
                Some((peer, event)) = self.inbox_rx.recv() => {
                    self.handle_channel_event(peer, event).await?;
                }
                _ = tokio::time::sleep_until(countdown_at), if self.countdown_deadline.is_some() => {
                    self.countdown_deadline = None;
                    let actions = self.admission.on_countdown_fired(&mut self.table);
                    self.apply(actions).await?;
                }
                _ = keepalive.tick() => {
                    self.send_keepalives();
                }
                _ = conncheck.tick() => {
                    self.expire_connecting().await?;
                }
                _ = std::future::ready(()), if pumping => {
                    self.pump().await?;
                }
            }
        }
    }

    /// Returns true when the coordinator should terminate.
    async fn handle_command(&mut self, command: SwarmCommand) -> Result<bool> {
        match command {
            SwarmCommand::AddPeer {
                id,
                initiator,
                mut channel,
            } => {
                if let Err(e) = self.table.add_peer(id.clone(), initiator) {
                    tracing::warn!(peer = %id, error = %e, "rejecting peer");
                    channel.close();
                    return Ok(false);
                }
                let Some(mut events) = channel.take_events() else {
                    tracing::warn!(peer = %id, "channel event stream already taken");
                    self.table.remove(&id);
                    channel.close();
                    return Ok(false);
                };
                let inbox = self.inbox_tx.clone();
                let forwarded_id = id.clone();
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if inbox.send((forwarded_id.clone(), event)).await.is_err() {
                            break;
                        }
                    }
                });
                tracing::info!(peer = %id, transport = %channel.transport_description(), "peer added");
                self.flow.add_peer(id.clone());
                self.pending_out.insert(id.clone(), VecDeque::new());
                self.channels.insert(id, channel);
            }
            SwarmCommand::RemovePeer { id, reason } => {
                self.remove_peer(&id, &reason).await?;
            }
            SwarmCommand::Abort => {
                tracing::info!("session aborted");
                self.engine.abort();
                return Ok(true);
            }
            SwarmCommand::Snapshot(reply) => {
                let snapshot = SwarmSnapshot {
                    peers: self
                        .table
                        .iter()
                        .map(|p| (p.id.clone(), p.state))
                        .collect(),
                    transferring: self.admission.transferring(),
                    completed: self.admission.completed(),
                    queued: self.admission.queued(),
                    total_sent: self.engine.total_sent(),
                };
                let _ = reply.send(snapshot);
            }
        }
        Ok(false)
    }

    async fn handle_channel_event(&mut self, peer: PeerId, event: ChannelEvent) -> Result<()> {
        if !self.table.contains(&peer) {
            return Ok(()); // late event from a removed peer
        }
        self.table.mark_active(&peer);

        match event {
            ChannelEvent::Datagram(datagram) => {
                if control::is_control(&datagram) {
                    self.handle_control(&peer, &datagram).await?;
                } else {
                    tracing::debug!(peer = %peer, "unexpected data frame on the sending side");
                }
            }
            ChannelEvent::Drain { buffered } => {
                // The watermark latch only watches the current batch.
                if self.admission.current_batch().contains(&peer) {
                    self.flow.update_buffered(&peer, buffered);
                }
                self.flush_pending(&peer).await?;
            }
            ChannelEvent::Closed => {
                self.remove_peer(&peer, "channel closed").await?;
            }
        }
        Ok(())
    }

    async fn handle_control(&mut self, peer: &PeerId, datagram: &[u8]) -> Result<()> {
        let message = match control::decode(datagram) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "undecodable control message");
                return Ok(());
            }
        };
        match message {
            ControlMessage::TransferReady => {
                let actions = self.admission.on_peer_ready(peer, &mut self.table);
                self.apply(actions).await?;
            }
            ControlMessage::Control { action } => {
                let paused = action == FlowAction::Pause;
                self.flow.set_paused(peer, paused);
                if let Some(record) = self.table.get_mut(peer) {
                    record.paused = paused;
                    let target = if paused {
                        PeerState::Paused
                    } else {
                        PeerState::Transferring
                    };
                    if record.transition(target).is_err() {
                        tracing::debug!(peer = %peer, ?action, "flow control outside a transfer");
                    }
                }
            }
            ControlMessage::DownloadComplete => {
                let actions = self.admission.on_peer_complete(peer, &mut self.table);
                self.apply(actions).await?;
            }
            ControlMessage::KeepAlive => {}
            other => {
                tracing::debug!(peer = %peer, message = ?other, "unexpected control message");
            }
        }
        Ok(())
    }

    async fn apply(&mut self, actions: Vec<AdmissionAction>) -> Result<()> {
        for action in actions {
            match action {
                AdmissionAction::Emit(event) => {
                    let _ = self.events_tx.send(event).await;
                }
                AdmissionAction::Send { peer, message } => {
                    let wire = control::encode(&message)?;
                    let delivered = match self.channels.get(&peer) {
                        Some(channel) => match channel.try_send(wire) {
                            Ok(()) => true,
                            Err(e) => {
                                tracing::warn!(peer = %peer, error = %e, "control send failed");
                                false
                            }
                        },
                        None => false,
                    };
                    // Removal re-enters the admission machine; defer it
                    // through the command inbox rather than recursing.
                    if !delivered {
                        let _ = self.self_cmd.try_send(SwarmCommand::RemovePeer {
                            id: peer,
                            reason: "control send failure".into(),
                        });
                    }
                }
                AdmissionAction::StartCountdown => {
                    self.countdown_deadline =
                        Some(tokio::time::Instant::now() + self.config.ready_wait);
                }
                AdmissionAction::BeginBatch { peers } => {
                    self.begin_batch(&peers);
                }
                AdmissionAction::SessionComplete => {
                    self.complete = true;
                }
                AdmissionAction::SessionFailed { reason } => {
                    return Err(ProtocolError::TransferFailed(reason));
                }
            }
        }
        Ok(())
    }

    /// Reset per-batch state and rewind the reader for the new audience.
    fn begin_batch(&mut self, peers: &[PeerId]) {
        self.countdown_deadline = None;
        self.engine.rewind();
        self.flow = FlowControl::new(&self.config);
        for peer in peers {
            self.flow.add_peer(peer.clone());
            if let Some(queue) = self.pending_out.get_mut(peer) {
                queue.clear();
            }
        }
        tracing::info!(peers = ?peers, "transfer batch started");
    }

    /// Produce one batch of packets and broadcast it.
    async fn pump(&mut self) -> Result<()> {
        let packets = match self.engine.process_batch(PUMP_BATCH).await {
            Ok(packets) => packets,
            Err(e) => {
                tracing::error!(error = %e, "sender engine failed");
                return Err(e);
            }
        };
        for packet in packets {
            self.broadcast(packet).await?;
        }
        // Refresh watermark inputs from the channels we just loaded.
        for peer in self.admission.current_batch().to_vec() {
            if let Some(channel) = self.channels.get(&peer) {
                let buffered = channel.buffered_bytes();
                self.flow.update_buffered(&peer, buffered);
            }
        }
        Ok(())
    }

    /// Send one packet to every batch member, queueing per-peer when a
    /// send buffer is momentarily full.
    async fn broadcast(&mut self, packet: Bytes) -> Result<()> {
        let batch = self.admission.current_batch().to_vec();
        let mut failed: Vec<PeerId> = Vec::new();
        for peer in batch {
            let backlog = self.pending_out.entry(peer.clone()).or_default();
            if !backlog.is_empty() {
                backlog.push_back(packet.clone());
                continue;
            }
            match self.channels.get(&peer) {
                Some(channel) => match channel.try_send(packet.clone()) {
                    Ok(()) => {}
                    Err(NetworkError::SendBufferFull { .. }) => {
                        backlog.push_back(packet.clone());
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "packet send failed");
                        failed.push(peer);
                    }
                },
                None => failed.push(peer),
            }
        }
        for peer in failed {
            self.remove_peer(&peer, "send failure").await?;
        }
        Ok(())
    }

    /// Retry a peer's backlog after its send buffer drained.
    async fn flush_pending(&mut self, peer: &PeerId) -> Result<()> {
        let mut failed = false;
        if let Some(backlog) = self.pending_out.get_mut(peer) {
            while let Some(packet) = backlog.front() {
                let Some(channel) = self.channels.get(peer) else {
                    break;
                };
                match channel.try_send(packet.clone()) {
                    Ok(()) => {
                        backlog.pop_front();
                    }
                    Err(NetworkError::SendBufferFull { .. }) => break,
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "backlog send failed");
                        failed = true;
                        break;
                    }
                }
            }
        }
        if failed {
            self.remove_peer(peer, "send failure").await?;
        }
        Ok(())
    }

    async fn remove_peer(&mut self, peer: &PeerId, reason: &str) -> Result<()> {
        if self.table.remove(peer).is_none() {
            return Ok(());
        }
        tracing::info!(peer = %peer, reason, "peer removed");
        if let Some(channel) = self.channels.remove(peer) {
            channel.close();
        }
        self.pending_out.remove(peer);
        self.flow.remove_peer(peer);
        let actions = self.admission.on_peer_removed(peer, &mut self.table);
        self.apply(actions).await
    }

    fn send_keepalives(&mut self) {
        if self.admission.transferring() {
            return;
        }
        let Ok(wire) = control::encode(&ControlMessage::KeepAlive) else {
            return;
        };
        for channel in self.channels.values() {
            let _ = channel.try_send(wire.clone());
        }
    }

    async fn expire_connecting(&mut self) -> Result<()> {
        for peer in self.table.connecting_timed_out(self.config.connection_timeout) {
            self.remove_peer(&peer, "connection timeout").await?;
        }
        Ok(())
    }

    fn close_all(&mut self) {
        for channel in self.channels.values() {
            channel.close();
        }
        self.channels.clear();
    }
}
