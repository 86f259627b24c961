//! In-memory datagram channel pair
//!
//! Backs tests and local loopback transfers with a bidirectional pair of
//! [`DatagramChannel`] endpoints. The channel models the properties the
//! engine cares about on a real datagram transport: a bounded send buffer
//! with drain notifications, deterministic datagram loss, and bounded
//! reordering.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::channel::{ChannelEvent, DatagramChannel};
use crate::{NetworkError, Result};

/// Capacity of each endpoint's event queue
const EVENT_QUEUE_DEPTH: usize = 1024;

/// How long a partially filled reorder window waits before flushing
const WINDOW_LINGER: std::time::Duration = std::time::Duration::from_millis(50);

/// Behaviour knobs for an in-memory channel pair
#[derive(Debug, Clone)]
pub struct MemoryChannelConfig {
    /// Send buffer capacity in bytes; `try_send` fails beyond this
    pub send_capacity: usize,
    /// Largest accepted datagram
    pub max_datagram: usize,
    /// Drop every Nth datagram on the wire (1-based count), if set
    pub drop_every_nth: Option<u64>,
    /// Deliver datagrams in reversed windows of this size (0 or 1 = in order)
    pub reorder_window: usize,
}

impl Default for MemoryChannelConfig {
    fn default() -> Self {
        Self {
            send_capacity: 4 * 1024 * 1024,
            max_datagram: 2 * 1024 * 1024,
            drop_every_nth: None,
            reorder_window: 0,
        }
    }
}

/// Message on the internal wire between an endpoint and its relay task
enum WireMsg {
    Datagram(Bytes),
    Close,
}

/// One endpoint of an in-memory channel pair
pub struct MemoryChannel {
    label: String,
    open: Arc<AtomicBool>,
    buffered: Arc<AtomicUsize>,
    wire_tx: mpsc::UnboundedSender<WireMsg>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    send_capacity: usize,
    max_datagram: usize,
}

/// Create a connected pair of in-memory channels.
///
/// Each direction runs its own relay task applying the configured loss and
/// reorder behaviour; both endpoints share one open flag, so closing either
/// side closes the pair.
pub fn channel_pair(config: MemoryChannelConfig) -> (MemoryChannel, MemoryChannel) {
    let open = Arc::new(AtomicBool::new(true));

    let (ev_tx_a, ev_rx_a) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (ev_tx_b, ev_rx_b) = mpsc::channel(EVENT_QUEUE_DEPTH);

    let a = build_endpoint(
        "a->b",
        &config,
        Arc::clone(&open),
        ev_rx_a,
        ev_tx_a.clone(),
        ev_tx_b.clone(),
    );
    let b = build_endpoint("b->a", &config, open, ev_rx_b, ev_tx_b, ev_tx_a);

    (a, b)
}

fn build_endpoint(
    label: &str,
    config: &MemoryChannelConfig,
    open: Arc<AtomicBool>,
    events: mpsc::Receiver<ChannelEvent>,
    drain_tx: mpsc::Sender<ChannelEvent>,
    deliver_tx: mpsc::Sender<ChannelEvent>,
) -> MemoryChannel {
    let (wire_tx, wire_rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));

    tokio::spawn(relay(
        wire_rx,
        deliver_tx,
        drain_tx,
        Arc::clone(&buffered),
        config.drop_every_nth,
        config.reorder_window,
    ));

    MemoryChannel {
        label: label.to_string(),
        open,
        buffered,
        wire_tx,
        events: Some(events),
        send_capacity: config.send_capacity,
        max_datagram: config.max_datagram,
    }
}

/// Relay task for one direction: drains the sender's wire queue, applies
/// loss and reordering, and delivers into the peer's event stream.
async fn relay(
    mut wire_rx: mpsc::UnboundedReceiver<WireMsg>,
    deliver_tx: mpsc::Sender<ChannelEvent>,
    drain_tx: mpsc::Sender<ChannelEvent>,
    buffered: Arc<AtomicUsize>,
    drop_every_nth: Option<u64>,
    reorder_window: usize,
) {
    let mut counter: u64 = 0;
    let mut window: Vec<Bytes> = Vec::new();

    loop {
        // A partially filled window flushes after a short linger so sparse
        // traffic (single control messages, the final frames of a stream)
        // is never stranded.
        let msg = if window.is_empty() {
            wire_rx.recv().await
        } else {
            match tokio::time::timeout(WINDOW_LINGER, wire_rx.recv()).await {
                Ok(msg) => msg,
                Err(_) => {
                    for d in window.drain(..).rev() {
                        if deliver_tx.send(ChannelEvent::Datagram(d)).await.is_err() {
                            return;
                        }
                    }
                    continue;
                }
            }
        };
        let datagram = match msg {
            Some(WireMsg::Datagram(d)) => d,
            Some(WireMsg::Close) | None => break,
        };

        let remaining = buffered
            .fetch_sub(datagram.len(), Ordering::SeqCst)
            .saturating_sub(datagram.len());
        let _ = drain_tx.send(ChannelEvent::Drain { buffered: remaining }).await;

        counter += 1;
        if let Some(every) = drop_every_nth {
            if every > 0 && counter % every == 0 {
                tracing::trace!(datagram = counter, "memory channel dropping datagram");
                continue;
            }
        }

        if reorder_window > 1 {
            window.push(datagram);
            if window.len() == reorder_window {
                for d in window.drain(..).rev() {
                    if deliver_tx.send(ChannelEvent::Datagram(d)).await.is_err() {
                        return;
                    }
                }
            }
        } else if deliver_tx.send(ChannelEvent::Datagram(datagram)).await.is_err() {
            return;
        }
    }

    // Flush any datagrams still held in the reorder window, then signal
    // closure to the peer.
    for d in window.drain(..) {
        if deliver_tx.send(ChannelEvent::Datagram(d)).await.is_err() {
            return;
        }
    }
    let _ = deliver_tx.send(ChannelEvent::Closed).await;
}

impl DatagramChannel for MemoryChannel {
    fn try_send(&self, datagram: Bytes) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(NetworkError::ChannelClosed);
        }
        if datagram.len() > self.max_datagram {
            return Err(NetworkError::DatagramTooLarge {
                size: datagram.len(),
                max: self.max_datagram,
            });
        }
        let queued = self.buffered.load(Ordering::SeqCst);
        if queued + datagram.len() > self.send_capacity {
            return Err(NetworkError::SendBufferFull {
                buffered: queued,
                capacity: self.send_capacity,
            });
        }
        self.buffered.fetch_add(datagram.len(), Ordering::SeqCst);
        if self.wire_tx.send(WireMsg::Datagram(datagram)).is_err() {
            return Err(NetworkError::ChannelClosed);
        }
        Ok(())
    }

    fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.events.take()
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.wire_tx.send(WireMsg::Close);
    }

    fn transport_description(&self) -> String {
        format!("memory ({})", self.label)
    }
}
