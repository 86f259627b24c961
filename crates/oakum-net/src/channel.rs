//! Unified datagram channel trait for transport-agnostic streaming
//!
//! Every transport the engine can broadcast over implements this trait, so
//! the sender and swarm layers stay transport-agnostic. The wire format
//! (fixed packet headers, JSON control messages) is identical regardless of
//! transport; only the underlying connection differs.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// Events surfaced by a channel to its owning task
#[derive(Debug)]
pub enum ChannelEvent {
    /// An inbound datagram arrived from the peer
    Datagram(Bytes),
    /// The send buffer drained below its previous level
    Drain {
        /// Bytes still queued in the send buffer
        buffered: usize,
    },
    /// The channel closed (peer gone or local close)
    Closed,
}

/// Unified channel for exchanging datagrams with a peer, regardless of
/// transport.
///
/// Sends are non-blocking: `try_send` either queues the datagram or fails
/// with [`crate::NetworkError::SendBufferFull`], in which case the caller
/// yields and retries after the next [`ChannelEvent::Drain`]. Inbound
/// datagrams and drain notifications arrive on the event stream returned by
/// `take_events`, which can be taken exactly once.
pub trait DatagramChannel: Send {
    /// Queue one datagram for transmission.
    fn try_send(&self, datagram: Bytes) -> Result<()>;

    /// Bytes currently queued in the transport send buffer.
    ///
    /// The sender's flow controller watches this across all peers in the
    /// current batch.
    fn buffered_bytes(&self) -> usize;

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;

    /// Take the event stream. Returns `None` if already taken.
    fn take_events(&mut self) -> Option<mpsc::Receiver<ChannelEvent>>;

    /// Close the channel. Further sends fail; the peer observes
    /// [`ChannelEvent::Closed`].
    fn close(&self);

    /// Human-readable description of the transport for logging.
    ///
    /// Examples: `"memory (a->b)"`, `"quic datagram (192.168.1.42:52341)"`
    fn transport_description(&self) -> String;
}
