//! Receiver engine: frames in, ordered bytes out
//!
//! Each inbound frame is classified by its first byte, parsed, optionally
//! decrypted, and pushed through the reorder buffer; ordered bytes are
//! drained to the sink in large batches. Frame-local failures (malformed
//! frames, CRC mismatches, bad tags) drop the frame and the stream
//! continues; only sink failures are fatal.
//!
//! The sink drives backpressure: when pending in-memory bytes cross the
//! high watermark the engine asks the caller to send `CONTROL(PAUSE)`
//! upstream, exactly once per crossing, and `CONTROL(RESUME)` once the
//! backlog drains below the low watermark.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use oakum_crypto::SessionCipher;
use oakum_net::{ChannelEvent, DatagramChannel};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::config::TransferConfig;
use crate::reorder::ReorderBuffer;
use crate::transfer::progress::TransferProgress;
use crate::wire::control::{self, ControlMessage, FlowAction};
use crate::wire::frame;
use crate::wire::manifest::TransferManifest;
use crate::{ProtocolError, Result};

/// What the caller should do after a frame was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverSignal {
    /// Send `CONTROL(PAUSE)` to the sender
    Pause,
    /// Send `CONTROL(RESUME)` to the sender
    Resume,
    /// End of stream reached; acknowledge with `DOWNLOAD_COMPLETE`
    Complete,
}

/// Counter snapshot of the receive path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    /// Data frames accepted
    pub frames_accepted: u64,
    /// Frames dropped as malformed
    pub malformed_frames: u64,
    /// Plain frames dropped on checksum mismatch
    pub crc_failures: u64,
    /// Encrypted frames dropped on authentication failure
    pub decrypt_failures: u64,
    /// Bytes written to the sink
    pub bytes_written: u64,
}

/// Reassembles one inbound stream and writes it to a sink
pub struct ReceiverEngine<W: AsyncWrite + Unpin + Send> {
    sink: W,
    session: Option<SessionCipher>,
    reorder: ReorderBuffer,
    config: TransferConfig,
    batch: BytesMut,
    pause_sent: bool,
    complete: bool,
    stats: ReceiverStats,
    progress: TransferProgress,
    /// Cumulative starting offset of each file in the logical stream
    file_base: Vec<u64>,
    layout_warned: bool,
}

impl<W: AsyncWrite + Unpin + Send> ReceiverEngine<W> {
    /// Create an engine writing ordered bytes to `sink`.
    ///
    /// # Arguments
    ///
    /// * `sink` - Sequential byte sink (file writer, pipe, hasher)
    /// * `session` - Decrypts encrypted frames when set
    /// * `expected_bytes` - Manifest total, for progress tracking
    /// * `config` - Watermarks and reorder bounds
    pub fn new(
        sink: W,
        session: Option<SessionCipher>,
        expected_bytes: u64,
        config: TransferConfig,
    ) -> Self {
        let reorder = ReorderBuffer::new(&config);
        let progress = TransferProgress::new(expected_bytes);
        Self {
            sink,
            session,
            reorder,
            config,
            batch: BytesMut::new(),
            pause_sent: false,
            complete: false,
            stats: ReceiverStats::default(),
            progress,
            file_base: Vec::new(),
            layout_warned: false,
        }
    }

    /// Register per-file sizes from the manifest.
    ///
    /// Frame offsets are relative to their file; the stream position of a
    /// frame is its file's cumulative base plus that offset. Multi-file
    /// transfers need this before data arrives; a single-file stream works
    /// without it.
    pub fn set_file_layout(&mut self, sizes: &[u64]) {
        self.file_base.clear();
        let mut base = 0u64;
        for &size in sizes {
            self.file_base.push(base);
            base += size;
        }
    }

    /// Translate a frame's `(file_index, offset)` into its position in the
    /// logical stream.
    fn stream_offset(&mut self, file_index: u16, offset: u64) -> u64 {
        match self.file_base.get(file_index as usize) {
            Some(base) => base + offset,
            None => {
                if file_index != 0 && !self.layout_warned {
                    self.layout_warned = true;
                    tracing::warn!(
                        file_index,
                        "multi-file frame without a file layout, ordering may degrade"
                    );
                }
                offset
            }
        }
    }

    /// Whether the end-of-stream frame was processed
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Shared access to the sink
    pub fn sink(&self) -> &W {
        &self.sink
    }

    /// Consume the engine, returning the sink
    pub fn into_sink(self) -> W {
        self.sink
    }

    /// Counter snapshot
    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    /// Progress snapshot
    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }

    /// Bytes held in memory awaiting a gap fill or a sink flush
    pub fn pending_bytes(&self) -> usize {
        self.reorder.buffered_bytes() + self.batch.len()
    }

    /// Expire stale reorder entries; the owning task calls this on the
    /// configured sweep cadence.
    pub fn sweep(&mut self) -> usize {
        self.reorder.sweep()
    }

    /// Handle one inbound data frame.
    ///
    /// Returns a flow-control or completion signal for the caller to act
    /// on, or `None`. Frame-local failures are logged, counted, and
    /// swallowed; a sink write failure is fatal.
    pub async fn handle_frame(&mut self, datagram: Bytes) -> Result<Option<ReceiverSignal>> {
        if self.complete {
            return Ok(None);
        }

        let (file_index, offset, payload, eos) = match self.extract(&datagram) {
            Some(parts) => parts,
            None => return Ok(None), // dropped; counters updated in extract
        };

        if eos {
            return self.finish().await.map(Some);
        }
        self.stats.frames_accepted += 1;

        if !payload.is_empty() {
            let position = self.stream_offset(file_index, offset);
            for chunk in self.reorder.push(position, payload) {
                self.batch.extend_from_slice(&chunk);
            }
            if self.batch.len() >= self.config.write_batch {
                self.flush_batch().await?;
            }
        }

        Ok(self.flow_signal())
    }

    /// Classify, parse, and (if needed) decrypt one datagram.
    fn extract(&mut self, datagram: &Bytes) -> Option<(u16, u64, Bytes, bool)> {
        if frame::is_encrypted(datagram) {
            let header = match frame::parse_encrypted(datagram) {
                Ok(h) => h,
                Err(e) => {
                    self.stats.malformed_frames += 1;
                    tracing::debug!(error = %e, "dropping malformed encrypted frame");
                    return None;
                }
            };
            let Some(session) = self.session.as_ref() else {
                self.stats.decrypt_failures += 1;
                tracing::warn!("encrypted frame on a session without a key");
                return None;
            };
            match session.open(&header.nonce, frame::encrypted_ciphertext(datagram)) {
                Ok(plaintext) => Some((
                    header.file_index,
                    header.offset,
                    Bytes::from(plaintext),
                    header.is_eos(),
                )),
                Err(e) => {
                    self.stats.decrypt_failures += 1;
                    tracing::warn!(error = %e, offset = header.offset, "frame failed authentication");
                    None
                }
            }
        } else {
            let header = match frame::parse_plain(datagram) {
                Ok(h) => h,
                Err(e) => {
                    self.stats.malformed_frames += 1;
                    tracing::debug!(error = %e, "dropping malformed frame");
                    return None;
                }
            };
            let payload = datagram.slice(frame::PLAIN_HEADER_LEN..);
            if crc32fast::hash(&payload) != header.checksum {
                self.stats.crc_failures += 1;
                tracing::debug!(offset = header.offset, "dropping frame on checksum mismatch");
                return None;
            }
            Some((header.file_index, header.offset, payload, header.is_eos()))
        }
    }

    /// End of stream: drain everything deliverable and flush the sink.
    async fn finish(&mut self) -> Result<ReceiverSignal> {
        let buffered = self.reorder.buffered_bytes();
        if buffered > 0 {
            tracing::warn!(
                buffered_bytes = buffered,
                "end of stream with unfilled gaps, buffered bytes abandoned"
            );
        }
        self.flush_batch().await?;
        self.sink.flush().await.map_err(ProtocolError::Io)?;
        self.complete = true;
        Ok(ReceiverSignal::Complete)
    }

    async fn flush_batch(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let bytes = self.batch.split().freeze();
        self.sink.write_all(&bytes).await.map_err(ProtocolError::Io)?;
        self.stats.bytes_written += bytes.len() as u64;
        self.progress.update(self.stats.bytes_written);
        Ok(())
    }

    /// Edge-triggered pause/resume on the pending-byte watermarks.
    fn flow_signal(&mut self) -> Option<ReceiverSignal> {
        let pending = self.pending_bytes();
        if !self.pause_sent && pending >= self.config.write_high {
            self.pause_sent = true;
            return Some(ReceiverSignal::Pause);
        }
        if self.pause_sent && pending <= self.config.write_low {
            self.pause_sent = false;
            return Some(ReceiverSignal::Resume);
        }
        None
    }
}

/// Send `DOWNLOAD_COMPLETE`, repeated to tolerate ack loss.
pub async fn announce_complete(
    channel: &dyn DatagramChannel,
    repeats: u32,
    spacing: Duration,
) -> Result<()> {
    let wire = control::encode(&ControlMessage::DownloadComplete)?;
    for i in 0..repeats.max(1) {
        if i > 0 {
            tokio::time::sleep(spacing).await;
        }
        if let Err(e) = channel.try_send(wire.clone()) {
            tracing::debug!(error = %e, "completion ack send failed");
        }
    }
    Ok(())
}

/// Summary returned when a receive session ends
#[derive(Debug)]
pub struct ReceiverReport {
    /// Bytes delivered to the sink
    pub bytes_written: u64,
    /// Manifest announced by the sender, if one arrived
    pub manifest: Option<TransferManifest>,
    /// Final engine counters
    pub stats: ReceiverStats,
}

/// Drives a [`ReceiverEngine`] from a datagram channel until the stream
/// completes.
pub struct ReceiverSession<W: AsyncWrite + Unpin + Send> {
    engine: ReceiverEngine<W>,
    channel: Box<dyn DatagramChannel>,
    events: mpsc::Receiver<ChannelEvent>,
    manifest: Option<TransferManifest>,
    queued_position: Option<u32>,
}

impl<W: AsyncWrite + Unpin + Send> ReceiverSession<W> {
    /// Wrap an engine around a channel.
    ///
    /// Returns an error if the channel's event stream was already taken.
    pub fn new(engine: ReceiverEngine<W>, mut channel: Box<dyn DatagramChannel>) -> Result<Self> {
        let events = channel.take_events().ok_or_else(|| {
            ProtocolError::TransferFailed("channel event stream already taken".into())
        })?;
        Ok(Self {
            engine,
            channel,
            events,
            manifest: None,
            queued_position: None,
        })
    }

    /// Tell the sender this receiver's sink is initialised.
    pub fn announce_ready(&self) -> Result<()> {
        let wire = control::encode(&ControlMessage::TransferReady)?;
        self.channel.try_send(wire)?;
        Ok(())
    }

    /// Queue position assigned by the sender, if this receiver was queued
    pub fn queued_position(&self) -> Option<u32> {
        self.queued_position
    }

    /// Shared access to the engine
    pub fn engine(&self) -> &ReceiverEngine<W> {
        &self.engine
    }

    /// Consume the session, returning the engine (and through it the sink)
    pub fn into_engine(self) -> ReceiverEngine<W> {
        self.engine
    }

    /// Process events until the stream completes or the channel closes.
    pub async fn run(&mut self) -> Result<ReceiverReport> {
        let mut sweep = tokio::time::interval(self.engine.config.reorder_sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut keepalive = tokio::time::interval(self.engine.config.keep_alive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut saw_traffic = false;

        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(ChannelEvent::Datagram(datagram)) => {
                            saw_traffic = true;
                            if self.handle_datagram(datagram).await? {
                                break;
                            }
                        }
                        Some(ChannelEvent::Drain { .. }) => {}
                        Some(ChannelEvent::Closed) | None => {
                            if !self.engine.is_complete() {
                                return Err(ProtocolError::TransferFailed(
                                    "channel closed before end of stream".into(),
                                ));
                            }
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.engine.sweep();
                }
                _ = keepalive.tick() => {
                    // Only while the link is otherwise idle.
                    if !saw_traffic {
                        let wire = control::encode(&ControlMessage::KeepAlive)?;
                        let _ = self.channel.try_send(wire);
                    }
                    saw_traffic = false;
                }
            }
        }

        Ok(ReceiverReport {
            bytes_written: self.engine.stats().bytes_written,
            manifest: self.manifest.clone(),
            stats: self.engine.stats(),
        })
    }

    /// Returns true once the stream is complete and acknowledged.
    async fn handle_datagram(&mut self, datagram: Bytes) -> Result<bool> {
        if control::is_control(&datagram) {
            match control::decode(&datagram) {
                Ok(ControlMessage::Manifest { manifest }) => {
                    if let Some(files) = manifest.files.as_ref() {
                        let sizes: Vec<u64> = files.iter().map(|f| f.size).collect();
                        self.engine.set_file_layout(&sizes);
                    }
                    self.manifest = Some(manifest);
                }
                Ok(ControlMessage::Queued { position, .. }) => {
                    self.queued_position = Some(position);
                }
                Ok(ControlMessage::TransferStarting)
                | Ok(ControlMessage::TransferStarted)
                | Ok(ControlMessage::KeepAlive) => {}
                Ok(other) => {
                    tracing::debug!(message = ?other, "unexpected control message on receive side");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "undecodable control message");
                }
            }
            return Ok(false);
        }

        match self.engine.handle_frame(datagram).await? {
            Some(ReceiverSignal::Pause) => {
                self.send_flow(FlowAction::Pause)?;
                Ok(false)
            }
            Some(ReceiverSignal::Resume) => {
                self.send_flow(FlowAction::Resume)?;
                Ok(false)
            }
            Some(ReceiverSignal::Complete) => {
                announce_complete(
                    self.channel.as_ref(),
                    self.engine.config.complete_ack_repeats,
                    self.engine.config.complete_ack_spacing,
                )
                .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn send_flow(&self, action: FlowAction) -> Result<()> {
        let wire = control::encode(&ControlMessage::Control { action })?;
        self.channel.try_send(wire)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::frame::encode_plain;

    fn engine_with(config: TransferConfig) -> ReceiverEngine<Vec<u8>> {
        ReceiverEngine::new(Vec::new(), None, 0, config)
    }

    fn plain(payload: &[u8], offset: u64) -> Bytes {
        Bytes::from(encode_plain(payload, 0, offset, 64 * 1024))
    }

    #[tokio::test]
    async fn test_in_order_frames_reach_sink_at_eos() {
        let mut engine = engine_with(TransferConfig::default());
        engine.handle_frame(plain(b"hello ", 0)).await.unwrap();
        engine.handle_frame(plain(b"world", 6)).await.unwrap();
        let signal = engine
            .handle_frame(Bytes::from(frame::encode_eos()))
            .await
            .unwrap();
        assert_eq!(signal, Some(ReceiverSignal::Complete));
        assert!(engine.is_complete());
        assert_eq!(engine.sink, b"hello world");
        assert_eq!(engine.stats().bytes_written, 11);
    }

    #[tokio::test]
    async fn test_multi_file_offsets_use_the_layout() {
        let mut engine = engine_with(TransferConfig::default());
        engine.set_file_layout(&[6, 5]);

        // The second file's first frame arrives before the first file's.
        let late = Bytes::from(encode_plain(b"world", 1, 0, 64 * 1024));
        let early = Bytes::from(encode_plain(b"hello ", 0, 0, 64 * 1024));
        engine.handle_frame(late).await.unwrap();
        engine.handle_frame(early).await.unwrap();
        engine
            .handle_frame(Bytes::from(frame::encode_eos()))
            .await
            .unwrap();
        assert_eq!(engine.sink, b"hello world");
    }

    #[tokio::test]
    async fn test_out_of_order_frames_are_reordered() {
        let mut engine = engine_with(TransferConfig::default());
        engine.handle_frame(plain(b"world", 6)).await.unwrap();
        engine.handle_frame(plain(b"hello ", 0)).await.unwrap();
        engine
            .handle_frame(Bytes::from(frame::encode_eos()))
            .await
            .unwrap();
        assert_eq!(engine.sink, b"hello world");
    }

    #[tokio::test]
    async fn test_corrupt_frame_dropped_stream_continues() {
        let mut engine = engine_with(TransferConfig::default());
        let mut corrupt = encode_plain(b"bad!", 0, 0, 64 * 1024);
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;

        assert_eq!(engine.handle_frame(Bytes::from(corrupt)).await.unwrap(), None);
        assert_eq!(engine.stats().crc_failures, 1);

        engine.handle_frame(plain(b"good", 0)).await.unwrap();
        engine
            .handle_frame(Bytes::from(frame::encode_eos()))
            .await
            .unwrap();
        assert_eq!(engine.sink, b"good");
    }

    #[tokio::test]
    async fn test_malformed_frames_counted() {
        let mut engine = engine_with(TransferConfig::default());
        assert_eq!(engine.handle_frame(Bytes::from_static(&[9, 9])).await.unwrap(), None);
        assert_eq!(engine.stats().malformed_frames, 1);
    }

    #[tokio::test]
    async fn test_encrypted_frame_auth_failure_dropped() {
        let config = TransferConfig::default();
        let session = SessionCipher::sequential([0x11; 32], [0x02; 8]);
        let mut engine = ReceiverEngine::new(Vec::new(), Some(session), 0, config);

        // Produced under a different key.
        let mut other = SessionCipher::sequential([0x22; 32], [0x02; 8]);
        let mut payload = b"wrong key".to_vec();
        let (nonce, tag) = other.seal_in_place(&mut payload, 0, 9).unwrap();
        let mut wire = vec![0u8; frame::ENCRYPTED_HEADER_LEN];
        frame::write_encrypted_header(
            &mut wire,
            &frame::EncryptedHeader {
                flags: frame::FLAG_ENCRYPTED,
                file_index: 0,
                chunk_index: 0,
                offset: 0,
                plaintext_length: 9,
                nonce,
            },
        );
        wire.extend_from_slice(&payload);
        wire.extend_from_slice(&tag);

        assert_eq!(engine.handle_frame(Bytes::from(wire)).await.unwrap(), None);
        assert_eq!(engine.stats().decrypt_failures, 1);
        assert!(!engine.is_complete());
    }

    #[tokio::test]
    async fn test_zero_length_frame_produces_no_bytes() {
        let mut engine = engine_with(TransferConfig::default());
        engine.handle_frame(plain(&[], 0)).await.unwrap();
        engine
            .handle_frame(Bytes::from(frame::encode_eos()))
            .await
            .unwrap();
        assert!(engine.sink.is_empty());
    }

    #[tokio::test]
    async fn test_pause_and_resume_edges_fire_once() {
        let config = TransferConfig {
            write_low: 8,
            write_high: 16,
            write_batch: 1024,
            ..TransferConfig::default()
        };
        let mut engine = engine_with(config);

        // Leave a gap at 0 so bytes accumulate in the reorder buffer.
        let first = engine.handle_frame(plain(b"0123456789abcdef", 100)).await.unwrap();
        assert_eq!(first, Some(ReceiverSignal::Pause));

        // Still above the low watermark: no repeat.
        let second = engine.handle_frame(plain(b"xyz", 200)).await.unwrap();
        assert_eq!(second, None);

        // More buffered data while the gap at 0 persists: still paused,
        // no repeat signal.
        let third = engine.handle_frame(plain(&[7u8; 84], 16)).await.unwrap();
        assert_eq!(third, None);
        assert!(engine.pending_bytes() > 8);
    }

    #[tokio::test]
    async fn test_resume_after_batch_flush() {
        let config = TransferConfig {
            write_low: 8,
            write_high: 16,
            write_batch: 4, // flush almost immediately
            ..TransferConfig::default()
        };
        let mut engine = engine_with(config);

        let pause = engine.handle_frame(plain(&[1u8; 20], 50)).await.unwrap();
        assert_eq!(pause, Some(ReceiverSignal::Pause));

        // Filling the gap drains the reorder buffer into the batch, which
        // flushes to the sink; pending falls to zero and resume fires once.
        let resume = engine.handle_frame(plain(&[2u8; 50], 0)).await.unwrap();
        assert_eq!(resume, Some(ReceiverSignal::Resume));

        let again = engine.handle_frame(plain(&[3u8; 2], 70)).await.unwrap();
        assert_eq!(again, None, "resume is edge-triggered");
    }

    #[tokio::test]
    async fn test_frames_after_completion_ignored() {
        let mut engine = engine_with(TransferConfig::default());
        engine
            .handle_frame(Bytes::from(frame::encode_eos()))
            .await
            .unwrap();
        assert!(engine.is_complete());
        assert_eq!(engine.handle_frame(plain(b"late", 0)).await.unwrap(), None);
        assert!(engine.sink.is_empty());
    }
}
