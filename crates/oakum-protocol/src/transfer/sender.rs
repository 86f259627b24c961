//! Sender engine: reads source bytes and packages them into packets
//!
//! The engine walks the ordered file list chunk by chunk, pushing each
//! chunk through the slot pool (acquire, write payload, commit with CRC or
//! in-place AEAD) and handing finished packets to the caller for
//! broadcast. After the last file it emits a single end-of-stream frame.
//!
//! The engine does not talk to transports or peers itself; the swarm
//! coordinator owns broadcast, flow control, and admission, and calls
//! `process_batch` only when its flow gate is open.

use bytes::Bytes;
use oakum_crypto::SessionCipher;

use crate::config::TransferConfig;
use crate::pool::{PoolStats, SlotPool};
use crate::transfer::progress::TransferProgress;
use crate::transfer::source::ChunkSource;
use crate::wire::frame::EOS_FILE_INDEX;
use crate::wire::manifest::TransferManifest;
use crate::{ProtocolError, Result};

/// Reads from a [`ChunkSource`] and produces wire-ready packets
pub struct SenderEngine<S: ChunkSource> {
    source: S,
    manifest: TransferManifest,
    pool: SlotPool,
    session: Option<SessionCipher>,
    config: TransferConfig,
    file_index: usize,
    offset_in_file: u64,
    total_sent: u64,
    eos_sent: bool,
    progress: TransferProgress,
}

impl<S: ChunkSource> SenderEngine<S> {
    /// Create an engine over a source.
    ///
    /// # Arguments
    ///
    /// * `source` - Ordered files to stream
    /// * `manifest` - Sent to receivers before data; `total_size` seeds
    ///   progress tracking
    /// * `session` - Encrypt every packet when set; plain frames otherwise
    /// * `config` - Pool geometry and chunking limits
    pub fn new(
        source: S,
        manifest: TransferManifest,
        session: Option<SessionCipher>,
        config: TransferConfig,
    ) -> Result<Self> {
        config.validate()?;
        if source.files().len() >= usize::from(EOS_FILE_INDEX) {
            return Err(ProtocolError::InvalidConfig(format!(
                "{} files collide with the end-of-stream index",
                source.files().len()
            )));
        }
        let pool = SlotPool::new(&config)?;
        let progress = TransferProgress::new(manifest.total_size);
        Ok(Self {
            source,
            manifest,
            pool,
            session,
            config,
            file_index: 0,
            offset_in_file: 0,
            total_sent: 0,
            eos_sent: false,
            progress,
        })
    }

    /// The manifest receivers are given before data flows
    pub fn manifest(&self) -> &TransferManifest {
        &self.manifest
    }

    /// Whether the end-of-stream frame has been emitted
    pub fn is_finished(&self) -> bool {
        self.eos_sent
    }

    /// Payload bytes emitted so far (excluding headers and tags)
    pub fn total_sent(&self) -> u64 {
        self.total_sent
    }

    /// Progress snapshot
    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }

    /// Slot pool counters
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Rewind to the start of the file list for a fresh batch of peers.
    ///
    /// Cumulative counters survive; only the read cursor and the
    /// end-of-stream marker reset.
    pub fn rewind(&mut self) {
        self.file_index = 0;
        self.offset_in_file = 0;
        self.eos_sent = false;
    }

    /// Discard in-flight state and stop producing.
    ///
    /// Drains the pool, which bumps every generation: any stale handle a
    /// worker still holds is rejected by the pool guard afterwards.
    pub fn abort(&mut self) {
        self.pool.drain();
        self.eos_sent = true;
    }

    /// Produce up to `count` packets.
    ///
    /// Walks files in order, emitting strictly increasing offsets within
    /// each file and finishing file `i` before starting file `i + 1`. The
    /// final call emits the end-of-stream frame and marks the engine
    /// finished. Returns fewer than `count` packets when the stream ends
    /// or the pool is momentarily saturated.
    pub async fn process_batch(&mut self, count: usize) -> Result<Vec<Bytes>> {
        let mut packets = Vec::with_capacity(count);
        while packets.len() < count && !self.eos_sent {
            if self.file_index >= self.source.files().len() {
                if let Some(packet) = self.emit_eos()? {
                    packets.push(packet);
                }
                self.eos_sent = true;
                break;
            }
            let file_size = self.source.files()[self.file_index].size;
            if self.offset_in_file >= file_size {
                self.file_index += 1;
                self.offset_in_file = 0;
                continue;
            }

            let readable = u64::from(self.config.max_chunk_size)
                .min(file_size - self.offset_in_file) as usize;
            let Some(grant) = self.pool.acquire() else {
                // Saturated; the caller retries after releases catch up.
                break;
            };

            let offset = self.offset_in_file;
            let file_index = self.file_index;
            {
                let payload = self
                    .pool
                    .payload_mut(grant.slot, grant.generation)
                    .ok_or_else(|| {
                        ProtocolError::TransferFailed("fresh slot grant went stale".into())
                    })?;
                self.source
                    .read_chunk(file_index, offset, &mut payload[..readable])
                    .await?;
            }

            let packet_len = match self.session.as_mut() {
                Some(session) => self.pool.commit_encrypted(
                    grant.slot,
                    readable,
                    file_index as u16,
                    offset,
                    session,
                    grant.generation,
                )?,
                None => self.pool.commit_plain(
                    grant.slot,
                    readable,
                    file_index as u16,
                    offset,
                    grant.generation,
                ),
            };
            if packet_len == 0 {
                self.pool.release(grant.slot);
                return Err(ProtocolError::TransferFailed(
                    "slot commit failed under exclusive ownership".into(),
                ));
            }
            let packet = self
                .pool
                .packet_bytes(grant.slot, grant.generation)
                .ok_or_else(|| ProtocolError::TransferFailed("committed packet unreadable".into()))?;
            self.pool.release(grant.slot);

            self.offset_in_file += readable as u64;
            self.total_sent += readable as u64;
            self.progress.update(self.total_sent);
            packets.push(packet);
        }
        Ok(packets)
    }

    /// Emit the end-of-stream frame through the pool (encrypted when a
    /// session is active, so the stream stays uniform on the wire).
    fn emit_eos(&mut self) -> Result<Option<Bytes>> {
        let Some(grant) = self.pool.acquire() else {
            return Err(ProtocolError::TransferFailed(
                "pool saturated at end of stream".into(),
            ));
        };
        let packet_len = match self.session.as_mut() {
            Some(session) => {
                self.pool
                    .commit_encrypted(grant.slot, 0, EOS_FILE_INDEX, 0, session, grant.generation)?
            }
            None => self
                .pool
                .commit_plain(grant.slot, 0, EOS_FILE_INDEX, 0, grant.generation),
        };
        if packet_len == 0 {
            self.pool.release(grant.slot);
            return Err(ProtocolError::TransferFailed(
                "end-of-stream commit failed".into(),
            ));
        }
        let packet = self.pool.packet_bytes(grant.slot, grant.generation);
        self.pool.release(grant.slot);
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::source::BufferSource;
    use crate::wire::frame;

    fn config_with_chunk(chunk: u32) -> TransferConfig {
        TransferConfig {
            max_chunk_size: chunk,
            slot_size: chunk as usize + crate::config::SLOT_OVERHEAD,
            ..TransferConfig::default()
        }
    }

    fn source_of(bytes: &'static [u8]) -> BufferSource {
        BufferSource::new(vec![("f.bin", Bytes::from_static(bytes))])
    }

    #[tokio::test]
    async fn test_single_file_chunking_and_eos() {
        let source = source_of(b"abcdefghij"); // 10 bytes
        let manifest = TransferManifest::new(10, 1);
        let mut engine =
            SenderEngine::new(source, manifest, None, config_with_chunk(4)).unwrap();

        let packets = engine.process_batch(16).await.unwrap();
        // ceil(10 / 4) = 3 data frames plus the end-of-stream frame.
        assert_eq!(packets.len(), 4);
        assert!(engine.is_finished());
        assert_eq!(engine.total_sent(), 10);

        let offsets: Vec<u64> = packets[..3]
            .iter()
            .map(|p| frame::parse_plain(p).unwrap().offset)
            .collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        assert!(frame::is_eos(&packets[3]));
        assert!(packets[..3].iter().all(|p| frame::verify_plain(p)));
    }

    #[tokio::test]
    async fn test_file_boundaries_in_order() {
        let source = BufferSource::new(vec![
            ("a", Bytes::from_static(b"11111")),
            ("b", Bytes::from_static(b"22")),
            ("c", Bytes::from_static(b"333333")),
        ]);
        let manifest = TransferManifest::new(13, 3);
        let mut engine =
            SenderEngine::new(source, manifest, None, config_with_chunk(4)).unwrap();

        let packets = engine.process_batch(64).await.unwrap();
        let headers: Vec<(u16, u64)> = packets
            .iter()
            .take(packets.len() - 1)
            .map(|p| {
                let h = frame::parse_plain(p).unwrap();
                (h.file_index, h.offset)
            })
            .collect();
        assert_eq!(headers, vec![(0, 0), (0, 4), (1, 0), (2, 0), (2, 4)]);
    }

    #[tokio::test]
    async fn test_batches_resume_where_they_stopped() {
        let source = source_of(b"abcdefghij");
        let manifest = TransferManifest::new(10, 1);
        let mut engine =
            SenderEngine::new(source, manifest, None, config_with_chunk(4)).unwrap();

        let first = engine.process_batch(2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert!(!engine.is_finished());

        let rest = engine.process_batch(16).await.unwrap();
        assert_eq!(rest.len(), 2); // last data frame + EOS
        assert!(engine.is_finished());

        // Further batches produce nothing.
        assert!(engine.process_batch(4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_encrypted_stream_decrypts_in_order() {
        let source = source_of(b"confidential payload!");
        let manifest = TransferManifest::new(21, 1);
        let session = SessionCipher::sequential([0xAA; 32], [0x01; 8]);
        let mut engine =
            SenderEngine::new(source, manifest, Some(session), config_with_chunk(8)).unwrap();

        let packets = engine.process_batch(16).await.unwrap();
        let receiver = SessionCipher::sequential([0xAA; 32], [0x01; 8]);
        let mut recovered = Vec::new();
        for packet in &packets {
            let header = frame::parse_encrypted(packet).unwrap();
            if header.is_eos() {
                continue;
            }
            let plain = receiver
                .open(&header.nonce, frame::encrypted_ciphertext(packet))
                .unwrap();
            recovered.extend_from_slice(&plain);
        }
        assert_eq!(recovered, b"confidential payload!");
    }

    #[tokio::test]
    async fn test_rewind_replays_stream() {
        let source = source_of(b"replay me");
        let manifest = TransferManifest::new(9, 1);
        let mut engine =
            SenderEngine::new(source, manifest, None, config_with_chunk(4)).unwrap();

        let first = engine.process_batch(16).await.unwrap();
        engine.rewind();
        assert!(!engine.is_finished());
        let second = engine.process_batch(16).await.unwrap();
        assert_eq!(first.len(), second.len());
        assert_eq!(first[0], second[0]);
    }

    #[tokio::test]
    async fn test_empty_file_list_emits_only_eos() {
        let source = BufferSource::new(vec![]);
        let manifest = TransferManifest::new(0, 0);
        let mut engine =
            SenderEngine::new(source, manifest, None, TransferConfig::default()).unwrap();
        let packets = engine.process_batch(4).await.unwrap();
        assert_eq!(packets.len(), 1);
        assert!(frame::is_eos(&packets[0]));
        assert!(engine.is_finished());
    }

    #[tokio::test]
    async fn test_abort_stops_production() {
        let source = source_of(b"abcdefgh");
        let manifest = TransferManifest::new(8, 1);
        let mut engine =
            SenderEngine::new(source, manifest, None, config_with_chunk(4)).unwrap();
        engine.abort();
        assert!(engine.is_finished());
        assert!(engine.process_batch(4).await.unwrap().is_empty());
    }
}
