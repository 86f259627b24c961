//! End-to-end transfers over in-memory channels
//!
//! Wires a swarm coordinator (sender side) to receiver sessions through
//! bidirectional in-memory datagram channels and checks the full contract:
//! byte-exact delivery, encryption, completion acknowledgement, and the
//! observable event sequence.

use bytes::Bytes;
use oakum_crypto::SessionCipher;
use oakum_net::{channel_pair, MemoryChannelConfig};
use oakum_protocol::config::TransferConfig;
use oakum_protocol::swarm::{SwarmEvent, SwarmHandle};
use oakum_protocol::transfer::receiver::{ReceiverEngine, ReceiverSession, ReceiverSignal};
use oakum_protocol::transfer::sender::SenderEngine;
use oakum_protocol::transfer::source::BufferSource;
use oakum_protocol::transfer::ChunkSource;
use oakum_protocol::wire::manifest::{ManifestFile, TransferManifest};

const KEY: [u8; 32] = [0xAA; 32];
const PREFIX: [u8; 8] = [0x01; 8];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn one_mib() -> Bytes {
    Bytes::from((0..1024 * 1024).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

/// Drive one sender and one receiver to completion; returns the bytes the
/// receiver's sink saw.
async fn transfer_roundtrip(data: Bytes, encrypted: bool) -> Vec<u8> {
    init_tracing();
    let config = TransferConfig::default();
    let total = data.len() as u64;

    let source = BufferSource::new(vec![("payload.bin", data)]);
    let manifest = TransferManifest::new(total, 1);
    let send_session = encrypted.then(|| SessionCipher::sequential(KEY, PREFIX));
    let engine = SenderEngine::new(source, manifest, send_session, config.clone()).unwrap();

    let (coordinator, handle, mut events) = SwarmHandle::new(engine, config.clone());
    let coordinator_task = tokio::spawn(coordinator.run());

    let (sender_end, receiver_end) = channel_pair(MemoryChannelConfig::default());
    handle
        .add_peer("peer-1".into(), true, Box::new(sender_end))
        .await
        .unwrap();

    let recv_session = encrypted.then(|| SessionCipher::sequential(KEY, PREFIX));
    let engine = ReceiverEngine::new(Vec::new(), recv_session, total, config);
    let mut session = ReceiverSession::new(engine, Box::new(receiver_end)).unwrap();
    session.announce_ready().unwrap();

    let report = session.run().await.unwrap();
    assert_eq!(report.bytes_written, total);
    assert_eq!(report.manifest.unwrap().total_size, total);

    // The coordinator should observe completion and wind down cleanly.
    coordinator_task.await.unwrap().unwrap();

    let mut saw_batch_start = false;
    let mut saw_all_complete = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SwarmEvent::TransferBatchStart { ref peers } => {
                assert_eq!(peers, &vec!["peer-1".to_string()]);
                saw_batch_start = true;
            }
            SwarmEvent::AllTransfersComplete => saw_all_complete = true,
            _ => {}
        }
    }
    assert!(saw_batch_start, "batch start event missing");
    assert!(saw_all_complete, "completion event missing");

    session.into_engine().into_sink()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_file_plain_no_loss() {
    let data = one_mib();
    let received = transfer_roundtrip(data.clone(), false).await;
    assert_eq!(received.len(), 1_048_576);
    assert_eq!(received, data.to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_file_encrypted() {
    let data = one_mib();
    let received = transfer_roundtrip(data.clone(), true).await;
    assert_eq!(received, data.to_vec());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_small_transfer_multiple_files() {
    init_tracing();
    let config = TransferConfig::default();
    let source = BufferSource::new(vec![
        ("a.txt", Bytes::from_static(b"first file ")),
        ("b.txt", Bytes::from_static(b"second file ")),
        ("c.txt", Bytes::from_static(b"third file")),
    ]);
    let total: u64 = source.files().iter().map(|f| f.size).sum();
    // Multi-file streams need the per-file layout in the manifest so the
    // receiver can place each file's frames in the logical stream.
    let manifest = TransferManifest::from_files(
        source
            .files()
            .iter()
            .map(|f| ManifestFile {
                path: f.path.display().to_string(),
                size: f.size,
            })
            .collect(),
    );
    let engine = SenderEngine::new(source, manifest, None, config.clone()).unwrap();

    let (coordinator, handle, _events) = SwarmHandle::new(engine, config.clone());
    let coordinator_task = tokio::spawn(coordinator.run());

    let (sender_end, receiver_end) = channel_pair(MemoryChannelConfig::default());
    handle
        .add_peer("peer-1".into(), true, Box::new(sender_end))
        .await
        .unwrap();

    let engine = ReceiverEngine::new(Vec::new(), None, total, config);
    let mut session = ReceiverSession::new(engine, Box::new(receiver_end)).unwrap();
    session.announce_ready().unwrap();
    let report = session.run().await.unwrap();

    assert_eq!(report.bytes_written, total);
    assert_eq!(
        session.into_engine().into_sink(),
        b"first file second file third file"
    );
    coordinator_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stream_survives_frame_reordering() {
    init_tracing();
    let config = TransferConfig::default();
    let data = one_mib();
    let total = data.len() as u64;
    let source = BufferSource::new(vec![("payload.bin", data.clone())]);
    let mut sender = SenderEngine::new(
        source,
        TransferManifest::new(total, 1),
        None,
        config.clone(),
    )
    .unwrap();

    let mut packets = sender.process_batch(64).await.unwrap();
    assert!(sender.is_finished());
    let eos = packets.pop().unwrap();

    // Perturb the data frames (reversed pairs), keeping the end-of-stream
    // frame last; losing ordering of the terminator is the transport's
    // problem, not the reassembly layer's.
    for pair in packets.chunks_mut(2) {
        pair.reverse();
    }

    let mut receiver = ReceiverEngine::new(Vec::new(), None, total, config);
    for packet in packets {
        receiver.handle_frame(packet).await.unwrap();
    }
    let signal = receiver.handle_frame(eos).await.unwrap();
    assert_eq!(signal, Some(ReceiverSignal::Complete));
    assert_eq!(receiver.stats().bytes_written, total);
    assert_eq!(receiver.into_sink(), data.to_vec());
}
