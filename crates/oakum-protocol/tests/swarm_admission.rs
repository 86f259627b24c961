//! 1:N admission over in-memory channels with a paused clock
//!
//! Plays the three-receiver choreography: A ready at t=0, B ready at
//! t=2 s, C silent until mid-transfer. The batch must start at the
//! countdown with {A, B}, C must be queued with position 1, and the queue
//! must be promoted once the batch completes.

use std::time::Duration;

use bytes::Bytes;
use oakum_net::{channel_pair, ChannelEvent, DatagramChannel, MemoryChannel, MemoryChannelConfig};
use oakum_protocol::config::TransferConfig;
use oakum_protocol::swarm::{PeerState, SwarmEvent, SwarmHandle};
use oakum_protocol::transfer::sender::SenderEngine;
use oakum_protocol::transfer::source::BufferSource;
use oakum_protocol::wire::control::{self, ControlMessage};
use oakum_protocol::wire::frame;
use oakum_protocol::wire::manifest::TransferManifest;
use tokio::sync::mpsc;

/// A hand-driven receiver endpoint: the test plays the receiver role.
struct RemotePeer {
    channel: MemoryChannel,
    events: mpsc::Receiver<ChannelEvent>,
}

impl RemotePeer {
    fn new(mut channel: MemoryChannel) -> Self {
        let events = channel.take_events().unwrap();
        Self { channel, events }
    }

    fn send_control(&self, message: &ControlMessage) {
        self.channel.try_send(control::encode(message).unwrap()).unwrap();
    }

    /// Read datagrams until the end-of-stream frame, returning the control
    /// messages seen and the reassembled payload bytes.
    async fn read_stream(&mut self) -> (Vec<ControlMessage>, Vec<u8>) {
        let mut controls = Vec::new();
        let mut payload = Vec::new();
        loop {
            match self.events.recv().await.expect("channel ended") {
                ChannelEvent::Datagram(datagram) => {
                    if control::is_control(&datagram) {
                        controls.push(control::decode(&datagram).unwrap());
                        continue;
                    }
                    if frame::is_eos(&datagram) {
                        return (controls, payload);
                    }
                    let header = frame::parse_plain(&datagram).unwrap();
                    assert_eq!(header.offset as usize, payload.len(), "in-order delivery");
                    payload.extend_from_slice(frame::plain_payload(&datagram));
                }
                ChannelEvent::Drain { .. } => continue,
                ChannelEvent::Closed => panic!("channel closed mid-stream"),
            }
        }
    }

    /// Wait for a specific control message, skipping keep-alives and drains.
    async fn expect_control(&mut self, want: &ControlMessage) {
        loop {
            match self.events.recv().await.expect("channel ended") {
                ChannelEvent::Datagram(datagram) if control::is_control(&datagram) => {
                    let message = control::decode(&datagram).unwrap();
                    if &message == want {
                        return;
                    }
                    if matches!(message, ControlMessage::KeepAlive) {
                        continue;
                    }
                    panic!("expected {:?}, got {:?}", want, message);
                }
                ChannelEvent::Datagram(_) => panic!("unexpected data frame"),
                _ => continue,
            }
        }
    }
}

async fn expect_event(events: &mut mpsc::Receiver<SwarmEvent>, want: &SwarmEvent) {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended");
        if &event == want {
            return;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_one_to_n_admission_queue_and_promotion() {
    let config = TransferConfig::default();
    let payload = Bytes::from(vec![0x5A; 200_000]); // ~4 frames
    let total = payload.len() as u64;
    let engine = SenderEngine::new(
        BufferSource::new(vec![("data.bin", payload.clone())]),
        TransferManifest::new(total, 1),
        None,
        config.clone(),
    )
    .unwrap();

    let (coordinator, handle, mut events) = SwarmHandle::new(engine, config);
    let coordinator_task = tokio::spawn(coordinator.run());

    let mut remotes = Vec::new();
    for id in ["peer-a", "peer-b", "peer-c"] {
        let (local, remote) = channel_pair(MemoryChannelConfig::default());
        handle
            .add_peer(id.to_string(), true, Box::new(local))
            .await
            .unwrap();
        let remote = RemotePeer::new(remote);
        // A keep-alive marks the peer's channel as live (Connecting ->
        // Connected) without announcing readiness.
        remote.send_control(&ControlMessage::KeepAlive);
        remotes.push(remote);
    }
    let mut c = remotes.pop().unwrap();
    let mut b = remotes.pop().unwrap();
    let mut a = remotes.pop().unwrap();

    // Wait until the keep-alives landed and all three peers are Connected;
    // otherwise a straggling peer would shrink the pending set and change
    // the admission outcome.
    loop {
        let snapshot = handle.snapshot().await.unwrap();
        if snapshot.peers.len() == 3
            && snapshot.peers.iter().all(|(_, s)| *s == PeerState::Connected)
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // t = 0: A is ready. With B and C connected but silent, the countdown
    // starts rather than the batch.
    a.send_control(&ControlMessage::TransferReady);
    expect_event(&mut events, &SwarmEvent::PeerReady { peer: "peer-a".into() }).await;
    expect_event(
        &mut events,
        &SwarmEvent::ReadyCountdownStart {
            wait: Duration::from_secs(10),
        },
    )
    .await;

    // t = 2 s: B is ready too. C still pending, so the countdown holds.
    tokio::time::sleep(Duration::from_secs(2)).await;
    b.send_control(&ControlMessage::TransferReady);
    expect_event(&mut events, &SwarmEvent::PeerReady { peer: "peer-b".into() }).await;

    // t = 10 s: the countdown fires; the batch is whoever is ready.
    expect_event(
        &mut events,
        &SwarmEvent::TransferBatchStart {
            peers: vec!["peer-a".into(), "peer-b".into()],
        },
    )
    .await;

    // C announces ready mid-transfer and is queued at position 1.
    c.send_control(&ControlMessage::TransferReady);
    expect_event(
        &mut events,
        &SwarmEvent::PeerQueued {
            peer: "peer-c".into(),
            position: 1,
        },
    )
    .await;
    c.expect_control(&ControlMessage::Queued {
        message: "transfer in progress, queued for the next batch".into(),
        position: 1,
    })
    .await;

    // A and B stream to completion and acknowledge.
    let (a_controls, a_bytes) = a.read_stream().await;
    assert!(a_controls
        .iter()
        .any(|m| matches!(m, ControlMessage::Manifest { .. })));
    assert!(a_controls
        .iter()
        .any(|m| matches!(m, ControlMessage::TransferStarted)));
    assert_eq!(a_bytes, payload.to_vec());
    let (_, b_bytes) = b.read_stream().await;
    assert_eq!(b_bytes, payload.to_vec());

    a.send_control(&ControlMessage::DownloadComplete);
    expect_event(&mut events, &SwarmEvent::PeerComplete { peer: "peer-a".into() }).await;
    b.send_control(&ControlMessage::DownloadComplete);
    expect_event(&mut events, &SwarmEvent::PeerComplete { peer: "peer-b".into() }).await;
    expect_event(&mut events, &SwarmEvent::BatchComplete).await;

    // The queue is promoted: C gets the starting handshake and the data.
    expect_event(
        &mut events,
        &SwarmEvent::TransferBatchStart {
            peers: vec!["peer-c".into()],
        },
    )
    .await;
    c.expect_control(&ControlMessage::TransferStarting).await;
    let (c_controls, c_bytes) = c.read_stream().await;
    assert!(c_controls
        .iter()
        .any(|m| matches!(m, ControlMessage::Manifest { .. })));
    assert_eq!(c_bytes, payload.to_vec());

    c.send_control(&ControlMessage::DownloadComplete);
    expect_event(&mut events, &SwarmEvent::AllTransfersComplete).await;
    coordinator_task.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fourth_peer_rejected() {
    let config = TransferConfig::default();
    let engine = SenderEngine::new(
        BufferSource::new(vec![("data.bin", Bytes::from_static(b"x"))]),
        TransferManifest::new(1, 1),
        None,
        config.clone(),
    )
    .unwrap();
    let (coordinator, handle, _events) = SwarmHandle::new(engine, config);
    let _task = tokio::spawn(coordinator.run());

    // Keep every remote end alive; dropping one would close its pair and
    // evict a legitimately registered peer.
    let mut remotes = Vec::new();
    for i in 0..4 {
        let (local, remote) = channel_pair(MemoryChannelConfig::default());
        handle
            .add_peer(format!("peer-{}", i), true, Box::new(local))
            .await
            .unwrap();
        remotes.push(remote);
    }
    // The coordinator rejects the fourth peer by closing its channel.
    let mut remote = RemotePeer::new(remotes.pop().unwrap());
    loop {
        match tokio::time::timeout(Duration::from_secs(5), remote.events.recv())
            .await
            .expect("expected channel closure")
        {
            Some(ChannelEvent::Closed) | None => break,
            Some(_) => continue,
        }
    }
    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.peers.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_connecting_peer_times_out() {
    let config = TransferConfig::default();
    let engine = SenderEngine::new(
        BufferSource::new(vec![("data.bin", Bytes::from_static(b"x"))]),
        TransferManifest::new(1, 1),
        None,
        config.clone(),
    )
    .unwrap();
    let (coordinator, handle, _events) = SwarmHandle::new(engine, config);
    let _task = tokio::spawn(coordinator.run());

    // The peer never sends anything, so it never leaves Connecting.
    let (local, _remote) = channel_pair(MemoryChannelConfig::default());
    handle
        .add_peer("silent".into(), true, Box::new(local))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(31)).await;
    let snapshot = handle.snapshot().await.unwrap();
    assert!(snapshot.peers.is_empty(), "silent peer should be expired");
}
