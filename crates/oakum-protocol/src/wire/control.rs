//! Control-plane messages
//!
//! Control messages travel as one JSON object per datagram, UTF-8 encoded.
//! Data frames never start with `{`, so the first byte classifies a
//! datagram as control or data.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::wire::manifest::TransferManifest;
use crate::{ProtocolError, Result};

/// Receiver-driven flow control verb
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FlowAction {
    /// Stop requesting new batches until resumed
    #[serde(rename = "PAUSE")]
    Pause,
    /// Resume after a pause
    #[serde(rename = "RESUME")]
    Resume,
}

/// Control messages exchanged between sender and receivers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ControlMessage {
    /// Sender → receiver, before any data
    #[serde(rename = "MANIFEST")]
    Manifest {
        /// Describes what the transfer will deliver
        manifest: TransferManifest,
    },
    /// Receiver → sender, once its sink is initialised
    #[serde(rename = "TRANSFER_READY")]
    TransferReady,
    /// Sender → receiver, data incoming
    #[serde(rename = "TRANSFER_STARTED")]
    TransferStarted,
    /// Sender → dequeued receiver, before its `MANIFEST`
    #[serde(rename = "TRANSFER_STARTING")]
    TransferStarting,
    /// Sender → receiver that signalled ready mid-batch
    #[serde(rename = "QUEUED")]
    Queued {
        /// Human-readable explanation
        message: String,
        /// 1-based position in the waiting queue
        position: u32,
    },
    /// Receiver → sender flow control
    #[serde(rename = "CONTROL")]
    Control {
        /// Pause or resume
        action: FlowAction,
    },
    /// Receiver → sender, may repeat to tolerate ack loss
    #[serde(rename = "DOWNLOAD_COMPLETE")]
    DownloadComplete,
    /// Either direction, on a 5 s cadence while idle
    #[serde(rename = "KEEP_ALIVE")]
    KeepAlive,
}

/// Whether a datagram carries a control message rather than a data frame
pub fn is_control(datagram: &[u8]) -> bool {
    datagram.first() == Some(&b'{')
}

/// Encode a control message to its wire form.
pub fn encode(message: &ControlMessage) -> Result<Bytes> {
    serde_json::to_vec(message)
        .map(Bytes::from)
        .map_err(|e| ProtocolError::InvalidControl(format!("encode: {}", e)))
}

/// Decode a control datagram.
pub fn decode(datagram: &[u8]) -> Result<ControlMessage> {
    serde_json::from_slice(datagram)
        .map_err(|e| ProtocolError::InvalidControl(format!("decode: {}", e)))
}
