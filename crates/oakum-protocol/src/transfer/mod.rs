//! Transfer pipeline: sources, flow control, sender and receiver engines

pub mod flow;
pub mod progress;
pub mod receiver;
pub mod sender;
pub mod source;

pub use flow::FlowControl;
pub use progress::TransferProgress;
pub use receiver::{ReceiverEngine, ReceiverSignal};
pub use sender::SenderEngine;
pub use source::{BufferSource, ChunkSource, FileSet, SourceFile};
