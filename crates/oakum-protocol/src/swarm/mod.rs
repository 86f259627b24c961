//! Swarm coordination: peer table, admission, and the owning actor
//!
//! One coordinator task owns the sender engine, the peer table, and every
//! peer channel. Receivers announce readiness; the admission machine forms
//! them into batches (starting a countdown when only some are ready),
//! queues latecomers, and promotes the queue when a batch finishes. All
//! state changes surface as [`SwarmEvent`]s.

pub mod admission;
pub mod coordinator;
pub mod events;
pub mod peer;

pub use admission::{AdmissionAction, AdmissionMachine};
pub use coordinator::{SwarmCommand, SwarmCoordinator, SwarmHandle, SwarmSnapshot};
pub use events::SwarmEvent;
pub use peer::{PeerId, PeerRecord, PeerState, PeerTable};
