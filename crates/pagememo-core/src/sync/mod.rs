//! Peer synchronization
//!
//! - [`protocol`]: versioned wire messages exchanged over links
//! - [`backoff`]: who dials first and how retries are spaced
//! - [`events`]: what the coordinator publishes and reports
//! - [`coordinator`]: the task that ties transports, storage and events together

pub mod backoff;
pub mod coordinator;
pub mod events;
pub mod protocol;

pub use backoff::{should_initiate, Backoff};
pub use coordinator::{
    CoordinatorConfig, CoordinatorHandle, SyncCoordinator, TransportFactory, DEFAULT_GRACE_PERIOD,
};
pub use events::{CoordinatorDiagnostics, LinkState, PeerLinkInfo, RemoteEvent};
pub use protocol::{SyncMessage, WireMessage, PROTOCOL_VERSION};
