//! Pagememo Core Library
//!
//! Peer-to-peer sharing of per-page annotations (notes, highlights, drawings).
//!
//! ## Overview
//!
//! Every installation has a stable identity. Users name the identities they
//! want to share with; the sync coordinator links to each of them over a
//! transport, hands over the current page's annotations when a link opens,
//! and then forwards every local create, update and delete. Inbound changes
//! are filtered by page, tagged with their owner and republished on a local
//! event bus for the entity managers to apply.
//!
//! ## Core Principles
//!
//! - **Local-first**: mutations are persisted before they are announced, and
//!   nothing needs a peer to work
//! - **One link per pair**: the lower identity dials, the other waits
//! - **Self-healing**: failed or dropped links retry with capped backoff
//!
//! ## Quick Start
//!
//! ```ignore
//! use pagememo_core::{IdentityProvider, Note, Settings, Storage, SyncCoordinator};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let storage = Storage::new("pagememo.redb")?;
//!     let settings = Settings::default().sharing_with(["memo-01j9..."]);
//!     let handle = SyncCoordinator::new(
//!         IdentityProvider::new(storage.clone()),
//!         Arc::new(storage),
//!         settings,
//!     )
//!     .start()?;
//!
//!     handle.set_page("https://example.com/article")?;
//!     handle
//!         .broadcast_entity_create(Note::new("https://example.com/article", "Check this").into())
//!         .await?;
//!
//!     let mut events = handle.subscribe();
//!     while let Ok(event) = events.recv().await {
//!         println!("{} from {}", event.name(), event.from());
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod identity;
pub mod logging;
pub mod peers;
pub mod scope;
pub mod server;
pub mod settings;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports
pub use error::{ProtocolError, SyncError, SyncResult, TransportError};
pub use identity::IdentityProvider;
pub use peers::{PeerInfo, PeerRegistry, PeerStatus};
pub use scope::{in_scope, normalize_url, UrlScope};
pub use server::RendezvousServer;
pub use settings::{Settings, TransportKind, DEFAULT_RELAY_ADDRESS};
pub use storage::{EntityStore, Storage};
pub use sync::{
    CoordinatorConfig, CoordinatorDiagnostics, CoordinatorHandle, LinkState, RemoteEvent,
    SyncCoordinator, SyncMessage,
};
pub use transport::{build_transport, Transport, TransportConfig};
pub use types::*;
