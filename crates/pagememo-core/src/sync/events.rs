//! Remote events and coordinator status types
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  RemoteEvent: what Entity Managers subscribe to                 │
//! │  ├── InitialSync: batch of one kind from a newly linked peer    │
//! │  ├── EntityCreated: a peer created (or updated an unseen) entity│
//! │  ├── EntityUpdated: a peer changed a known entity               │
//! │  └── EntityDeleted: a peer removed an entity                    │
//! │                                                                 │
//! │  LinkState: absent → connecting → open → closed                 │
//! │  CoordinatorDiagnostics: read-only snapshot for inspection      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use crate::types::{AnyEntity, EntityId, EntityKind, PeerId};

/// Lifecycle of a logical link to one remote identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Never attempted
    #[default]
    Absent,
    /// Attempt in flight
    Connecting,
    /// Link usable
    Open,
    /// Torn down or failed; may be re-attempted
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Absent => write!(f, "absent"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Open => write!(f, "open"),
            LinkState::Closed => write!(f, "closed"),
        }
    }
}

/// Events republished to Entity Managers
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// In-scope entities of one kind from a peer's initial sync
    InitialSync {
        from: PeerId,
        kind: EntityKind,
        entities: Vec<AnyEntity>,
    },
    /// An entity appeared on a peer
    EntityCreated { from: PeerId, entity: AnyEntity },
    /// A known entity changed on a peer
    EntityUpdated { from: PeerId, entity: AnyEntity },
    /// An entity was removed on a peer
    EntityDeleted {
        from: PeerId,
        kind: EntityKind,
        entity_id: EntityId,
        scope_url: String,
    },
}

impl RemoteEvent {
    /// Name of the event on the local bus
    pub fn name(&self) -> &'static str {
        match self {
            RemoteEvent::InitialSync { .. } => "remote-initial-sync",
            RemoteEvent::EntityCreated { .. } => "remote-entity-created",
            RemoteEvent::EntityUpdated { .. } => "remote-entity-updated",
            RemoteEvent::EntityDeleted { .. } => "remote-entity-deleted",
        }
    }

    /// Peer the event originated from
    pub fn from(&self) -> &PeerId {
        match self {
            RemoteEvent::InitialSync { from, .. }
            | RemoteEvent::EntityCreated { from, .. }
            | RemoteEvent::EntityUpdated { from, .. }
            | RemoteEvent::EntityDeleted { from, .. } => from,
        }
    }

    /// Entity kind the event concerns
    pub fn kind(&self) -> EntityKind {
        match self {
            RemoteEvent::InitialSync { kind, .. } | RemoteEvent::EntityDeleted { kind, .. } => *kind,
            RemoteEvent::EntityCreated { entity, .. } | RemoteEvent::EntityUpdated { entity, .. } => {
                entity.kind()
            }
        }
    }
}

/// Per-peer row of the diagnostics snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerLinkInfo {
    pub peer_id: PeerId,
    pub state: LinkState,
    /// Whether the peer is in the desired set
    pub desired: bool,
    /// Next retry attempt number
    pub attempt: u32,
    pub retry_pending: bool,
    pub grace_pending: bool,
}

/// Read-only snapshot of coordinator state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorDiagnostics {
    pub local_id: PeerId,
    pub page_url: Option<String>,
    pub sharing_enabled: bool,
    pub transport_ready: bool,
    pub peers: Vec<PeerLinkInfo>,
    /// Peers waiting for (or currently receiving) an initial sync
    pub pending_initial_sync: Vec<PeerId>,
}

impl CoordinatorDiagnostics {
    /// Peers whose link is open
    pub fn open_peers(&self) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|p| p.state == LinkState::Open)
            .map(|p| p.peer_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Note;

    #[test]
    fn test_link_state_default_is_absent() {
        assert_eq!(LinkState::default(), LinkState::Absent);
        assert_eq!(LinkState::Open.to_string(), "open");
    }

    #[test]
    fn test_event_names() {
        let from = PeerId::from("memo-bbb");
        let entity: AnyEntity = Note::new("u", "n").into();
        let created = RemoteEvent::EntityCreated {
            from: from.clone(),
            entity: entity.clone(),
        };
        assert_eq!(created.name(), "remote-entity-created");
        assert_eq!(created.kind(), EntityKind::Note);
        assert_eq!(created.from(), &from);

        let deleted = RemoteEvent::EntityDeleted {
            from,
            kind: EntityKind::Highlight,
            entity_id: "h1".into(),
            scope_url: "u".into(),
        };
        assert_eq!(deleted.name(), "remote-entity-deleted");
        assert_eq!(deleted.kind(), EntityKind::Highlight);
    }

    #[test]
    fn test_open_peers() {
        let diag = CoordinatorDiagnostics {
            peers: vec![
                PeerLinkInfo {
                    peer_id: "memo-a".into(),
                    state: LinkState::Open,
                    desired: true,
                    attempt: 1,
                    retry_pending: false,
                    grace_pending: false,
                },
                PeerLinkInfo {
                    peer_id: "memo-b".into(),
                    state: LinkState::Connecting,
                    desired: true,
                    attempt: 2,
                    retry_pending: false,
                    grace_pending: false,
                },
            ],
            local_id: "memo-z".into(),
            page_url: None,
            sharing_enabled: true,
            transport_ready: true,
            pending_initial_sync: Vec::new(),
        };
        assert_eq!(diag.open_peers(), vec![PeerId::from("memo-a")]);
    }
}
