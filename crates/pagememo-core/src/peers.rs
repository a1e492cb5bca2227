//! Peer registry for tracking desired peers and their link history
//!
//! Every peer the user has asked to share with gets a record here. The sync
//! coordinator updates it as link attempts succeed or fail, and the CLI shows
//! it in `pagememo peers list`.

use crate::error::SyncError;
use crate::types::PeerId;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

// Table definition for peer registry
const PEERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("peers");

/// Connection status of a peer, as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PeerStatus {
    /// Link currently open
    Online,
    /// Last attempt failed or the link dropped
    Offline,
    /// Never attempted
    #[default]
    Unknown,
}

impl std::fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerStatus::Online => write!(f, "online"),
            PeerStatus::Offline => write!(f, "offline"),
            PeerStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Information about a desired peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// The peer's identity
    pub peer_id: PeerId,
    /// Optional nickname for this peer
    pub nickname: Option<String>,
    /// When the peer was added (Unix timestamp)
    pub added_at: u64,
    /// When a link to this peer was last open (Unix timestamp, 0 = never)
    pub last_seen: u64,
    /// Current connection status
    pub status: PeerStatus,
    /// Total number of outbound link attempts
    #[serde(default)]
    pub connection_attempts: u32,
    /// Number of links that reached `open`
    #[serde(default)]
    pub successful_connections: u32,
    /// Unix timestamp of last link attempt
    #[serde(default)]
    pub last_attempt: u64,
}

impl PeerInfo {
    /// Create a new PeerInfo
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            nickname: None,
            added_at: Self::current_timestamp(),
            last_seen: 0,
            status: PeerStatus::Unknown,
            connection_attempts: 0,
            successful_connections: 0,
            last_attempt: 0,
        }
    }

    /// Get current Unix timestamp
    fn current_timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    /// Set the peer's nickname
    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    /// Record a connection attempt
    pub fn record_attempt(&mut self) {
        self.connection_attempts += 1;
        self.last_attempt = Self::current_timestamp();
    }

    /// Record a link reaching `open`
    pub fn record_success(&mut self) {
        self.successful_connections += 1;
        self.status = PeerStatus::Online;
        self.last_seen = Self::current_timestamp();
    }

    /// Record a failed attempt or dropped link
    pub fn record_failure(&mut self) {
        self.status = PeerStatus::Offline;
    }

    /// Calculate success rate (0.0 to 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.connection_attempts == 0 {
            0.0
        } else {
            (self.successful_connections as f64 / self.connection_attempts as f64).min(1.0)
        }
    }
}

/// What happened on a link, for [`PeerRegistry::record`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    Attempted,
    Opened,
    Failed,
}

/// Peer registry for managing desired peers
#[derive(Clone)]
pub struct PeerRegistry {
    db: Arc<RwLock<Database>>,
}

impl PeerRegistry {
    /// Create a new peer registry using the same database as Storage
    ///
    /// This reuses the existing database connection to avoid having multiple
    /// database instances pointing at the same file.
    pub fn new(db: Arc<RwLock<Database>>) -> Result<Self, SyncError> {
        {
            let database = db.read();
            let write_txn = database.begin_write()?;
            {
                let _ = write_txn.open_table(PEERS_TABLE)?;
            }
            write_txn.commit()?;
        }

        Ok(Self { db })
    }

    /// Add or update a peer in the registry
    pub fn add_or_update(&self, peer_info: &PeerInfo) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(PEERS_TABLE)?;
            let data = postcard::to_allocvec(peer_info)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            table.insert(peer_info.peer_id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get a peer's info
    pub fn get(&self, peer_id: &PeerId) -> Result<Option<PeerInfo>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PEERS_TABLE)?;

        match table.get(peer_id.as_str())? {
            Some(v) => {
                let peer_info: PeerInfo = postcard::from_bytes(v.value())
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(Some(peer_info))
            }
            None => Ok(None),
        }
    }

    /// List all peers in the registry
    pub fn list_all(&self) -> Result<Vec<PeerInfo>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(PEERS_TABLE)?;

        let mut peers = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let peer_info: PeerInfo = postcard::from_bytes(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            peers.push(peer_info);
        }
        Ok(peers)
    }

    /// Remove a peer. Returns whether it was present.
    pub fn remove(&self, peer_id: &PeerId) -> Result<bool, SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(PEERS_TABLE)?;
            let removed = table.remove(peer_id.as_str())?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    /// Apply a link outcome to a peer's metrics, creating the record if needed
    pub fn record(&self, peer_id: &PeerId, outcome: LinkOutcome) -> Result<(), SyncError> {
        let mut info = self
            .get(peer_id)?
            .unwrap_or_else(|| PeerInfo::new(peer_id.clone()));
        match outcome {
            LinkOutcome::Attempted => info.record_attempt(),
            LinkOutcome::Opened => info.record_success(),
            LinkOutcome::Failed => info.record_failure(),
        }
        self.add_or_update(&info)
    }

    /// Count total peers in registry
    pub fn count(&self) -> Result<usize, SyncError> {
        Ok(self.list_all()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_registry() -> (PeerRegistry, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let db = Database::create(&db_path).unwrap();
        let registry = PeerRegistry::new(Arc::new(RwLock::new(db))).unwrap();
        (registry, temp_dir)
    }

    #[test]
    fn test_peer_info_creation() {
        let peer = PeerInfo::new("memo-bbb".into());
        assert_eq!(peer.status, PeerStatus::Unknown);
        assert!(peer.nickname.is_none());
        assert!(peer.added_at > 0);
        assert_eq!(peer.last_seen, 0);
    }

    #[test]
    fn test_success_rate() {
        let mut peer = PeerInfo::new("memo-bbb".into());
        assert_eq!(peer.success_rate(), 0.0);
        peer.record_attempt();
        peer.record_attempt();
        peer.record_success();
        assert!((peer.success_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_registry_add_get_list() {
        let (registry, _dir) = create_test_registry();
        let info = PeerInfo::new("memo-bbb".into()).with_nickname("laptop");
        registry.add_or_update(&info).unwrap();

        let loaded = registry.get(&"memo-bbb".into()).unwrap().unwrap();
        assert_eq!(loaded, info);
        assert_eq!(registry.count().unwrap(), 1);
        assert!(registry.get(&"memo-zzz".into()).unwrap().is_none());
    }

    #[test]
    fn test_record_creates_and_updates() {
        let (registry, _dir) = create_test_registry();
        let peer: PeerId = "memo-ccc".into();

        registry.record(&peer, LinkOutcome::Attempted).unwrap();
        registry.record(&peer, LinkOutcome::Failed).unwrap();
        let info = registry.get(&peer).unwrap().unwrap();
        assert_eq!(info.connection_attempts, 1);
        assert_eq!(info.status, PeerStatus::Offline);

        registry.record(&peer, LinkOutcome::Attempted).unwrap();
        registry.record(&peer, LinkOutcome::Opened).unwrap();
        let info = registry.get(&peer).unwrap().unwrap();
        assert_eq!(info.connection_attempts, 2);
        assert_eq!(info.successful_connections, 1);
        assert_eq!(info.status, PeerStatus::Online);
        assert!(info.last_seen > 0);
    }

    #[test]
    fn test_remove() {
        let (registry, _dir) = create_test_registry();
        let peer: PeerId = "memo-ddd".into();
        registry.add_or_update(&PeerInfo::new(peer.clone())).unwrap();
        assert!(registry.remove(&peer).unwrap());
        assert!(!registry.remove(&peer).unwrap());
        assert_eq!(registry.count().unwrap(), 0);
    }
}
