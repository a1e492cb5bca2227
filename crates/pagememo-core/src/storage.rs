//! Persistent storage using redb.
//!
//! This module provides ACID-compliant storage for:
//! - The installation's peer identity
//! - Sharing settings
//! - Locally owned annotations (notes, highlights, drawings), keyed by page scope
//! - Peer connection metrics (see [`PeerRegistry`](crate::peers::PeerRegistry))

use crate::error::SyncError;
use crate::scope::UrlScope;
use crate::settings::Settings;
use crate::types::PeerId;
use parking_lot::RwLock;
use redb::{Database, TableDefinition};
use std::path::Path;
use std::sync::Arc;

// Submodules
mod entities;

pub use entities::EntityStore;
use entities::{DRAWINGS_TABLE, HIGHLIGHTS_TABLE, NOTES_TABLE};

// Table definitions
const IDENTITY_TABLE: TableDefinition<&str, &str> = TableDefinition::new("identity");
const SETTINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("settings");

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
    /// Normalization rule applied to entity keys, mirrors the saved settings
    scope: Arc<RwLock<UrlScope>>,
}

impl Storage {
    const IDENTITY_KEY: &'static str = "peer_identity";
    const SETTINGS_KEY: &'static str = "settings";

    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all required tables
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(IDENTITY_TABLE)?;
            let _ = write_txn.open_table(SETTINGS_TABLE)?;
            let _ = write_txn.open_table(NOTES_TABLE)?;
            let _ = write_txn.open_table(HIGHLIGHTS_TABLE)?;
            let _ = write_txn.open_table(DRAWINGS_TABLE)?;
        }
        write_txn.commit()?;

        let storage = Self {
            db: Arc::new(RwLock::new(db)),
            scope: Arc::new(RwLock::new(UrlScope::default())),
        };
        let settings = storage.load_settings()?;
        *storage.scope.write() = settings.scope();
        Ok(storage)
    }

    /// Get a reference to the shared database handle
    ///
    /// This allows other components (like PeerRegistry) to share the same
    /// database connection instead of opening multiple instances of the same file.
    pub fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }

    /// The URL scope rule currently applied to entity keys
    pub fn scope(&self) -> UrlScope {
        *self.scope.read()
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Identity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save the installation's peer identity, replacing any previous one.
    pub fn save_identity(&self, peer_id: &PeerId) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(IDENTITY_TABLE)?;
            table.insert(Self::IDENTITY_KEY, peer_id.as_str())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load the installation's peer identity.
    ///
    /// Returns `None` if no identity has been created yet.
    pub fn load_identity(&self) -> Result<Option<PeerId>, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(IDENTITY_TABLE)?;

        match table.get(Self::IDENTITY_KEY)? {
            Some(v) => Ok(Some(PeerId::from(v.value()))),
            None => Ok(None),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Settings Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Persist settings and adopt their URL scope rule for entity keys.
    pub fn save_settings(&self, settings: &Settings) -> Result<(), SyncError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SETTINGS_TABLE)?;
            let data = serde_json::to_vec(settings)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            table.insert(Self::SETTINGS_KEY, data.as_slice())?;
        }
        write_txn.commit()?;
        *self.scope.write() = settings.scope();
        Ok(())
    }

    /// Load settings, falling back to defaults on first run.
    pub fn load_settings(&self) -> Result<Settings, SyncError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SETTINGS_TABLE)?;

        match table.get(Self::SETTINGS_KEY)? {
            Some(v) => serde_json::from_slice(v.value())
                .map_err(|e| SyncError::Serialization(e.to_string())),
            None => Ok(Settings::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let storage = Storage::new(&db_path).unwrap();
        (storage, temp_dir)
    }

    #[test]
    fn test_storage_creates_nested_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("a").join("b").join("pagememo.redb");
        Storage::new(&db_path).unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn test_identity_absent_on_first_run() {
        let (storage, _dir) = create_test_storage();
        assert!(storage.load_identity().unwrap().is_none());
    }

    #[test]
    fn test_identity_save_and_load() {
        let (storage, _dir) = create_test_storage();
        storage.save_identity(&"memo-aaa".into()).unwrap();
        assert_eq!(storage.load_identity().unwrap(), Some(PeerId::from("memo-aaa")));

        storage.save_identity(&"memo-bbb".into()).unwrap();
        assert_eq!(storage.load_identity().unwrap(), Some(PeerId::from("memo-bbb")));
    }

    #[test]
    fn test_settings_default_then_roundtrip() {
        let (storage, _dir) = create_test_storage();
        assert_eq!(storage.load_settings().unwrap(), Settings::default());

        let mut settings = Settings::default().sharing_with(["memo-bbb"]);
        settings.strip_query_string = true;
        storage.save_settings(&settings).unwrap();

        assert_eq!(storage.load_settings().unwrap(), settings);
        assert!(storage.scope().strip_query_string);
    }

    #[test]
    fn test_settings_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        {
            let storage = Storage::new(&db_path).unwrap();
            let mut settings = Settings::default();
            settings.strip_query_string = true;
            storage.save_settings(&settings).unwrap();
        }
        let storage = Storage::new(&db_path).unwrap();
        assert!(storage.scope().strip_query_string);
    }
}
