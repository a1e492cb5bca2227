//! Annotation storage
//!
//! One table per kind, keyed by `<scope key>\0<entity id>` so that every entity
//! of a page is a contiguous key range. Values are the entity as JSON.
//!
//! [`EntityStore`] is the persistence seam the sync coordinator talks to;
//! [`Storage`] is its redb implementation.

use async_trait::async_trait;
use redb::TableDefinition;

use super::Storage;
use crate::error::{SyncError, SyncResult};
use crate::types::{AnyEntity, EntityId, EntityKind};

pub(crate) const NOTES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("notes");
pub(crate) const HIGHLIGHTS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("highlights");
pub(crate) const DRAWINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("drawings");

const KEY_SEPARATOR: char = '\0';

fn table_for(kind: EntityKind) -> TableDefinition<'static, &'static str, &'static [u8]> {
    match kind {
        EntityKind::Note => NOTES_TABLE,
        EntityKind::Highlight => HIGHLIGHTS_TABLE,
        EntityKind::Drawing => DRAWINGS_TABLE,
    }
}

fn entity_key(scope_key: &str, id: &EntityId) -> String {
    format!("{}{}{}", scope_key, KEY_SEPARATOR, id)
}

/// Persistence collaborator for locally owned annotations
///
/// Implementations apply the active URL normalization to every `url` they are given.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// All entities of `kind` stored for the page `url`
    async fn get_entities_for_url(&self, kind: EntityKind, url: &str) -> SyncResult<Vec<AnyEntity>>;

    /// Insert or overwrite an entity
    async fn save_entity(&self, entity: &AnyEntity) -> SyncResult<()>;

    /// Remove an entity; removing an unknown id is not an error
    async fn delete_entity(&self, kind: EntityKind, id: &EntityId, url: &str) -> SyncResult<()>;
}

impl Storage {
    // ═══════════════════════════════════════════════════════════════════════
    // Entity Operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Save an entity under its page scope key.
    ///
    /// The owner tag is attribution only and is never persisted.
    pub fn put_entity(&self, entity: &AnyEntity) -> Result<(), SyncError> {
        let mut value = entity
            .to_value()
            .map_err(|e| SyncError::Serialization(e.to_string()))?;
        if let Some(obj) = value.as_object_mut() {
            obj.remove("ownerId");
        }
        let data = serde_json::to_vec(&value).map_err(|e| SyncError::Serialization(e.to_string()))?;
        let key = entity_key(&self.scope().key(entity.url()), entity.id());

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(table_for(entity.kind()))?;
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Load every entity of `kind` stored for the page `url`.
    pub fn list_entities(&self, kind: EntityKind, url: &str) -> Result<Vec<AnyEntity>, SyncError> {
        let scope_key = self.scope().key(url);
        let start = format!("{}{}", scope_key, KEY_SEPARATOR);
        // '\u{1}' is the successor of the separator, so [start, end) is exactly the page prefix
        let end = format!("{}\u{1}", scope_key);

        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(table_for(kind))?;

        let mut entities = Vec::new();
        for entry in table.range(start.as_str()..end.as_str())? {
            let (_, value) = entry?;
            let json: serde_json::Value = serde_json::from_slice(value.value())
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            let entity = AnyEntity::from_value(kind, json)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            entities.push(entity);
        }
        Ok(entities)
    }

    /// Load a single entity, if present.
    pub fn get_entity(
        &self,
        kind: EntityKind,
        id: &EntityId,
        url: &str,
    ) -> Result<Option<AnyEntity>, SyncError> {
        let key = entity_key(&self.scope().key(url), id);
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(table_for(kind))?;

        match table.get(key.as_str())? {
            Some(v) => {
                let json: serde_json::Value = serde_json::from_slice(v.value())
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                let entity = AnyEntity::from_value(kind, json)
                    .map_err(|e| SyncError::Serialization(e.to_string()))?;
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    /// Remove an entity. Returns whether it existed.
    pub fn remove_entity(&self, kind: EntityKind, id: &EntityId, url: &str) -> Result<bool, SyncError> {
        let key = entity_key(&self.scope().key(url), id);
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(table_for(kind))?;
            let removed = table.remove(key.as_str())?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }
}

async fn blocking<T, F>(storage: &Storage, f: F) -> SyncResult<T>
where
    T: Send + 'static,
    F: FnOnce(Storage) -> SyncResult<T> + Send + 'static,
{
    let storage = storage.clone();
    tokio::task::spawn_blocking(move || f(storage))
        .await
        .map_err(|e| SyncError::Storage(format!("storage task failed: {}", e)))?
}

#[async_trait]
impl EntityStore for Storage {
    async fn get_entities_for_url(&self, kind: EntityKind, url: &str) -> SyncResult<Vec<AnyEntity>> {
        let url = url.to_string();
        blocking(self, move |s| s.list_entities(kind, &url)).await
    }

    async fn save_entity(&self, entity: &AnyEntity) -> SyncResult<()> {
        let entity = entity.clone();
        blocking(self, move |s| s.put_entity(&entity)).await
    }

    async fn delete_entity(&self, kind: EntityKind, id: &EntityId, url: &str) -> SyncResult<()> {
        let id = id.clone();
        let url = url.to_string();
        blocking(self, move |s| s.remove_entity(kind, &id, &url).map(|_| ())).await
    }
}
