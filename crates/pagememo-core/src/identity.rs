//! Peer identity provider
//!
//! Each installation has one [`PeerId`], generated on first use and persisted
//! in [`Storage`]. It is both the link address other peers dial and the
//! `ownerId` stamped on entities that leave this installation.
//!
//! Persistence failures propagate to the caller. There is no ephemeral
//! fallback id.

use tracing::info;

use crate::error::SyncResult;
use crate::storage::Storage;
use crate::types::PeerId;

/// Supplies the stable identity of this installation
#[derive(Clone)]
pub struct IdentityProvider {
    storage: Storage,
}

impl IdentityProvider {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Return the persisted identity, creating and persisting one on first call
    pub fn get_identity(&self) -> SyncResult<PeerId> {
        if let Some(existing) = self.storage.load_identity()? {
            return Ok(existing);
        }
        let fresh = PeerId::generate();
        self.storage.save_identity(&fresh)?;
        info!(peer = %fresh, "Generated new peer identity");
        Ok(fresh)
    }

    /// Replace the identity unconditionally
    ///
    /// Previously shared ids stop resolving to this installation; peers must be
    /// given the new id out of band.
    pub fn reset_identity(&self) -> SyncResult<PeerId> {
        let fresh = PeerId::generate();
        self.storage.save_identity(&fresh)?;
        info!(peer = %fresh, "Peer identity reset");
        Ok(fresh)
    }
}
