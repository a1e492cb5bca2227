//! Sync wire protocol
//!
//! Every message on a peer link is one JSON object:
//!
//! ```text
//! { "protocolVersion": 1, "kind": "note-create", "data": { ... } }
//! ```
//!
//! ## Kinds (version 1)
//!
//! | kind                     | data                                   |
//! |--------------------------|----------------------------------------|
//! | `initial-sync`           | `{ notes: [], highlights: [], drawings: [] }` |
//! | `<type>-create`          | the entity                             |
//! | `<type>-update`          | the entity                             |
//! | `<type>-delete`          | `{ entityId, scopeUrl }`               |
//!
//! where `<type>` is `note`, `highlight` or `drawing`.
//!
//! Decoding goes through a per-version strategy table; a version with no
//! decoder is reported as [`ProtocolError::UnsupportedVersion`] so the caller
//! can log and skip it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::{AnyEntity, DeleteDescriptor, EntityKind, EntitySnapshot};

/// Version stamped on every outbound message
pub const PROTOCOL_VERSION: u32 = 1;

const INITIAL_SYNC_KIND: &str = "initial-sync";

/// A decoded sync message
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// Bulk handoff of the sender's entities for its current page
    InitialSync(EntitySnapshot),
    /// A new entity
    Create(AnyEntity),
    /// A changed entity (treated as create by receivers that never saw it)
    Update(AnyEntity),
    /// A removed entity
    Delete {
        kind: EntityKind,
        descriptor: DeleteDescriptor,
    },
}

/// The operation part of a per-entity kind string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Create,
    Update,
    Delete,
}

impl Op {
    fn as_str(&self) -> &'static str {
        match self {
            Op::Create => "create",
            Op::Update => "update",
            Op::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Op::Create),
            "update" => Some(Op::Update),
            "delete" => Some(Op::Delete),
            _ => None,
        }
    }
}

impl SyncMessage {
    /// Wire `kind` string for this message
    pub fn kind(&self) -> String {
        match self {
            SyncMessage::InitialSync(_) => INITIAL_SYNC_KIND.to_string(),
            SyncMessage::Create(e) => format!("{}-{}", e.kind(), Op::Create.as_str()),
            SyncMessage::Update(e) => format!("{}-{}", e.kind(), Op::Update.as_str()),
            SyncMessage::Delete { kind, .. } => format!("{}-{}", kind, Op::Delete.as_str()),
        }
    }

    /// Entity kind this message concerns, if it concerns a single kind
    pub fn entity_kind(&self) -> Option<EntityKind> {
        match self {
            SyncMessage::InitialSync(_) => None,
            SyncMessage::Create(e) | SyncMessage::Update(e) => Some(e.kind()),
            SyncMessage::Delete { kind, .. } => Some(*kind),
        }
    }

    fn data(&self) -> Result<Value, serde_json::Error> {
        match self {
            SyncMessage::InitialSync(snapshot) => serde_json::to_value(snapshot),
            SyncMessage::Create(e) | SyncMessage::Update(e) => e.to_value(),
            SyncMessage::Delete { descriptor, .. } => serde_json::to_value(descriptor),
        }
    }

    /// Encode as a current-version wire message
    pub fn to_wire(&self) -> Result<WireMessage, ProtocolError> {
        Ok(WireMessage {
            protocol_version: PROTOCOL_VERSION,
            kind: self.kind(),
            data: self
                .data()
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?,
        })
    }

    /// Encode straight to JSON text
    pub fn encode(&self) -> Result<String, ProtocolError> {
        self.to_wire()?.encode()
    }

    /// Decode JSON text through the version strategy table
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        WireMessage::decode(text)?.into_message()
    }
}

/// The JSON envelope carried on peer links
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    /// Envelope version; absent means the unversioned legacy format (0)
    #[serde(default)]
    pub protocol_version: u32,
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// Decoder for one protocol version
type Decoder = fn(&str, Value) -> Result<SyncMessage, ProtocolError>;

/// Version strategy table
const DECODERS: &[(u32, Decoder)] = &[(1, decode_v1)];

impl WireMessage {
    /// Encode wire message to JSON text
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Parse the envelope without interpreting `data`
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Interpret the envelope with the decoder registered for its version
    pub fn into_message(self) -> Result<SyncMessage, ProtocolError> {
        let decoder = DECODERS
            .iter()
            .find(|(version, _)| *version == self.protocol_version)
            .map(|(_, decoder)| *decoder)
            .ok_or(ProtocolError::UnsupportedVersion(self.protocol_version))?;
        decoder(&self.kind, self.data)
    }
}

fn decode_v1(kind: &str, data: Value) -> Result<SyncMessage, ProtocolError> {
    let malformed = |e: serde_json::Error| ProtocolError::Malformed(format!("{}: {}", kind, e));

    if kind == INITIAL_SYNC_KIND {
        let snapshot: EntitySnapshot = serde_json::from_value(data).map_err(malformed)?;
        return Ok(SyncMessage::InitialSync(snapshot));
    }

    let (entity_type, op) = kind
        .split_once('-')
        .ok_or_else(|| ProtocolError::UnknownKind(kind.to_string()))?;
    let entity_kind =
        EntityKind::parse(entity_type).ok_or_else(|| ProtocolError::UnknownKind(kind.to_string()))?;
    let op = Op::parse(op).ok_or_else(|| ProtocolError::UnknownKind(kind.to_string()))?;

    Ok(match op {
        Op::Create => SyncMessage::Create(AnyEntity::from_value(entity_kind, data).map_err(malformed)?),
        Op::Update => SyncMessage::Update(AnyEntity::from_value(entity_kind, data).map_err(malformed)?),
        Op::Delete => SyncMessage::Delete {
            kind: entity_kind,
            descriptor: serde_json::from_value(data).map_err(malformed)?,
        },
    })
}
