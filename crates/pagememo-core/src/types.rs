//! Core types for Pagememo
//!
//! Annotations come in three kinds (notes, highlights, drawings). Every
//! annotation carries the page `url` it belongs to and, once it has crossed a
//! peer link, the `ownerId` of the installation it originated from. The owner
//! tag is attribution only; an entity's identity is its own `id`.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Stable identifier of one installation, used as both link address and owner tag.
///
/// Ordering is plain lexicographic string ordering, which the link tie-break
/// relies on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Prefix for generated identities
    pub const PREFIX: &'static str = "memo-";

    /// Generate a fresh identity
    pub fn generate() -> Self {
        Self(format!(
            "{}{}",
            Self::PREFIX,
            Ulid::new().to_string().to_lowercase()
        ))
    }

    /// Borrow the identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for display (first 12 chars)
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique identifier for an annotation
///
/// Generated once per creation event as a ULID string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    /// Create a new EntityId with current timestamp
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The three annotation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// Sticky note
    Note,
    /// Text highlight
    Highlight,
    /// Freehand drawing
    Drawing,
}

impl EntityKind {
    /// All kinds, in snapshot order
    pub const ALL: [EntityKind; 3] = [EntityKind::Note, EntityKind::Highlight, EntityKind::Drawing];

    /// Wire / storage name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Note => "note",
            EntityKind::Highlight => "highlight",
            EntityKind::Drawing => "drawing",
        }
    }

    /// Parse a wire name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "note" => Some(EntityKind::Note),
            "highlight" => Some(EntityKind::Highlight),
            "drawing" => Some(EntityKind::Drawing),
            _ => None,
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Position of a note on the page, in document coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A sticky note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
    pub id: EntityId,
    pub url: String,
    pub content: String,
    #[serde(default)]
    pub position: Position,
    #[serde(default = "default_note_color")]
    pub color: String,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<PeerId>,
}

fn default_note_color() -> String {
    "#fff59d".to_string()
}

impl Note {
    /// Create a new note on `url`
    pub fn new(url: impl Into<String>, content: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: EntityId::new(),
            url: url.into(),
            content: content.into(),
            position: Position::default(),
            color: default_note_color(),
            created_at: now,
            updated_at: now,
            owner_id: None,
        }
    }

    /// Place the note at a position
    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.position = Position { x, y };
        self
    }

    /// Replace the content and bump `updated_at`
    pub fn edit(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.updated_at = now_millis();
    }
}

/// Where a highlight sits inside the page text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextAnchor {
    /// XPath of the container element
    pub xpath: String,
    pub start_offset: u32,
    pub end_offset: u32,
}

/// A text highlight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Highlight {
    pub id: EntityId,
    pub url: String,
    pub text: String,
    #[serde(default)]
    pub anchor: TextAnchor,
    #[serde(default = "default_highlight_color")]
    pub color: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<PeerId>,
}

fn default_highlight_color() -> String {
    "#ffeb3b".to_string()
}

impl Highlight {
    /// Create a new highlight of `text` on `url`
    pub fn new(url: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            url: url.into(),
            text: text.into(),
            anchor: TextAnchor::default(),
            color: default_highlight_color(),
            created_at: now_millis(),
            owner_id: None,
        }
    }
}

/// A single point of a stroke
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

/// One continuous pen stroke
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stroke {
    pub color: String,
    pub width: f64,
    pub points: Vec<Point>,
}

/// A freehand drawing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Drawing {
    pub id: EntityId,
    pub url: String,
    pub strokes: Vec<Stroke>,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<PeerId>,
}

impl Drawing {
    /// Create an empty drawing on `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: EntityId::new(),
            url: url.into(),
            strokes: Vec::new(),
            created_at: now_millis(),
            owner_id: None,
        }
    }

    /// Append a stroke
    pub fn with_stroke(mut self, stroke: Stroke) -> Self {
        self.strokes.push(stroke);
        self
    }
}

/// Any annotation, tagged with its kind
#[derive(Debug, Clone, PartialEq)]
pub enum AnyEntity {
    Note(Note),
    Highlight(Highlight),
    Drawing(Drawing),
}

impl AnyEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            AnyEntity::Note(_) => EntityKind::Note,
            AnyEntity::Highlight(_) => EntityKind::Highlight,
            AnyEntity::Drawing(_) => EntityKind::Drawing,
        }
    }

    pub fn id(&self) -> &EntityId {
        match self {
            AnyEntity::Note(n) => &n.id,
            AnyEntity::Highlight(h) => &h.id,
            AnyEntity::Drawing(d) => &d.id,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            AnyEntity::Note(n) => &n.url,
            AnyEntity::Highlight(h) => &h.url,
            AnyEntity::Drawing(d) => &d.url,
        }
    }

    pub fn owner_id(&self) -> Option<&PeerId> {
        match self {
            AnyEntity::Note(n) => n.owner_id.as_ref(),
            AnyEntity::Highlight(h) => h.owner_id.as_ref(),
            AnyEntity::Drawing(d) => d.owner_id.as_ref(),
        }
    }

    /// Stamp the owner tag
    pub fn set_owner(&mut self, owner: PeerId) {
        let slot = match self {
            AnyEntity::Note(n) => &mut n.owner_id,
            AnyEntity::Highlight(h) => &mut h.owner_id,
            AnyEntity::Drawing(d) => &mut d.owner_id,
        };
        *slot = Some(owner);
    }

    /// Copy of the entity with the owner tag set
    pub fn owned_by(mut self, owner: PeerId) -> Self {
        self.set_owner(owner);
        self
    }

    /// Serialize the inner entity to a JSON value
    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            AnyEntity::Note(n) => serde_json::to_value(n),
            AnyEntity::Highlight(h) => serde_json::to_value(h),
            AnyEntity::Drawing(d) => serde_json::to_value(d),
        }
    }

    /// Deserialize an entity of `kind` from a JSON value
    pub fn from_value(kind: EntityKind, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            EntityKind::Note => AnyEntity::Note(serde_json::from_value(value)?),
            EntityKind::Highlight => AnyEntity::Highlight(serde_json::from_value(value)?),
            EntityKind::Drawing => AnyEntity::Drawing(serde_json::from_value(value)?),
        })
    }
}

impl From<Note> for AnyEntity {
    fn from(n: Note) -> Self {
        AnyEntity::Note(n)
    }
}

impl From<Highlight> for AnyEntity {
    fn from(h: Highlight) -> Self {
        AnyEntity::Highlight(h)
    }
}

impl From<Drawing> for AnyEntity {
    fn from(d: Drawing) -> Self {
        AnyEntity::Drawing(d)
    }
}

/// All entities of one page, grouped by kind
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub highlights: Vec<Highlight>,
    #[serde(default)]
    pub drawings: Vec<Drawing>,
}

impl EntitySnapshot {
    pub fn len(&self) -> usize {
        self.notes.len() + self.highlights.len() + self.drawings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Add an entity to the matching bucket
    pub fn push(&mut self, entity: AnyEntity) {
        match entity {
            AnyEntity::Note(n) => self.notes.push(n),
            AnyEntity::Highlight(h) => self.highlights.push(h),
            AnyEntity::Drawing(d) => self.drawings.push(d),
        }
    }

    /// Stamp every entity with `owner`
    pub fn stamp_owner(&mut self, owner: &PeerId) {
        for n in &mut self.notes {
            n.owner_id = Some(owner.clone());
        }
        for h in &mut self.highlights {
            h.owner_id = Some(owner.clone());
        }
        for d in &mut self.drawings {
            d.owner_id = Some(owner.clone());
        }
    }

    /// Consume into entities of one kind
    pub fn take_kind(&mut self, kind: EntityKind) -> Vec<AnyEntity> {
        match kind {
            EntityKind::Note => self.notes.drain(..).map(AnyEntity::Note).collect(),
            EntityKind::Highlight => self.highlights.drain(..).map(AnyEntity::Highlight).collect(),
            EntityKind::Drawing => self.drawings.drain(..).map(AnyEntity::Drawing).collect(),
        }
    }

    /// Iterate all entities as owned `AnyEntity` values
    pub fn into_entities(self) -> impl Iterator<Item = AnyEntity> {
        self.notes
            .into_iter()
            .map(AnyEntity::Note)
            .chain(self.highlights.into_iter().map(AnyEntity::Highlight))
            .chain(self.drawings.into_iter().map(AnyEntity::Drawing))
    }
}

impl FromIterator<AnyEntity> for EntitySnapshot {
    fn from_iter<I: IntoIterator<Item = AnyEntity>>(iter: I) -> Self {
        let mut snapshot = EntitySnapshot::default();
        for entity in iter {
            snapshot.push(entity);
        }
        snapshot
    }
}

/// Payload of a delete message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDescriptor {
    pub entity_id: EntityId,
    pub scope_url: String,
}
