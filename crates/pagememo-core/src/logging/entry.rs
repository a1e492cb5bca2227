//! One line of a JSONL log file.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A self-contained log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonLogEntry {
    /// RFC 3339 timestamp with milliseconds, UTC
    pub ts: String,

    /// trace, debug, info, warn or error
    pub level: String,

    /// Peer identity (or `relay`) of the process that wrote the line
    pub instance: String,

    /// Module path of the event, e.g. `pagememo_core::sync::coordinator`
    pub target: String,

    pub msg: String,

    /// Structured event fields (`peer`, `attempt`, `delay_ms`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    /// Enclosing spans, root first, joined with ` > `
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl JsonLogEntry {
    /// Create an entry stamped with the current time
    pub fn new(
        level: impl Into<String>,
        instance: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            instance: instance.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// String value of a structured field, if present
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.as_ref()?.get(name)?.as_str()
    }

    /// Whether the entry is at `level` or more severe
    pub fn at_least(&self, level: tracing::Level) -> bool {
        match self.level.parse::<tracing::Level>() {
            // tracing orders ERROR as the smallest level
            Ok(own) => own <= level,
            Err(_) => true,
        }
    }

    /// Serialize to a single line (no trailing newline)
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
