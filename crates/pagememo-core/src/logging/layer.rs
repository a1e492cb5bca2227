//! `tracing` layer that feeds [`InstanceLogWriter`].

use std::fmt::Write as FmtWrite;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

use super::entry::JsonLogEntry;
use super::writer::InstanceLogWriter;

/// Filter used when neither `RUST_LOG` nor an explicit filter is given
pub const DEFAULT_FILTER: &str = "pagememo=info,pagememo_core=info";

/// Writes every event it sees to the installation's JSONL file
pub struct JsonlLayer {
    writer: Arc<InstanceLogWriter>,
}

impl JsonlLayer {
    pub fn new(logs_dir: impl AsRef<Path>, instance: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self {
            writer: Arc::new(InstanceLogWriter::new(logs_dir, instance)?),
        })
    }

    pub fn log_path(&self) -> &Path {
        self.writer.path()
    }

    pub fn instance(&self) -> &str {
        self.writer.instance()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut entry = JsonLogEntry::new(
            metadata.level().as_str().to_lowercase(),
            self.writer.instance(),
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );
        if !visitor.fields.is_empty() {
            entry = entry.with_fields(serde_json::Value::Object(visitor.fields));
        }
        if let Some(scope) = ctx.event_scope(event) {
            let spans: Vec<&str> = scope.from_root().map(|span| span.name()).collect();
            if !spans.is_empty() {
                entry = entry.with_span(spans.join(" > "));
            }
        }

        // A failing log write must never take the process down
        let _ = self.writer.write(&entry);
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(&mut buf, "{:?}", value);
        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.insert(field, serde_json::Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.insert(field, serde_json::Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, serde_json::Value::String(value.to_string()));
    }
}

/// Installs the global subscriber: console output plus an optional JSONL file
pub struct LoggingBuilder {
    logs_dir: Option<PathBuf>,
    instance: String,
    console_output: bool,
    env_filter: Option<String>,
}

impl LoggingBuilder {
    /// Console-only logging for `instance`
    pub fn console(instance: impl Into<String>) -> Self {
        Self {
            logs_dir: None,
            instance: instance.into(),
            console_output: true,
            env_filter: None,
        }
    }

    /// Console plus `<logs_dir>/raw/<date>_<instance>.jsonl`
    pub fn new(logs_dir: impl Into<PathBuf>, instance: impl Into<String>) -> Self {
        Self {
            logs_dir: Some(logs_dir.into()),
            ..Self::console(instance)
        }
    }

    pub fn no_console(mut self) -> Self {
        self.console_output = false;
        self
    }

    /// Directive string such as `pagememo_core=debug`; `RUST_LOG` still wins when set
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Build only the JSONL layer, for manual composition
    pub fn build_layer(&self) -> std::io::Result<Option<JsonlLayer>> {
        self.logs_dir
            .as_ref()
            .map(|dir| JsonlLayer::new(dir, &self.instance))
            .transpose()
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(self.env_filter.as_deref().unwrap_or(DEFAULT_FILTER))
        })
    }

    /// Install as the global default subscriber
    ///
    /// Returns the JSONL file path when one is written.
    pub fn init(self) -> std::io::Result<Option<PathBuf>> {
        let jsonl = self.build_layer()?;
        let path = jsonl.as_ref().map(|layer| layer.log_path().to_path_buf());
        let console = self
            .console_output
            .then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

        tracing_subscriber::registry()
            .with(self.filter())
            .with(jsonl)
            .with(console)
            .try_init()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AlreadyExists, e))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layer_records_structured_fields() {
        let temp = TempDir::new().unwrap();
        let layer = JsonlLayer::new(temp.path(), "memo-aaa").unwrap();
        let path = layer.log_path().to_path_buf();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("serve");
            let _guard = span.enter();
            tracing::info!(peer = %"memo-bbb", "Peer linked");
            tracing::warn!(attempt = 3u32, delay_ms = 40_000u64, "Scheduling reconnect");
        });

        let entries: Vec<JsonLogEntry> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| JsonLogEntry::from_json_line(l).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].msg, "Peer linked");
        assert_eq!(entries[0].field("peer"), Some("memo-bbb"));
        assert_eq!(entries[0].span.as_deref(), Some("serve"));
        assert_eq!(entries[1].level, "warn");
        let fields = entries[1].fields.as_ref().unwrap();
        assert_eq!(fields["attempt"], 3);
        assert_eq!(fields["delay_ms"], 40_000);
    }

    #[test]
    fn test_console_builder_has_no_file_layer() {
        let builder = LoggingBuilder::console("relay");
        assert!(builder.build_layer().unwrap().is_none());

        let temp = TempDir::new().unwrap();
        let builder = LoggingBuilder::new(temp.path(), "relay").no_console();
        let layer = builder.build_layer().unwrap().unwrap();
        assert_eq!(layer.instance(), "relay");
    }
}
