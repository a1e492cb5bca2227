//! Per-installation JSONL logging.
//!
//! Several peers often run on one machine (two CLI data dirs plus a relay).
//! Each one appends to its own file, so no two processes ever share a writer.
//!
//! ## Layout
//!
//! ```text
//! <data_dir>/logs/
//! └── raw/                           # one file per peer per day
//!     ├── 2026-10-19_memo-01j9....jsonl
//!     └── 2026-10-19_relay.jsonl
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use pagememo_core::logging::LoggingBuilder;
//!
//! LoggingBuilder::new(data_dir.join("logs"), peer_id.as_str())
//!     .with_filter("pagememo_core=debug")
//!     .init()?;
//! ```
//!
//! ### Querying with jq
//!
//! ```bash
//! # Every link failure, all peers
//! jq 'select(.msg == "Link attempt failed")' logs/raw/*.jsonl
//!
//! # Timeline across peers
//! cat logs/raw/*.jsonl | jq -s 'sort_by(.ts)'
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::JsonLogEntry;
pub use layer::{JsonlLayer, LoggingBuilder, DEFAULT_FILTER};
pub use writer::{read_all_entries, InstanceLogWriter};
