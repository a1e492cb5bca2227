//! Pagememo CLI
//!
//! Thin wrapper around pagememo-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show identity and sharing configuration
//! pagememo info
//!
//! # Share with a friend and point at a relay
//! pagememo peers add memo-01j9... --nickname alice
//! pagememo settings set --sharing true --relay 203.0.113.7:7878
//!
//! # Annotate a page
//! pagememo note add https://example.com/article "Great point" --x 120 --y 300
//! pagememo note list https://example.com/article
//!
//! # Stay online for a page, printing what peers share
//! pagememo serve --page https://example.com/article
//!
//! # Merged log timeline of every installation under the data dir
//! pagememo logs --level warn
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pagememo_core::logging::{self, LoggingBuilder};
use pagememo_core::{
    AnyEntity, Drawing, EntityId, EntityKind, Highlight, IdentityProvider, Note, PeerId, PeerInfo,
    PeerRegistry, Point, RemoteEvent, Settings, Storage, Stroke, SyncCoordinator, TransportKind,
};
use tokio::io::AsyncBufReadExt;
use tokio::sync::broadcast::error::RecvError;

/// Pagememo - peer-shared page annotations
#[derive(Parser)]
#[command(name = "pagememo")]
#[command(version)]
#[command(about = "Pagememo - share notes, highlights and drawings on web pages with your peers")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory (default: <platform data dir>/pagememo)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show identity, sharing settings and data location
    Info,

    /// Identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Peers to share with
    Peers {
        #[command(subcommand)]
        action: PeersAction,
    },

    /// Sharing settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Sticky notes
    Note {
        #[command(subcommand)]
        action: NoteAction,
    },

    /// Text highlights
    Highlight {
        #[command(subcommand)]
        action: HighlightAction,
    },

    /// Freehand drawings
    Drawing {
        #[command(subcommand)]
        action: DrawingAction,
    },

    /// Stay online for a page and print what peers share
    Serve {
        /// Page whose annotations are exchanged
        #[arg(short, long)]
        page: String,
    },

    /// Show the merged JSONL log of every installation under the data dir
    Logs {
        /// Minimum level to show (error, warn, info, debug, trace)
        #[arg(short, long, default_value = "info")]
        level: tracing::Level,

        /// Only entries written by this installation
        #[arg(short, long)]
        instance: Option<String>,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Print this installation's peer id
    Show,
    /// Replace the peer id (peers must be given the new one)
    Reset {
        /// Confirm the reset (required)
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum PeersAction {
    /// Start sharing with a peer
    Add {
        /// The peer's id, as shown by `pagememo identity show` on their side
        peer_id: String,
        #[arg(short, long)]
        nickname: Option<String>,
    },
    /// Stop sharing with a peer
    Remove { peer_id: String },
    /// List peers with their link history
    List,
}

#[derive(Subcommand)]
enum SettingsAction {
    Show,
    /// Change one or more settings
    Set {
        /// Share annotations at all
        #[arg(long)]
        sharing: Option<bool>,
        /// Rendezvous/relay server address (host:port)
        #[arg(long)]
        relay: Option<String>,
        /// Link implementation: direct or relay
        #[arg(long)]
        transport: Option<TransportKind>,
        /// Treat pages that differ only in their query string as the same page
        #[arg(long)]
        strip_query: Option<bool>,
    },
}

#[derive(Subcommand)]
enum NoteAction {
    /// Add a note to a page
    Add {
        url: String,
        content: String,
        #[arg(long, default_value_t = 0.0)]
        x: f64,
        #[arg(long, default_value_t = 0.0)]
        y: f64,
    },
    /// List the notes of a page
    List { url: String },
    /// Delete a note
    Delete { url: String, id: String },
}

#[derive(Subcommand)]
enum HighlightAction {
    /// Highlight a passage of a page
    Add {
        url: String,
        text: String,
        #[arg(long)]
        color: Option<String>,
    },
    /// List the highlights of a page
    List { url: String },
}

#[derive(Subcommand)]
enum DrawingAction {
    /// Add a one-stroke drawing
    Add {
        url: String,
        /// Stroke points as "x,y x,y ..."
        #[arg(long)]
        points: String,
        #[arg(long, default_value = "#e53935")]
        color: String,
        #[arg(long, default_value_t = 2.0)]
        width: f64,
    },
    /// List the drawings of a page
    List { url: String },
}

// ═══════════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════════

/// Console filter for one-shot commands
fn console_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Filter for `serve`, which reports link activity by default
fn serve_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => logging::DEFAULT_FILTER,
        1 => "pagememo=debug,pagememo_core=debug",
        _ => "trace",
    }
}

/// Get the default data directory (<data_dir>/pagememo)
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pagememo")
}

fn open_storage(data_dir: &Path) -> Result<Storage> {
    Storage::new(data_dir.join("pagememo.redb"))
        .with_context(|| format!("failed to open database in {}", data_dir.display()))
}

/// Parse "x,y x,y ..." into stroke points
fn parse_points(raw: &str) -> Result<Vec<Point>> {
    raw.split_whitespace()
        .map(|pair| {
            let (x, y) = pair
                .split_once(',')
                .with_context(|| format!("point '{}' is not x,y", pair))?;
            Ok(Point {
                x: x.trim().parse().with_context(|| format!("bad x in '{}'", pair))?,
                y: y.trim().parse().with_context(|| format!("bad y in '{}'", pair))?,
            })
        })
        .collect()
}

fn format_timestamp(secs: u64) -> String {
    if secs == 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp(secs as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}

/// One-line summary of an entity
fn describe(entity: &AnyEntity) -> String {
    match entity {
        AnyEntity::Note(n) => format!(
            "note \"{}\" at ({}, {})",
            n.content, n.position.x, n.position.y
        ),
        AnyEntity::Highlight(h) => format!("highlight \"{}\"", h.text),
        AnyEntity::Drawing(d) => {
            let points: usize = d.strokes.iter().map(|s| s.points.len()).sum();
            format!("drawing, {} stroke(s), {} point(s)", d.strokes.len(), points)
        }
    }
}

fn print_settings(settings: &Settings) {
    println!("Settings:");
    println!(
        "  Sharing: {}",
        if settings.sharing_enabled { "enabled" } else { "disabled" }
    );
    println!("  Relay: {}", settings.relay_address);
    println!("  Transport: {}", settings.transport);
    println!("  Strip query string: {}", settings.strip_query_string);
    println!("  Desired peers: {}", settings.desired_peers.len());
    for peer in &settings.desired_peers {
        println!("    - {}", peer);
    }
}

fn print_entities(kind: EntityKind, url: &str, entities: &[AnyEntity]) {
    if entities.is_empty() {
        println!("No {}s on {}", kind, url);
        return;
    }
    println!("{} {}(s) on {}:", entities.len(), kind, url);
    for entity in entities {
        println!();
        println!("  ID: {}", entity.id());
        println!("  {}", describe(entity));
    }
}

/// Remote annotations currently shown for the served page
///
/// Remote entities are never persisted; this view is rebuilt from the
/// announcements of linked peers.
#[derive(Default)]
struct PageView {
    remote: HashMap<(EntityKind, EntityId), AnyEntity>,
}

impl PageView {
    fn apply(&mut self, event: &RemoteEvent) {
        match event {
            RemoteEvent::InitialSync {
                from,
                kind,
                entities,
            } => {
                // A fresh handoff replaces what the peer showed of that kind
                self.forget(from, *kind);
                for entity in entities {
                    self.remote
                        .insert((entity.kind(), entity.id().clone()), entity.clone());
                }
            }
            RemoteEvent::EntityCreated { entity, .. } | RemoteEvent::EntityUpdated { entity, .. } => {
                self.remote
                    .insert((entity.kind(), entity.id().clone()), entity.clone());
            }
            RemoteEvent::EntityDeleted { kind, entity_id, .. } => {
                self.remote.remove(&(*kind, entity_id.clone()));
            }
        }
    }

    /// Drop the entities of `kind` announced by `peer`
    fn forget(&mut self, peer: &PeerId, kind: EntityKind) {
        self.remote
            .retain(|(k, _), e| *k != kind || e.owner_id() != Some(peer));
    }

    fn len(&self) -> usize {
        self.remote.len()
    }
}

fn print_event(event: &RemoteEvent) {
    match event {
        RemoteEvent::InitialSync {
            from,
            kind,
            entities,
        } => println!("[{}] {}: {} {}(s)", from.short(), event.name(), entities.len(), kind),
        RemoteEvent::EntityCreated { from, entity } | RemoteEvent::EntityUpdated { from, entity } => {
            println!(
                "[{}] {}: {} {}",
                from.short(),
                event.name(),
                entity.id(),
                describe(entity)
            )
        }
        RemoteEvent::EntityDeleted {
            from,
            kind,
            entity_id,
            ..
        } => println!("[{}] {}: {} {}", from.short(), event.name(), kind, entity_id),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Serve
// ═══════════════════════════════════════════════════════════════════════════

async fn serve(
    storage: Storage,
    identity: IdentityProvider,
    registry: PeerRegistry,
    page: String,
) -> Result<()> {
    let settings = storage.load_settings()?;
    let handle = SyncCoordinator::new(identity, Arc::new(storage.clone()), settings.clone())
        .with_registry(registry)
        .start()?;
    handle.set_page(page.as_str())?;

    println!("Pagememo node");
    println!();
    println!("  Peer ID: {}", handle.local_identity());
    println!("  Page: {}", page);
    if settings.sharing_enabled {
        println!(
            "  Sharing with {} peer(s) via {} ({})",
            settings.desired_peers.len(),
            settings.relay_address,
            settings.transport
        );
    } else {
        println!("  Sharing disabled; running local-only");
    }
    println!();
    println!("Type 'note <text>', 'highlight <text>', 'delete <kind> <id>', 'status' or 'help'.");
    println!("Press Ctrl+C to stop.");
    println!();

    let mut events = handle.subscribe();
    let mut view = PageView::default();
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut status = tokio::time::interval(Duration::from_secs(60));
    status.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("Received shutdown signal...");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    view.apply(&event);
                    print_event(&event);
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Event consumer fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if let Err(e) = console_command(&handle, &storage, &page, &view, line.trim()).await {
                        println!("error: {:#}", e);
                    }
                }
                Ok(None) | Err(_) => stdin_open = false,
            },
            _ = status.tick() => {
                let peers = handle.linked_peers().await;
                println!("Status: {} linked peer(s), {} remote annotation(s)", peers.len(), view.len());
            }
        }
    }

    handle.shutdown().await?;
    println!("Stopped.");
    Ok(())
}

async fn console_command(
    handle: &pagememo_core::CoordinatorHandle,
    storage: &Storage,
    page: &str,
    view: &PageView,
    line: &str,
) -> Result<()> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match command {
        "" => {}
        "note" => {
            let note: AnyEntity = Note::new(page, rest).into();
            handle.broadcast_entity_create(note.clone()).await?;
            println!("Shared {} {}", note.id(), describe(&note));
        }
        "highlight" => {
            let highlight: AnyEntity = Highlight::new(page, rest).into();
            handle.broadcast_entity_create(highlight.clone()).await?;
            println!("Shared {} {}", highlight.id(), describe(&highlight));
        }
        "delete" => {
            let (kind, id) = rest
                .split_once(' ')
                .context("usage: delete <note|highlight|drawing> <id>")?;
            let kind = EntityKind::parse(kind).with_context(|| format!("unknown kind '{}'", kind))?;
            let id = EntityId::from(id.trim());
            if storage.get_entity(kind, &id, page)?.is_none() {
                anyhow::bail!("no local {} {} on this page", kind, id);
            }
            handle.broadcast_entity_delete(kind, id.clone(), page).await?;
            println!("Deleted {} {}", kind, id);
        }
        "status" => {
            let diag = handle.diagnostics().await?;
            println!(
                "Transport: {}",
                if diag.transport_ready { "ready" } else { "not ready" }
            );
            for peer in &diag.peers {
                println!(
                    "  {} {} (attempt {}{}{})",
                    peer.peer_id,
                    peer.state,
                    peer.attempt,
                    if peer.retry_pending { ", retry pending" } else { "" },
                    if peer.grace_pending { ", waiting for peer" } else { "" }
                );
            }
            println!("Remote annotations: {}", view.len());
        }
        "help" => {
            println!("note <text>                 share a note on the page");
            println!("highlight <text>            share a highlight on the page");
            println!("delete <kind> <id>          delete a local annotation");
            println!("status                      show link state");
        }
        other => anyhow::bail!("unknown command '{}' (try 'help')", other),
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Entry point
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);

    let storage = open_storage(&data_dir)?;
    let identity = IdentityProvider::new(storage.clone());
    // Identity exists from the first run on, whatever the command
    let local_id = identity.get_identity().context("failed to load identity")?;
    let registry = PeerRegistry::new(storage.db_handle())?;

    let logging = match &cli.command {
        Commands::Serve { .. } => LoggingBuilder::new(data_dir.join("logs"), local_id.as_str())
            .with_filter(serve_filter(cli.verbose)),
        _ => LoggingBuilder::console(local_id.as_str()).with_filter(console_filter(cli.verbose)),
    };
    logging.init().context("failed to install logging")?;

    match cli.command {
        Commands::Info => {
            let settings = storage.load_settings()?;
            println!("Pagememo v{}", env!("CARGO_PKG_VERSION"));
            println!();
            println!("Identity:");
            println!("  Peer ID: {}", local_id);
            println!();
            print_settings(&settings);
            println!();
            println!("Data directory: {}", data_dir.display());
        }

        Commands::Identity { action } => match action {
            IdentityAction::Show => {
                println!("Identity:");
                println!("  Peer ID: {}", local_id);
            }
            IdentityAction::Reset { force } => {
                if !force {
                    println!("WARNING: Resetting the identity cannot be undone!");
                    println!();
                    println!("Peers that share with {} will no longer reach you", local_id);
                    println!("until you give them the new id.");
                    println!();
                    println!("To confirm, run: pagememo identity reset --force");
                } else {
                    let fresh = identity.reset_identity()?;
                    println!("Identity reset.");
                    println!("  New Peer ID: {}", fresh);
                }
            }
        },

        Commands::Peers { action } => match action {
            PeersAction::Add { peer_id, nickname } => {
                let peer_id = PeerId::from(peer_id.trim());
                if peer_id.as_str().is_empty() {
                    anyhow::bail!("Peer ID must not be empty");
                }
                if peer_id == local_id {
                    anyhow::bail!("Cannot share with yourself ({})", peer_id);
                }
                let mut settings = storage.load_settings()?;
                let added = settings.desired_peers.insert(peer_id.clone());
                storage.save_settings(&settings)?;

                let mut info = registry
                    .get(&peer_id)?
                    .unwrap_or_else(|| PeerInfo::new(peer_id.clone()));
                if let Some(nickname) = nickname {
                    info = info.with_nickname(nickname);
                }
                registry.add_or_update(&info)?;

                if added {
                    println!("Added peer {}", peer_id);
                } else {
                    println!("Peer {} already added", peer_id);
                }
                if !settings.sharing_enabled {
                    println!("Sharing is disabled; enable it with: pagememo settings set --sharing true");
                }
            }
            PeersAction::Remove { peer_id } => {
                let peer_id = PeerId::from(peer_id.trim());
                let mut settings = storage.load_settings()?;
                let removed = settings.desired_peers.remove(&peer_id);
                storage.save_settings(&settings)?;
                registry.remove(&peer_id)?;
                if removed {
                    println!("Removed peer {}", peer_id);
                } else {
                    anyhow::bail!("Peer {} was not added", peer_id);
                }
            }
            PeersAction::List => {
                let settings = storage.load_settings()?;
                if settings.desired_peers.is_empty() {
                    println!("No peers added.");
                } else {
                    println!("Peers ({}):", settings.desired_peers.len());
                    for peer_id in &settings.desired_peers {
                        let info = registry
                            .get(peer_id)?
                            .unwrap_or_else(|| PeerInfo::new(peer_id.clone()));
                        let nickname = info.nickname.as_deref().unwrap_or("(unnamed)");
                        println!();
                        println!("  {} - {} [{}]", peer_id, nickname, info.status);
                        println!(
                            "    Links: {} of {} attempts ({:.0}%)",
                            info.successful_connections,
                            info.connection_attempts,
                            info.success_rate() * 100.0
                        );
                        println!("    Last seen: {}", format_timestamp(info.last_seen));
                    }
                }
            }
        },

        Commands::Settings { action } => match action {
            SettingsAction::Show => print_settings(&storage.load_settings()?),
            SettingsAction::Set {
                sharing,
                relay,
                transport,
                strip_query,
            } => {
                let mut settings = storage.load_settings()?;
                if let Some(sharing) = sharing {
                    settings.sharing_enabled = sharing;
                }
                if let Some(relay) = relay {
                    settings.relay_address = relay;
                }
                if let Some(transport) = transport {
                    settings.transport = transport;
                }
                if let Some(strip) = strip_query {
                    settings.strip_query_string = strip;
                }
                storage.save_settings(&settings)?;
                println!("Settings saved.");
                print_settings(&settings);
            }
        },

        Commands::Note { action } => match action {
            NoteAction::Add { url, content, x, y } => {
                let note: AnyEntity = Note::new(url.as_str(), content).at(x, y).into();
                storage.put_entity(&note)?;
                println!("Note added.");
                println!("  ID: {}", note.id());
            }
            NoteAction::List { url } => {
                let notes = storage.list_entities(EntityKind::Note, &url)?;
                print_entities(EntityKind::Note, &url, &notes);
            }
            NoteAction::Delete { url, id } => {
                let id = EntityId::from(id.as_str());
                if storage.remove_entity(EntityKind::Note, &id, &url)? {
                    println!("Note {} deleted.", id);
                } else {
                    anyhow::bail!("No note {} on {}", id, url);
                }
            }
        },

        Commands::Highlight { action } => match action {
            HighlightAction::Add { url, text, color } => {
                let mut highlight = Highlight::new(url.as_str(), text);
                if let Some(color) = color {
                    highlight.color = color;
                }
                let highlight: AnyEntity = highlight.into();
                storage.put_entity(&highlight)?;
                println!("Highlight added.");
                println!("  ID: {}", highlight.id());
            }
            HighlightAction::List { url } => {
                let highlights = storage.list_entities(EntityKind::Highlight, &url)?;
                print_entities(EntityKind::Highlight, &url, &highlights);
            }
        },

        Commands::Drawing { action } => match action {
            DrawingAction::Add {
                url,
                points,
                color,
                width,
            } => {
                let points = parse_points(&points)?;
                if points.is_empty() {
                    anyhow::bail!("A stroke needs at least one point");
                }
                let drawing: AnyEntity = Drawing::new(url.as_str())
                    .with_stroke(Stroke {
                        color,
                        width,
                        points,
                    })
                    .into();
                storage.put_entity(&drawing)?;
                println!("Drawing added.");
                println!("  ID: {}", drawing.id());
            }
            DrawingAction::List { url } => {
                let drawings = storage.list_entities(EntityKind::Drawing, &url)?;
                print_entities(EntityKind::Drawing, &url, &drawings);
            }
        },

        Commands::Serve { page } => serve(storage, identity, registry, page).await?,

        Commands::Logs { level, instance } => {
            let entries = logging::read_all_entries(data_dir.join("logs"))?;
            let shown: Vec<_> = entries
                .iter()
                .filter(|e| e.at_least(level))
                .filter(|e| instance.as_deref().map(|i| e.instance == i).unwrap_or(true))
                .collect();
            if shown.is_empty() {
                println!("No log entries.");
            }
            for entry in shown {
                let fields = entry
                    .fields
                    .as_ref()
                    .map(|f| format!(" {}", f))
                    .unwrap_or_default();
                println!(
                    "{} {:>5} [{}] {}: {}{}",
                    entry.ts, entry.level, entry.instance, entry.target, entry.msg, fields
                );
            }
        }
    }

    Ok(())
}
