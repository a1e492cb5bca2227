//! Sync coordinator
//!
//! Owns the logical peer links, decides which side initiates, exchanges
//! [`SyncMessage`]s, filters inbound entities by page scope and republishes
//! them as [`RemoteEvent`]s.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  CoordinatorHandle (Clone)                                       │
//! │  ├── broadcast_entity_*  → persist in caller task, then enqueue  │
//! │  ├── set_page / apply_settings / reset_identity                  │
//! │  └── subscribe()         → broadcast::Receiver<RemoteEvent>      │
//! │                 │                                                │
//! │                 ▼ mpsc::UnboundedSender<Command>                 │
//! │  Actor task (single consumer, one command per turn)              │
//! │  ├── peers: HashMap<PeerId, PeerSlot>  (state, attempt, timers)  │
//! │  ├── buffered / loading initial syncs                            │
//! │  ├── known: (kind, id) seen from peers on this page              │
//! │  └── transport: Arc<dyn Transport> (callbacks → Command)         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Transport callbacks, timer firings and finished async work all come back
//! as commands, so every state change happens inside one actor turn. Commands
//! carry the transport generation they were issued under; anything from a
//! replaced transport is ignored.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backoff::{should_initiate, Backoff};
use super::events::{CoordinatorDiagnostics, LinkState, PeerLinkInfo, RemoteEvent};
use super::protocol::SyncMessage;
use crate::error::{ProtocolError, SyncError, SyncResult, TransportError};
use crate::identity::IdentityProvider;
use crate::peers::{LinkOutcome, PeerRegistry};
use crate::scope::in_scope;
use crate::settings::{Settings, TransportKind};
use crate::storage::EntityStore;
use crate::transport::{build_transport, Transport, TransportConfig};
use crate::types::{AnyEntity, DeleteDescriptor, EntityId, EntityKind, EntitySnapshot, PeerId};

/// Capacity of the remote event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default wait before the higher-sorting side dials on its own
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(15);

/// Builds the transport for a kind and local identity
pub type TransportFactory = Arc<dyn Fn(TransportKind, PeerId) -> Arc<dyn Transport> + Send + Sync>;

/// Timing knobs of the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long the waiting side of a pair waits for an inbound link
    pub grace_period: Duration,
    /// Retry schedule for failed links and transport initialization
    pub backoff: Backoff,
    /// Passed to the default transport factory
    pub transport: TransportConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
            backoff: Backoff::default(),
            transport: TransportConfig::default(),
        }
    }
}

/// A local mutation to announce
#[derive(Debug, Clone)]
enum Outbound {
    Create(AnyEntity),
    Update(AnyEntity),
    Delete {
        kind: EntityKind,
        id: EntityId,
        url: String,
    },
}

enum Command {
    // Transport callbacks
    LinkOpened {
        generation: u64,
        peer: PeerId,
    },
    LinkClosed {
        generation: u64,
        peer: PeerId,
    },
    Inbound {
        generation: u64,
        from: PeerId,
        payload: String,
    },
    TransportLost {
        generation: u64,
    },
    // Finished async work
    InitFinished {
        generation: u64,
        result: Result<(), TransportError>,
    },
    ConnectFinished {
        generation: u64,
        peer: PeerId,
        result: Result<(), TransportError>,
    },
    SnapshotLoaded {
        generation: u64,
        peer: PeerId,
        page: String,
        result: SyncResult<EntitySnapshot>,
    },
    // Timers
    InitRetryDue {
        generation: u64,
    },
    RetryDue {
        generation: u64,
        peer: PeerId,
    },
    GraceExpired {
        generation: u64,
        peer: PeerId,
    },
    // API
    SetPage(String),
    Broadcast(Outbound),
    ApplySettings(Settings),
    ResetIdentity(oneshot::Sender<SyncResult<PeerId>>),
    LinkedPeers(oneshot::Sender<Vec<PeerId>>),
    Diagnostics(oneshot::Sender<CoordinatorDiagnostics>),
    Shutdown(oneshot::Sender<()>),
}

impl Command {
    /// Transport generation the command was issued under, if it is tied to one
    fn generation(&self) -> Option<u64> {
        match self {
            Command::LinkOpened { generation, .. }
            | Command::LinkClosed { generation, .. }
            | Command::Inbound { generation, .. }
            | Command::TransportLost { generation }
            | Command::InitFinished { generation, .. }
            | Command::ConnectFinished { generation, .. }
            | Command::SnapshotLoaded { generation, .. }
            | Command::InitRetryDue { generation }
            | Command::RetryDue { generation, .. }
            | Command::GraceExpired { generation, .. } => Some(*generation),
            _ => None,
        }
    }
}

/// Builder for a running coordinator
pub struct SyncCoordinator {
    identity: IdentityProvider,
    store: Arc<dyn EntityStore>,
    settings: Settings,
    config: CoordinatorConfig,
    registry: Option<PeerRegistry>,
    factory: Option<TransportFactory>,
}

impl SyncCoordinator {
    pub fn new(identity: IdentityProvider, store: Arc<dyn EntityStore>, settings: Settings) -> Self {
        Self {
            identity,
            store,
            settings,
            config: CoordinatorConfig::default(),
            registry: None,
            factory: None,
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Record link attempts and outcomes in `registry`
    pub fn with_registry(mut self, registry: PeerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace [`build_transport`] as the source of transports
    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Load the identity and spawn the coordinator task
    ///
    /// Fails only if the identity cannot be obtained. A transport that cannot
    /// be initialized leaves the coordinator in local-only mode and is retried.
    pub fn start(self) -> SyncResult<CoordinatorHandle> {
        let local_id = self
            .identity
            .get_identity()
            .map_err(|e| SyncError::Identity(e.to_string()))?;

        let factory: TransportFactory = match self.factory {
            Some(factory) => factory,
            None => {
                let transport_config = self.config.transport.clone();
                Arc::new(move |kind: TransportKind, id: PeerId| {
                    build_transport(kind, id, transport_config.clone())
                })
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let shared_id = Arc::new(RwLock::new(local_id.clone()));

        let actor = Actor {
            local_id: local_id.clone(),
            shared_id: shared_id.clone(),
            admitted: Arc::new(RwLock::new(admitted_peers(&self.settings))),
            identity: self.identity,
            store: self.store.clone(),
            registry: self.registry,
            settings: self.settings,
            config: self.config,
            factory,
            transport: None,
            transport_ready: false,
            generation: 0,
            init_attempt: 1,
            init_timer: None,
            peers: HashMap::new(),
            page_url: None,
            buffered: HashSet::new(),
            loading: HashSet::new(),
            known: HashSet::new(),
            events: events.clone(),
            weak_tx: tx.downgrade(),
        };
        tokio::spawn(actor.run(rx));

        info!(peer = %local_id, "Sync coordinator started");
        Ok(CoordinatorHandle {
            commands: tx,
            events,
            local_id: shared_id,
            store: self.store,
        })
    }
}

/// Outbound API used by entity managers
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<RemoteEvent>,
    local_id: Arc<RwLock<PeerId>>,
    store: Arc<dyn EntityStore>,
}

impl CoordinatorHandle {
    fn send(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::CoordinatorStopped)
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> SyncResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await.map_err(|_| SyncError::CoordinatorStopped)
    }

    /// Subscribe to remote entity events
    pub fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        self.events.subscribe()
    }

    pub fn local_identity(&self) -> PeerId {
        self.local_id.read().clone()
    }

    /// Set the page whose entities are exchanged and accepted
    pub fn set_page(&self, url: impl Into<String>) -> SyncResult<()> {
        self.send(Command::SetPage(url.into()))
    }

    /// Reconcile links with new settings
    pub fn apply_settings(&self, settings: Settings) -> SyncResult<()> {
        self.send(Command::ApplySettings(settings))
    }

    fn announce(&self, outbound: Outbound) {
        if self.send(Command::Broadcast(outbound)).is_err() {
            debug!("Coordinator stopped; mutation not broadcast");
        }
    }

    /// Persist a new entity, then announce it to linked peers
    ///
    /// The announcement happens even if persistence fails; the persistence
    /// error is still returned.
    pub async fn broadcast_entity_create(&self, entity: AnyEntity) -> SyncResult<()> {
        let persisted = self.store.save_entity(&entity).await;
        self.announce(Outbound::Create(entity));
        persisted
    }

    /// Persist a changed entity, then announce it to linked peers
    pub async fn broadcast_entity_update(&self, entity: AnyEntity) -> SyncResult<()> {
        let persisted = self.store.save_entity(&entity).await;
        self.announce(Outbound::Update(entity));
        persisted
    }

    /// Delete an entity locally, then announce the deletion
    pub async fn broadcast_entity_delete(
        &self,
        kind: EntityKind,
        id: EntityId,
        url: impl Into<String>,
    ) -> SyncResult<()> {
        let url = url.into();
        let persisted = self.store.delete_entity(kind, &id, &url).await;
        self.announce(Outbound::Delete { kind, id, url });
        persisted
    }

    /// Identities with an open link, sorted
    pub async fn linked_peers(&self) -> Vec<PeerId> {
        self.query(Command::LinkedPeers).await.unwrap_or_default()
    }

    pub async fn is_linked(&self) -> bool {
        !self.linked_peers().await.is_empty()
    }

    /// Snapshot of link and peer state
    pub async fn diagnostics(&self) -> SyncResult<CoordinatorDiagnostics> {
        self.query(Command::Diagnostics).await
    }

    /// Replace the local identity and relink under it
    pub async fn reset_identity(&self) -> SyncResult<PeerId> {
        self.query(Command::ResetIdentity).await?
    }

    /// Tear down every link and stop the coordinator task
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.query(Command::Shutdown).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Actor
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct PeerSlot {
    state: LinkState,
    /// Attempt number of the next scheduled retry (1-based)
    attempt: u32,
    retry: Option<JoinHandle<()>>,
    grace: Option<JoinHandle<()>>,
}

impl PeerSlot {
    fn new() -> Self {
        Self {
            attempt: 1,
            ..Default::default()
        }
    }

    fn cancel_timers(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.abort();
        }
        if let Some(grace) = self.grace.take() {
            grace.abort();
        }
    }

    fn is_busy(&self) -> bool {
        matches!(self.state, LinkState::Open | LinkState::Connecting)
    }
}

struct Actor {
    local_id: PeerId,
    shared_id: Arc<RwLock<PeerId>>,
    /// Peers the transport may accept inbound links from
    admitted: Arc<RwLock<BTreeSet<PeerId>>>,
    identity: IdentityProvider,
    store: Arc<dyn EntityStore>,
    registry: Option<PeerRegistry>,
    settings: Settings,
    config: CoordinatorConfig,
    factory: TransportFactory,
    transport: Option<Arc<dyn Transport>>,
    transport_ready: bool,
    generation: u64,
    init_attempt: u32,
    init_timer: Option<JoinHandle<()>>,
    peers: HashMap<PeerId, PeerSlot>,
    page_url: Option<String>,
    /// Linked peers owed an initial sync that waits for a page
    buffered: HashSet<PeerId>,
    /// Peers whose initial sync snapshot is being read
    loading: HashSet<PeerId>,
    known: HashSet<(EntityKind, EntityId)>,
    events: broadcast::Sender<RemoteEvent>,
    weak_tx: mpsc::WeakUnboundedSender<Command>,
}

fn admitted_peers(settings: &Settings) -> BTreeSet<PeerId> {
    if settings.sharing_enabled {
        settings.desired_peers.clone()
    } else {
        BTreeSet::new()
    }
}

fn send_weak(tx: &mpsc::WeakUnboundedSender<Command>, command: Command) {
    if let Some(tx) = tx.upgrade() {
        let _ = tx.send(command);
    }
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        if self.settings.sharing_enabled {
            self.install_transport();
        }

        while let Some(command) = rx.recv().await {
            if let Some(generation) = command.generation() {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "Ignoring stale command");
                    continue;
                }
            }
            if let Command::Shutdown(reply) = command {
                if let Some(transport) = self.teardown_transport() {
                    let _ = transport.disconnect().await;
                }
                let _ = reply.send(());
                info!(peer = %self.local_id, "Sync coordinator stopped");
                return;
            }
            self.handle(command);
        }

        if let Some(transport) = self.teardown_transport() {
            let _ = transport.disconnect().await;
        }
        debug!(peer = %self.local_id, "All coordinator handles dropped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::LinkOpened { peer, .. } => self.on_link_opened(peer),
            Command::LinkClosed { peer, .. } => self.on_link_closed(peer),
            Command::Inbound { from, payload, .. } => self.on_inbound(from, &payload),
            Command::TransportLost { .. } => self.on_transport_lost(),
            Command::InitFinished { result, .. } => self.on_init_finished(result),
            Command::ConnectFinished { peer, result, .. } => self.on_connect_finished(peer, result),
            Command::SnapshotLoaded {
                peer, page, result, ..
            } => self.on_snapshot_loaded(peer, page, result),
            Command::InitRetryDue { .. } => {
                self.init_timer = None;
                self.initialize_transport();
            }
            Command::RetryDue { peer, .. } => self.on_retry_due(peer),
            Command::GraceExpired { peer, .. } => self.on_grace_expired(peer),
            Command::SetPage(url) => self.set_page(url),
            Command::Broadcast(outbound) => self.broadcast(outbound),
            Command::ApplySettings(settings) => self.apply_settings(settings),
            Command::ResetIdentity(reply) => {
                let _ = reply.send(self.reset_identity());
            }
            Command::LinkedPeers(reply) => {
                let _ = reply.send(self.linked_peers());
            }
            Command::Diagnostics(reply) => {
                let _ = reply.send(self.diagnostics());
            }
            Command::Shutdown(_) => {}
        }
    }

    /// Run `work` off the actor and feed its result back as a command
    fn dispatch<F>(&self, work: F)
    where
        F: Future<Output = Command> + Send + 'static,
    {
        let tx = self.weak_tx.clone();
        tokio::spawn(async move {
            let command = work.await;
            send_weak(&tx, command);
        });
    }

    fn schedule(&self, delay: Duration, command: Command) -> JoinHandle<()> {
        let tx = self.weak_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            send_weak(&tx, command);
        })
    }

    fn record(&self, peer: &PeerId, outcome: LinkOutcome) {
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.record(peer, outcome) {
                warn!(peer = %peer, error = %e, "Failed to update peer registry");
            }
        }
    }

    fn is_desired(&self, peer: &PeerId) -> bool {
        self.settings.sharing_enabled && self.settings.desired_peers.contains(peer)
    }

    fn slot(&mut self, peer: &PeerId) -> &mut PeerSlot {
        self.peers.entry(peer.clone()).or_insert_with(PeerSlot::new)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Transport lifecycle
    // ═══════════════════════════════════════════════════════════════════════

    fn install_transport(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let transport = (self.factory)(self.settings.transport, self.local_id.clone());

        let tx = self.weak_tx.clone();
        transport.on_message(Arc::new(move |from: PeerId, payload: String| {
            send_weak(
                &tx,
                Command::Inbound {
                    generation,
                    from,
                    payload,
                },
            )
        }));
        let tx = self.weak_tx.clone();
        transport.on_link_open(Arc::new(move |peer: PeerId| {
            send_weak(&tx, Command::LinkOpened { generation, peer })
        }));
        let tx = self.weak_tx.clone();
        transport.on_link_closed(Arc::new(move |peer: PeerId| {
            send_weak(&tx, Command::LinkClosed { generation, peer })
        }));
        let tx = self.weak_tx.clone();
        transport.on_session_lost(Arc::new(move || {
            send_weak(&tx, Command::TransportLost { generation })
        }));
        let admitted = self.admitted.clone();
        transport.set_admission(Arc::new(move |peer: &PeerId| admitted.read().contains(peer)));

        debug!(kind = %self.settings.transport, generation, "Transport installed");
        self.transport = Some(transport);
        self.transport_ready = false;
        self.init_attempt = 1;
        self.initialize_transport();
    }

    fn initialize_transport(&mut self) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        let generation = self.generation;
        let server = self.settings.relay_address.clone();
        self.dispatch(async move {
            let result = transport.initialize(&server).await;
            Command::InitFinished { generation, result }
        });
    }

    fn on_init_finished(&mut self, result: Result<(), TransportError>) {
        match result {
            Ok(()) => {
                info!(
                    peer = %self.local_id,
                    server = %self.settings.relay_address,
                    "Transport ready"
                );
                self.transport_ready = true;
                self.init_attempt = 1;
                let desired: Vec<PeerId> = self.settings.desired_peers.iter().cloned().collect();
                for peer in desired {
                    self.plan_link(&peer);
                }
            }
            Err(e) => {
                let delay = self.config.backoff.delay(self.init_attempt);
                warn!(
                    error = %e,
                    attempt = self.init_attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Transport initialization failed; staying local-only"
                );
                self.init_attempt = self.init_attempt.saturating_add(1);
                self.transport_ready = false;
                let generation = self.generation;
                self.init_timer = Some(self.schedule(delay, Command::InitRetryDue { generation }));
            }
        }
    }

    /// The rendezvous session dropped: re-initialize, keeping links that survived
    fn on_transport_lost(&mut self) {
        if !self.transport_ready {
            return;
        }
        warn!(peer = %self.local_id, "Rendezvous session lost; reinitializing transport");
        self.transport_ready = false;
        self.init_attempt = 1;
        for slot in self.peers.values_mut() {
            // Readiness re-plans every desired peer
            if let Some(retry) = slot.retry.take() {
                retry.abort();
            }
        }
        self.initialize_transport();
    }

    /// Drop the transport and everything tied to it; returns it for disconnecting
    fn teardown_transport(&mut self) -> Option<Arc<dyn Transport>> {
        self.generation += 1;
        if let Some(timer) = self.init_timer.take() {
            timer.abort();
        }
        for slot in self.peers.values_mut() {
            slot.cancel_timers();
        }
        self.peers.clear();
        self.buffered.clear();
        self.loading.clear();
        self.transport_ready = false;
        self.transport.take()
    }

    fn replace_transport(&mut self) {
        if let Some(old) = self.teardown_transport() {
            tokio::spawn(async move {
                let _ = old.disconnect().await;
            });
        }
        if self.settings.sharing_enabled {
            self.install_transport();
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Link planning
    // ═══════════════════════════════════════════════════════════════════════

    /// Start linking to a desired peer, honoring the tie-break
    fn plan_link(&mut self, peer: &PeerId) {
        if *peer == self.local_id || !self.is_desired(peer) || !self.transport_ready {
            return;
        }
        if self.slot(peer).is_busy() {
            return;
        }
        if should_initiate(&self.local_id, peer) {
            self.start_connect(peer);
        } else if self.slot(peer).grace.is_none() {
            let generation = self.generation;
            let grace = self.config.grace_period;
            debug!(
                peer = %peer,
                grace_ms = grace.as_millis() as u64,
                "Waiting for the peer to initiate"
            );
            let timer = self.schedule(
                grace,
                Command::GraceExpired {
                    generation,
                    peer: peer.clone(),
                },
            );
            self.slot(peer).grace = Some(timer);
        }
    }

    fn start_connect(&mut self, peer: &PeerId) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        let slot = self.slot(peer);
        slot.state = LinkState::Connecting;
        if let Some(retry) = slot.retry.take() {
            retry.abort();
        }
        let attempt = slot.attempt;
        self.record(peer, LinkOutcome::Attempted);
        info!(peer = %peer, attempt, "Connecting to peer");

        let generation = self.generation;
        let peer = peer.clone();
        self.dispatch(async move {
            let result = transport.connect(&peer).await;
            Command::ConnectFinished {
                generation,
                peer,
                result,
            }
        });
    }

    fn schedule_retry(&mut self, peer: &PeerId) {
        if !self.is_desired(peer) || !self.transport_ready {
            return;
        }
        let generation = self.generation;
        let backoff = self.config.backoff;
        let slot = self.slot(peer);
        let attempt = slot.attempt;
        let delay = backoff.delay(attempt);
        slot.attempt = attempt.saturating_add(1);
        if let Some(previous) = slot.retry.take() {
            previous.abort();
        }
        info!(
            peer = %peer,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        let timer = self.schedule(
            delay,
            Command::RetryDue {
                generation,
                peer: peer.clone(),
            },
        );
        self.slot(peer).retry = Some(timer);
    }

    fn on_connect_finished(&mut self, peer: PeerId, result: Result<(), TransportError>) {
        let state = self.slot(&peer).state;
        match result {
            Ok(()) if state == LinkState::Connecting => {
                // The transport reports opens before `connect` returns, so no open means no link
                debug!(peer = %peer, "Connect returned without an open link");
                self.slot(&peer).state = LinkState::Closed;
                self.schedule_retry(&peer);
            }
            Ok(()) => {}
            Err(TransportError::NotInitialized) => {
                self.slot(&peer).state = LinkState::Closed;
                // Only the first failure after readiness restarts initialization
                if self.transport_ready {
                    warn!(peer = %peer, "Transport lost; reinitializing");
                    self.transport_ready = false;
                    self.initialize_transport();
                }
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "Link attempt failed");
                self.record(&peer, LinkOutcome::Failed);
                if state == LinkState::Connecting {
                    self.slot(&peer).state = LinkState::Closed;
                }
                if state != LinkState::Open {
                    self.schedule_retry(&peer);
                }
            }
        }
    }

    fn on_retry_due(&mut self, peer: PeerId) {
        let desired = self.is_desired(&peer);
        let ready = self.transport_ready;
        let slot = self.slot(&peer);
        slot.retry = None;
        if !desired || !ready {
            return;
        }
        if slot.is_busy() {
            debug!(peer = %peer, state = %slot.state, "Link already present; retry dropped");
            return;
        }
        self.start_connect(&peer);
    }

    fn on_grace_expired(&mut self, peer: PeerId) {
        let desired = self.is_desired(&peer);
        let ready = self.transport_ready;
        let slot = self.slot(&peer);
        slot.grace = None;
        if !desired || !ready || slot.is_busy() {
            return;
        }
        info!(peer = %peer, "No inbound link within grace period; initiating");
        self.start_connect(&peer);
    }

    fn on_link_opened(&mut self, peer: PeerId) {
        if !self.is_desired(&peer) {
            info!(peer = %peer, "Closing link from a peer that is not shared with");
            if let Some(transport) = self.transport.clone() {
                tokio::spawn(async move { transport.close_link(&peer).await });
            }
            return;
        }

        let slot = self.slot(&peer);
        let was_open = slot.state == LinkState::Open;
        slot.state = LinkState::Open;
        slot.attempt = 1;
        slot.cancel_timers();
        if !was_open {
            self.record(&peer, LinkOutcome::Opened);
            info!(peer = %peer, "Peer linked");
        }
        self.request_initial_sync(peer);
    }

    fn on_link_closed(&mut self, peer: PeerId) {
        let Some(slot) = self.peers.get_mut(&peer) else {
            return;
        };
        if slot.state != LinkState::Open {
            return;
        }
        slot.state = LinkState::Closed;
        self.buffered.remove(&peer);
        self.record(&peer, LinkOutcome::Failed);
        info!(peer = %peer, "Peer link closed");
        self.schedule_retry(&peer);
    }

    fn linked_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, slot)| slot.state == LinkState::Open)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Initial sync
    // ═══════════════════════════════════════════════════════════════════════

    /// Owe `peer` an initial sync; one per peer is pending at a time
    fn request_initial_sync(&mut self, peer: PeerId) {
        if self.buffered.contains(&peer) || self.loading.contains(&peer) {
            debug!(peer = %peer, "Initial sync already pending");
            return;
        }
        if self.page_url.is_none() {
            debug!(peer = %peer, "No page yet; buffering initial sync");
            self.buffered.insert(peer);
            return;
        }
        self.load_snapshot(peer);
    }

    fn load_snapshot(&mut self, peer: PeerId) {
        let Some(page) = self.page_url.clone() else {
            self.buffered.insert(peer);
            return;
        };
        self.loading.insert(peer.clone());
        let store = self.store.clone();
        let generation = self.generation;
        self.dispatch(async move {
            let result = read_snapshot(store.as_ref(), &page).await;
            Command::SnapshotLoaded {
                generation,
                peer,
                page,
                result,
            }
        });
    }

    fn on_snapshot_loaded(&mut self, peer: PeerId, page: String, result: SyncResult<EntitySnapshot>) {
        if self.page_url.as_deref() != Some(page.as_str()) {
            debug!(peer = %peer, "Page changed while reading snapshot; reading again");
            self.loading.remove(&peer);
            self.load_snapshot(peer);
            return;
        }
        self.loading.remove(&peer);

        let mut snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to read entities for initial sync");
                return;
            }
        };
        if self.slot(&peer).state != LinkState::Open {
            debug!(peer = %peer, "Link closed before initial sync could be sent");
            return;
        }

        snapshot.stamp_owner(&self.local_id);
        let count = snapshot.len();
        let payload = match SyncMessage::InitialSync(snapshot).encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Failed to encode initial sync");
                return;
            }
        };
        let sent = self
            .transport
            .as_ref()
            .map(|t| t.send_to(&peer, &payload))
            .unwrap_or(false);
        if sent {
            info!(peer = %peer, entities = count, "Sent initial sync");
        } else {
            warn!(peer = %peer, "Initial sync not handed to the link");
        }
    }

    fn set_page(&mut self, url: String) {
        if self.page_url.as_deref() == Some(url.as_str()) {
            return;
        }
        let first = self.page_url.is_none();
        info!(page = %url, "Page context set");
        self.page_url = Some(url);

        if !first {
            self.known.clear();
        }
        let mut owed: BTreeSet<PeerId> = self.buffered.drain().collect();
        if !first {
            owed.extend(self.linked_peers());
        }
        for peer in owed {
            if !self.loading.contains(&peer) {
                self.load_snapshot(peer);
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound messages
    // ═══════════════════════════════════════════════════════════════════════

    fn emit(&self, event: RemoteEvent) {
        debug!(event = event.name(), from = %event.from(), kind = %event.kind(), "Remote event");
        let _ = self.events.send(event);
    }

    /// Whether an entity from a peer belongs on the current page
    fn accepts(&self, from: &PeerId, entity: &AnyEntity) -> bool {
        match &self.page_url {
            None => {
                debug!(peer = %from, id = %entity.id(), "No page context; dropping entity");
                false
            }
            Some(page) if in_scope(entity.url(), page) => true,
            Some(_) => {
                debug!(peer = %from, url = entity.url(), "Out of scope; dropping entity");
                false
            }
        }
    }

    fn on_inbound(&mut self, from: PeerId, payload: &str) {
        let message = match SyncMessage::decode(payload) {
            Ok(message) => message,
            Err(ProtocolError::UnsupportedVersion(version)) => {
                warn!(peer = %from, version, "Skipping message with unsupported protocol version");
                return;
            }
            Err(e) => {
                warn!(peer = %from, error = %e, "Dropping undecodable message");
                return;
            }
        };

        match message {
            SyncMessage::InitialSync(snapshot) => {
                let mut snapshot = snapshot;
                for kind in EntityKind::ALL {
                    let entities: Vec<AnyEntity> = snapshot
                        .take_kind(kind)
                        .into_iter()
                        .filter(|e| self.accepts(&from, e))
                        .map(|e| e.owned_by(from.clone()))
                        .collect();
                    if entities.is_empty() {
                        continue;
                    }
                    for entity in &entities {
                        self.known.insert((kind, entity.id().clone()));
                    }
                    self.emit(RemoteEvent::InitialSync {
                        from: from.clone(),
                        kind,
                        entities,
                    });
                }
            }
            SyncMessage::Create(entity) => {
                if !self.accepts(&from, &entity) {
                    return;
                }
                self.known.insert((entity.kind(), entity.id().clone()));
                self.emit(RemoteEvent::EntityCreated {
                    entity: entity.owned_by(from.clone()),
                    from,
                });
            }
            SyncMessage::Update(entity) => {
                if !self.accepts(&from, &entity) {
                    return;
                }
                let first_sight = self.known.insert((entity.kind(), entity.id().clone()));
                let entity = entity.owned_by(from.clone());
                if first_sight {
                    debug!(peer = %from, id = %entity.id(), "Update for unseen entity; treating as create");
                    self.emit(RemoteEvent::EntityCreated { from, entity });
                } else {
                    self.emit(RemoteEvent::EntityUpdated { from, entity });
                }
            }
            SyncMessage::Delete { kind, descriptor } => {
                self.known.remove(&(kind, descriptor.entity_id.clone()));
                self.emit(RemoteEvent::EntityDeleted {
                    from,
                    kind,
                    entity_id: descriptor.entity_id,
                    scope_url: descriptor.scope_url,
                });
            }
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Outbound mutations
    // ═══════════════════════════════════════════════════════════════════════

    fn broadcast(&mut self, outbound: Outbound) {
        if !self.settings.sharing_enabled {
            debug!("Sharing disabled; mutation kept local");
            return;
        }
        let Some(transport) = self.transport.clone() else {
            debug!("No transport; mutation kept local");
            return;
        };

        let message = match outbound {
            Outbound::Create(entity) => SyncMessage::Create(entity.owned_by(self.local_id.clone())),
            Outbound::Update(entity) => SyncMessage::Update(entity.owned_by(self.local_id.clone())),
            Outbound::Delete { kind, id, url } => SyncMessage::Delete {
                kind,
                descriptor: DeleteDescriptor {
                    entity_id: id,
                    scope_url: self.settings.scope().key(&url),
                },
            },
        };
        let kind = message.kind();
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to encode outbound message");
                return;
            }
        };
        match transport.broadcast(&payload) {
            Ok(links) => debug!(kind = %kind, links, "Broadcast mutation"),
            Err(e) => debug!(kind = %kind, error = %e, "Broadcast skipped"),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Settings and identity
    // ═══════════════════════════════════════════════════════════════════════

    fn apply_settings(&mut self, next: Settings) {
        let previous = std::mem::replace(&mut self.settings, next);
        *self.admitted.write() = admitted_peers(&self.settings);
        let next = &self.settings;

        if !next.sharing_enabled {
            if let Some(old) = self.teardown_transport() {
                info!("Sharing disabled; links torn down");
                tokio::spawn(async move {
                    let _ = old.disconnect().await;
                });
            }
            return;
        }

        if self.transport.is_none() || previous.transport_changed(next) {
            info!(kind = %next.transport, server = %next.relay_address, "Rebuilding transport");
            self.replace_transport();
            return;
        }

        let removed: Vec<PeerId> = previous
            .desired_peers
            .difference(&next.desired_peers)
            .cloned()
            .collect();
        let added: Vec<PeerId> = next
            .desired_peers
            .difference(&previous.desired_peers)
            .cloned()
            .collect();

        for peer in removed {
            if let Some(mut slot) = self.peers.remove(&peer) {
                slot.cancel_timers();
                self.buffered.remove(&peer);
                if slot.state == LinkState::Open {
                    info!(peer = %peer, "Peer no longer shared with; closing link");
                    if let Some(transport) = self.transport.clone() {
                        tokio::spawn(async move { transport.close_link(&peer).await });
                    }
                }
            }
        }
        for peer in added {
            self.plan_link(&peer);
        }
    }

    fn reset_identity(&mut self) -> SyncResult<PeerId> {
        let fresh = self.identity.reset_identity()?;
        info!(old = %self.local_id, new = %fresh, "Local identity reset; relinking");
        self.local_id = fresh.clone();
        *self.shared_id.write() = fresh.clone();
        self.known.clear();
        if self.transport.is_some() {
            self.replace_transport();
        }
        Ok(fresh)
    }

    fn diagnostics(&self) -> CoordinatorDiagnostics {
        let mut ids: BTreeSet<PeerId> = self.settings.desired_peers.clone();
        ids.extend(self.peers.keys().cloned());

        let peers = ids
            .into_iter()
            .map(|peer_id| {
                let slot = self.peers.get(&peer_id);
                PeerLinkInfo {
                    desired: self.settings.desired_peers.contains(&peer_id),
                    state: slot.map(|s| s.state).unwrap_or_default(),
                    attempt: slot.map(|s| s.attempt).unwrap_or(1),
                    retry_pending: slot.map(|s| s.retry.is_some()).unwrap_or(false),
                    grace_pending: slot.map(|s| s.grace.is_some()).unwrap_or(false),
                    peer_id,
                }
            })
            .collect();

        let mut pending: Vec<PeerId> = self.buffered.union(&self.loading).cloned().collect();
        pending.sort();

        CoordinatorDiagnostics {
            local_id: self.local_id.clone(),
            page_url: self.page_url.clone(),
            sharing_enabled: self.settings.sharing_enabled,
            transport_ready: self.transport_ready,
            peers,
            pending_initial_sync: pending,
        }
    }
}

async fn read_snapshot(store: &dyn EntityStore, page: &str) -> SyncResult<EntitySnapshot> {
    let mut snapshot = EntitySnapshot::default();
    for kind in EntityKind::ALL {
        for entity in store.get_entities_for_url(kind, page).await? {
            snapshot.push(entity);
        }
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::transport::{AdmitHandler, LinkHandler, MessageHandler, SessionHandler};
    use crate::types::Note;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use tempfile::TempDir;
    use tokio::time::sleep;

    const PAGE: &str = "https://example.com/a";

    // ═══════════════════════════════════════════════════════════════════════
    // Test doubles
    // ═══════════════════════════════════════════════════════════════════════

    /// Results handed out to every transport the factory builds
    #[derive(Default)]
    struct Script {
        init_failures: u32,
        connect_results: VecDeque<Result<(), TransportError>>,
    }

    #[derive(Default)]
    struct MockState {
        initialized: bool,
        inits: usize,
        connects: Vec<PeerId>,
        broadcasts: Vec<String>,
        sent: Vec<(PeerId, String)>,
        closed: Vec<PeerId>,
        open: BTreeSet<PeerId>,
    }

    #[derive(Default)]
    struct MockObservers {
        message: Option<MessageHandler>,
        open: Option<LinkHandler>,
        closed: Option<LinkHandler>,
        session_lost: Option<SessionHandler>,
        admit: Option<AdmitHandler>,
    }

    struct MockTransport {
        local_id: PeerId,
        script: Arc<Mutex<Script>>,
        state: Mutex<MockState>,
        observers: Mutex<MockObservers>,
    }

    impl MockTransport {
        fn fire_open(&self, peer: &PeerId) {
            let handler = self.observers.lock().open.clone();
            if let Some(handler) = handler {
                handler(peer.clone());
            }
        }

        fn fire_closed(&self, peer: &PeerId) {
            let handler = self.observers.lock().closed.clone();
            if let Some(handler) = handler {
                handler(peer.clone());
            }
        }

        /// Simulate the remote opening a link to us
        fn open_from(&self, peer: &str) {
            let peer = PeerId::from(peer);
            self.state.lock().open.insert(peer.clone());
            self.fire_open(&peer);
        }

        /// Simulate the remote dropping the link
        fn close_from(&self, peer: &str) {
            let peer = PeerId::from(peer);
            self.state.lock().open.remove(&peer);
            self.fire_closed(&peer);
        }

        fn deliver(&self, from: &str, payload: String) {
            let handler = self.observers.lock().message.clone();
            if let Some(handler) = handler {
                handler(PeerId::from(from), payload);
            }
        }

        fn connects(&self) -> Vec<PeerId> {
            self.state.lock().connects.clone()
        }

        /// Simulate the rendezvous session dropping while peer links survive
        fn lose_session(&self) {
            self.state.lock().initialized = false;
            let handler = self.observers.lock().session_lost.clone();
            if let Some(handler) = handler {
                handler();
            }
        }

        fn admits(&self, peer: &str) -> bool {
            let admit = self.observers.lock().admit.clone();
            admit.map(|admit| admit(&PeerId::from(peer))).unwrap_or(true)
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Relay
        }

        fn local_id(&self) -> &PeerId {
            &self.local_id
        }

        async fn initialize(&self, _server_addr: &str) -> Result<(), TransportError> {
            let mut state = self.state.lock();
            state.inits += 1;
            let mut script = self.script.lock();
            if script.init_failures > 0 {
                script.init_failures -= 1;
                return Err(TransportError::Init("scripted failure".into()));
            }
            state.initialized = true;
            Ok(())
        }

        async fn connect(&self, remote: &PeerId) -> Result<(), TransportError> {
            self.state.lock().connects.push(remote.clone());
            let result = self.script.lock().connect_results.pop_front().unwrap_or(Ok(()));
            if result.is_ok() {
                self.state.lock().open.insert(remote.clone());
                self.fire_open(remote);
            }
            result
        }

        fn broadcast(&self, payload: &str) -> Result<usize, TransportError> {
            let mut state = self.state.lock();
            if !state.initialized {
                return Err(TransportError::NotInitialized);
            }
            state.broadcasts.push(payload.to_string());
            Ok(state.open.len())
        }

        fn send_to(&self, remote: &PeerId, payload: &str) -> bool {
            let mut state = self.state.lock();
            if !state.open.contains(remote) {
                return false;
            }
            state.sent.push((remote.clone(), payload.to_string()));
            true
        }

        fn on_message(&self, handler: MessageHandler) {
            self.observers.lock().message = Some(handler);
        }

        fn on_link_open(&self, handler: LinkHandler) {
            self.observers.lock().open = Some(handler);
        }

        fn on_link_closed(&self, handler: LinkHandler) {
            self.observers.lock().closed = Some(handler);
        }

        fn on_session_lost(&self, handler: SessionHandler) {
            self.observers.lock().session_lost = Some(handler);
        }

        fn set_admission(&self, admit: AdmitHandler) {
            self.observers.lock().admit = Some(admit);
        }

        async fn close_link(&self, remote: &PeerId) {
            let was_open = {
                let mut state = self.state.lock();
                state.closed.push(remote.clone());
                state.open.remove(remote)
            };
            if was_open {
                self.fire_closed(remote);
            }
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            let mut state = self.state.lock();
            state.initialized = false;
            state.open.clear();
            Ok(())
        }

        fn open_links(&self) -> Vec<PeerId> {
            self.state.lock().open.iter().cloned().collect()
        }

        fn is_initialized(&self) -> bool {
            self.state.lock().initialized
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        entities: Mutex<Vec<AnyEntity>>,
        fail_writes: Mutex<bool>,
    }

    #[async_trait]
    impl EntityStore for MemoryStore {
        async fn get_entities_for_url(&self, kind: EntityKind, url: &str) -> SyncResult<Vec<AnyEntity>> {
            Ok(self
                .entities
                .lock()
                .iter()
                .filter(|e| e.kind() == kind && e.url() == url)
                .cloned()
                .collect())
        }

        async fn save_entity(&self, entity: &AnyEntity) -> SyncResult<()> {
            if *self.fail_writes.lock() {
                return Err(SyncError::Storage("disk full".into()));
            }
            let mut entities = self.entities.lock();
            entities.retain(|e| e.id() != entity.id());
            entities.push(entity.clone());
            Ok(())
        }

        async fn delete_entity(&self, _kind: EntityKind, id: &EntityId, _url: &str) -> SyncResult<()> {
            self.entities.lock().retain(|e| e.id() != id);
            Ok(())
        }
    }

    struct Harness {
        handle: CoordinatorHandle,
        store: Arc<MemoryStore>,
        transports: Arc<Mutex<Vec<Arc<MockTransport>>>>,
        _dir: TempDir,
    }

    impl Harness {
        fn transport(&self) -> Arc<MockTransport> {
            self.transports.lock().last().cloned().expect("no transport built")
        }

        fn script_init_failures(&self, failures: u32) {
            self.transport().script.lock().init_failures = failures;
        }
    }

    fn start_with(local: &str, settings: Settings, script: Script) -> Harness {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path().join("coordinator.redb")).unwrap();
        storage.save_identity(&PeerId::from(local)).unwrap();

        let store = Arc::new(MemoryStore::default());
        let script = Arc::new(Mutex::new(script));
        let transports: Arc<Mutex<Vec<Arc<MockTransport>>>> = Arc::new(Mutex::new(Vec::new()));

        let factory: TransportFactory = {
            let script = script.clone();
            let transports = transports.clone();
            Arc::new(move |_kind: TransportKind, id: PeerId| {
                let transport = Arc::new(MockTransport {
                    local_id: id,
                    script: script.clone(),
                    state: Mutex::new(MockState::default()),
                    observers: Mutex::new(MockObservers::default()),
                });
                transports.lock().push(transport.clone());
                transport as Arc<dyn Transport>
            })
        };

        let handle = SyncCoordinator::new(IdentityProvider::new(storage), store.clone(), settings)
            .with_transport_factory(factory)
            .start()
            .unwrap();

        Harness {
            handle,
            store,
            transports,
            _dir: dir,
        }
    }

    fn start(local: &str, peers: &[&str]) -> Harness {
        start_with(
            local,
            Settings::default().sharing_with(peers.iter().copied()),
            Script::default(),
        )
    }

    /// Let spawned work run; with paused time this also advances the clock
    async fn settle() {
        sleep(Duration::from_millis(10)).await;
    }

    async fn advance(secs: u64) {
        sleep(Duration::from_secs(secs)).await;
    }

    fn wire(message: SyncMessage) -> String {
        message.encode().unwrap()
    }

    fn drain(rx: &mut broadcast::Receiver<RemoteEvent>) -> Vec<RemoteEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Link planning
    // ═══════════════════════════════════════════════════════════════════════

    #[tokio::test(start_paused = true)]
    async fn test_lower_identity_dials_immediately() {
        let h = start("memo-aaa", &["memo-bbb"]);
        settle().await;

        assert_eq!(h.transport().connects(), vec![PeerId::from("memo-bbb")]);
        assert_eq!(h.handle.linked_peers().await, vec![PeerId::from("memo-bbb")]);
        assert!(h.handle.is_linked().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_higher_identity_waits_for_grace_period() {
        let h = start("memo-bbb", &["memo-aaa"]);
        settle().await;
        assert!(h.transport().connects().is_empty());

        let diag = h.handle.diagnostics().await.unwrap();
        assert!(diag.peers[0].grace_pending);

        advance(14).await;
        assert!(h.transport().connects().is_empty());

        advance(2).await;
        assert_eq!(h.transport().connects(), vec![PeerId::from("memo-aaa")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_link_cancels_grace_timer() {
        let h = start("memo-bbb", &["memo-aaa"]);
        settle().await;

        h.transport().open_from("memo-aaa");
        settle().await;
        advance(30).await;

        assert!(h.transport().connects().is_empty());
        assert_eq!(h.handle.linked_peers().await, vec![PeerId::from("memo-aaa")]);
        let diag = h.handle.diagnostics().await.unwrap();
        assert!(!diag.peers[0].grace_pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_links_back_off_exponentially() {
        let timeout = || Err(TransportError::LinkTimeout("memo-bbb".into()));
        let script = Script {
            connect_results: (0..5).map(|_| timeout()).collect(),
            ..Default::default()
        };
        let h = start_with("memo-aaa", Settings::default().sharing_with(["memo-bbb"]), script);
        settle().await;
        let count = || h.transport().connects().len();
        assert_eq!(count(), 1);

        // Retries land at t = 10, 30, 70, 130
        advance(9).await;
        assert_eq!(count(), 1);
        advance(2).await;
        assert_eq!(count(), 2);
        advance(18).await;
        assert_eq!(count(), 2);
        advance(2).await;
        assert_eq!(count(), 3);
        advance(38).await;
        assert_eq!(count(), 3);
        advance(2).await;
        assert_eq!(count(), 4);
        advance(58).await;
        assert_eq!(count(), 4);
        advance(2).await;
        assert_eq!(count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_counter_resets_after_link_opens() {
        let script = Script {
            connect_results: VecDeque::from([Err(TransportError::Closed)]),
            ..Default::default()
        };
        let h = start_with("memo-aaa", Settings::default().sharing_with(["memo-bbb"]), script);
        settle().await;
        assert_eq!(h.handle.diagnostics().await.unwrap().peers[0].attempt, 2);

        advance(11).await;
        assert_eq!(h.handle.linked_peers().await, vec![PeerId::from("memo-bbb")]);
        assert_eq!(h.handle.diagnostics().await.unwrap().peers[0].attempt, 1);

        // A dropped link retries on the base delay again
        h.transport().close_from("memo-bbb");
        settle().await;
        let diag = h.handle.diagnostics().await.unwrap();
        assert_eq!(diag.peers[0].state, LinkState::Closed);
        assert!(diag.peers[0].retry_pending);

        advance(11).await;
        assert_eq!(h.transport().connects().len(), 3);
        assert!(h.handle.is_linked().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_link_cancels_pending_retry() {
        let script = Script {
            connect_results: VecDeque::from([Err(TransportError::Closed)]),
            ..Default::default()
        };
        let h = start_with("memo-aaa", Settings::default().sharing_with(["memo-bbb"]), script);
        settle().await;

        h.transport().open_from("memo-bbb");
        settle().await;
        advance(30).await;

        assert_eq!(h.transport().connects().len(), 1);
        assert!(h.handle.is_linked().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_undesired_inbound_link_is_closed() {
        let h = start("memo-bbb", &["memo-aaa"]);
        settle().await;

        h.transport().open_from("memo-zzz");
        settle().await;

        assert_eq!(h.transport().state.lock().closed, vec![PeerId::from("memo-zzz")]);
        assert!(h.handle.linked_peers().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_failure_stays_local_and_retries() {
        let script = Script {
            init_failures: 1,
            ..Default::default()
        };
        let h = start_with("memo-aaa", Settings::default().sharing_with(["memo-bbb"]), script);
        settle().await;

        let diag = h.handle.diagnostics().await.unwrap();
        assert!(!diag.transport_ready);
        assert!(h.transport().connects().is_empty());

        advance(11).await;
        assert_eq!(h.transport().state.lock().inits, 2);
        assert_eq!(h.transport().connects(), vec![PeerId::from("memo-bbb")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_loss_reinitializes_and_keeps_links() {
        let h = start("memo-aaa", &["memo-bbb"]);
        settle().await;
        assert!(h.handle.is_linked().await);

        h.transport().lose_session();
        settle().await;

        let diag = h.handle.diagnostics().await.unwrap();
        assert!(diag.transport_ready);
        assert_eq!(h.transport().state.lock().inits, 2);
        assert_eq!(h.transports.lock().len(), 1);
        // The surviving link is not redialed
        assert_eq!(h.transport().connects().len(), 1);
        assert_eq!(h.handle.linked_peers().await, vec![PeerId::from("memo-bbb")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_loss_redials_closed_links_after_reinit() {
        let h = start("memo-aaa", &["memo-bbb"]);
        settle().await;

        // Relay mode: links go down with the session
        h.transport().close_from("memo-bbb");
        h.script_init_failures(1);
        h.transport().lose_session();
        settle().await;
        assert!(!h.handle.diagnostics().await.unwrap().transport_ready);
        assert!(!h.handle.is_linked().await);

        advance(11).await;
        assert!(h.handle.diagnostics().await.unwrap().transport_ready);
        assert_eq!(h.transport().state.lock().inits, 3);
        assert_eq!(h.transport().connects().len(), 2);
        assert!(h.handle.is_linked().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_follows_desired_peers() {
        let h = start("memo-bbb", &["memo-aaa"]);
        settle().await;
        let transport = h.transport();
        assert!(transport.admits("memo-aaa"));
        assert!(!transport.admits("memo-zzz"));

        h.handle
            .apply_settings(Settings::default().sharing_with(["memo-aaa", "memo-zzz"]))
            .unwrap();
        settle().await;
        assert!(transport.admits("memo-zzz"));

        h.handle
            .apply_settings(Settings::default().sharing_with(["memo-zzz"]))
            .unwrap();
        settle().await;
        assert!(!transport.admits("memo-aaa"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sharing_disabled_builds_no_transport() {
        let h = start_with("memo-aaa", Settings::default(), Script::default());
        settle().await;
        assert!(h.transports.lock().is_empty());

        let diag = h.handle.diagnostics().await.unwrap();
        assert!(!diag.sharing_enabled);
        assert!(!diag.transport_ready);
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Initial sync
    // ═══════════════════════════════════════════════════════════════════════

    #[tokio::test(start_paused = true)]
    async fn test_initial_sync_waits_for_page_and_is_sent_once() {
        let h = start("memo-aaa", &["memo-bbb"]);
        h.store
            .entities
            .lock()
            .push(Note::new(PAGE, "mine").into());
        settle().await;

        // Duplicate open notification while the sync is still owed
        h.transport().open_from("memo-bbb");
        settle().await;
        assert!(h.transport().state.lock().sent.is_empty());
        let diag = h.handle.diagnostics().await.unwrap();
        assert_eq!(diag.pending_initial_sync, vec![PeerId::from("memo-bbb")]);

        h.handle.set_page(PAGE).unwrap();
        h.handle.set_page(PAGE).unwrap();
        settle().await;

        let sent = h.transport().state.lock().sent.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, PeerId::from("memo-bbb"));
        match SyncMessage::decode(&sent[0].1).unwrap() {
            SyncMessage::InitialSync(snapshot) => {
                assert_eq!(snapshot.notes.len(), 1);
                assert_eq!(snapshot.notes[0].owner_id, Some(PeerId::from("memo-aaa")));
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(h.handle.diagnostics().await.unwrap().pending_initial_sync.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_change_resends_initial_sync() {
        let h = start("memo-aaa", &["memo-bbb"]);
        h.handle.set_page(PAGE).unwrap();
        settle().await;
        assert_eq!(h.transport().state.lock().sent.len(), 1);

        h.handle.set_page("https://example.com/b").unwrap();
        settle().await;
        assert_eq!(h.transport().state.lock().sent.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_initial_sync_is_filtered_by_scope() {
        let h = start("memo-aaa", &["memo-bbb"]);
        let mut rx = h.handle.subscribe();
        h.handle.set_page(PAGE).unwrap();
        settle().await;

        let snapshot: EntitySnapshot = [
            AnyEntity::from(Note::new(PAGE, "here")),
            AnyEntity::from(Note::new("https://other.org/", "elsewhere")),
        ]
        .into_iter()
        .collect();
        h.transport()
            .deliver("memo-bbb", wire(SyncMessage::InitialSync(snapshot)));
        settle().await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            RemoteEvent::InitialSync { from, kind, entities } => {
                assert_eq!(from, &PeerId::from("memo-bbb"));
                assert_eq!(*kind, EntityKind::Note);
                assert_eq!(entities.len(), 1);
                assert_eq!(entities[0].owner_id(), Some(&PeerId::from("memo-bbb")));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound mutations
    // ═══════════════════════════════════════════════════════════════════════

    #[tokio::test(start_paused = true)]
    async fn test_inbound_mutations_become_remote_events() {
        let h = start("memo-aaa", &["memo-bbb"]);
        let mut rx = h.handle.subscribe();
        h.handle.set_page(PAGE).unwrap();
        settle().await;
        let t = h.transport();

        let created: AnyEntity = Note::new(PAGE, "hello").into();
        let unseen: AnyEntity = Note::new(PAGE, "never created").into();
        t.deliver("memo-bbb", wire(SyncMessage::Create(created.clone())));
        t.deliver("memo-bbb", wire(SyncMessage::Create(Note::new("https://other.org/", "x").into())));
        t.deliver("memo-bbb", wire(SyncMessage::Update(unseen.clone())));
        t.deliver("memo-bbb", wire(SyncMessage::Update(unseen.clone())));
        t.deliver(
            "memo-bbb",
            wire(SyncMessage::Delete {
                kind: EntityKind::Note,
                descriptor: DeleteDescriptor {
                    entity_id: EntityId::from("note-never-seen"),
                    scope_url: "https://other.org/".into(),
                },
            }),
        );
        settle().await;

        let names: Vec<&str> = drain(&mut rx).iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec![
                "remote-entity-created",
                "remote-entity-created",
                "remote-entity-updated",
                "remote-entity-deleted",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_entities_dropped_without_page() {
        let h = start("memo-aaa", &["memo-bbb"]);
        let mut rx = h.handle.subscribe();
        settle().await;

        h.transport()
            .deliver("memo-bbb", wire(SyncMessage::Create(Note::new(PAGE, "early").into())));
        settle().await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_version_is_skipped() {
        let h = start("memo-aaa", &["memo-bbb"]);
        let mut rx = h.handle.subscribe();
        h.handle.set_page(PAGE).unwrap();
        settle().await;
        let t = h.transport();

        t.deliver(
            "memo-bbb",
            r#"{"protocolVersion":99,"kind":"note-create","data":{}}"#.to_string(),
        );
        t.deliver("memo-bbb", "not json".to_string());
        t.deliver("memo-bbb", wire(SyncMessage::Create(Note::new(PAGE, "ok").into())));
        settle().await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "remote-entity-created");
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Outbound mutations
    // ═══════════════════════════════════════════════════════════════════════

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_persists_then_sends_with_local_owner() {
        let h = start("memo-aaa", &["memo-bbb"]);
        settle().await;

        let note: AnyEntity = Note::new(PAGE, "shared").into();
        h.handle.broadcast_entity_create(note.clone()).await.unwrap();
        settle().await;

        assert_eq!(h.store.entities.lock().len(), 1);
        let broadcasts = h.transport().state.lock().broadcasts.clone();
        assert_eq!(broadcasts.len(), 1);
        match SyncMessage::decode(&broadcasts[0]).unwrap() {
            SyncMessage::Create(entity) => {
                assert_eq!(entity.id(), note.id());
                assert_eq!(entity.owner_id(), Some(&PeerId::from("memo-aaa")));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sharing_disabled_still_persists() {
        let h = start_with("memo-aaa", Settings::default(), Script::default());
        settle().await;

        h.handle
            .broadcast_entity_update(Note::new(PAGE, "local only").into())
            .await
            .unwrap();
        settle().await;

        assert_eq!(h.store.entities.lock().len(), 1);
        assert!(h.transports.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_failure_still_broadcasts() {
        let h = start("memo-aaa", &["memo-bbb"]);
        settle().await;
        *h.store.fail_writes.lock() = true;

        let result = h
            .handle
            .broadcast_entity_create(Note::new(PAGE, "unsaved").into())
            .await;
        settle().await;

        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert_eq!(h.transport().state.lock().broadcasts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_carries_local_scope_key() {
        let mut settings = Settings::default().sharing_with(["memo-bbb"]);
        settings.strip_query_string = true;
        let h = start_with("memo-aaa", settings, Script::default());
        settle().await;

        let note: AnyEntity = Note::new(PAGE, "doomed").into();
        h.store.entities.lock().push(note.clone());
        h.handle
            .broadcast_entity_delete(EntityKind::Note, note.id().clone(), format!("{}?tab=2#top", PAGE))
            .await
            .unwrap();
        settle().await;

        assert!(h.store.entities.lock().is_empty());
        let broadcasts = h.transport().state.lock().broadcasts.clone();
        match SyncMessage::decode(&broadcasts[0]).unwrap() {
            SyncMessage::Delete { kind, descriptor } => {
                assert_eq!(kind, EntityKind::Note);
                assert_eq!(&descriptor.entity_id, note.id());
                assert_eq!(descriptor.scope_url, PAGE);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Settings, identity, shutdown
    // ═══════════════════════════════════════════════════════════════════════

    #[tokio::test(start_paused = true)]
    async fn test_removing_desired_peer_closes_link() {
        let h = start("memo-aaa", &["memo-bbb", "memo-ccc"]);
        settle().await;
        assert_eq!(h.handle.linked_peers().await.len(), 2);

        h.handle
            .apply_settings(Settings::default().sharing_with(["memo-ccc"]))
            .unwrap();
        settle().await;

        assert_eq!(h.transport().state.lock().closed, vec![PeerId::from("memo-bbb")]);
        assert_eq!(h.handle.linked_peers().await, vec![PeerId::from("memo-ccc")]);
        advance(120).await;
        assert_eq!(h.transport().connects().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_adding_desired_peer_links_without_new_transport() {
        let h = start("memo-aaa", &["memo-bbb"]);
        settle().await;

        h.handle
            .apply_settings(Settings::default().sharing_with(["memo-bbb", "memo-ccc"]))
            .unwrap();
        settle().await;

        assert_eq!(h.transports.lock().len(), 1);
        assert_eq!(h.handle.linked_peers().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_change_rebuilds_transport() {
        let h = start("memo-aaa", &["memo-bbb"]);
        settle().await;
        let first = h.transport();

        h.handle
            .apply_settings(
                Settings::default()
                    .sharing_with(["memo-bbb"])
                    .with_transport(TransportKind::Direct),
            )
            .unwrap();
        settle().await;

        assert_eq!(h.transports.lock().len(), 2);
        assert!(!first.is_initialized());
        assert!(h.transport().is_initialized());
        assert_eq!(h.handle.linked_peers().await, vec![PeerId::from("memo-bbb")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabling_sharing_tears_down_links() {
        let h = start("memo-aaa", &["memo-bbb"]);
        settle().await;

        h.handle.apply_settings(Settings::default()).unwrap();
        settle().await;

        assert!(!h.transport().is_initialized());
        assert!(h.handle.linked_peers().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_identity_relinks_under_new_id() {
        let h = start("memo-aaa", &["memo-bbb"]);
        settle().await;
        let first = h.transport();

        let fresh = h.handle.reset_identity().await.unwrap();
        settle().await;

        assert_ne!(fresh, PeerId::from("memo-aaa"));
        assert_eq!(h.handle.local_identity(), fresh);
        assert!(!first.is_initialized());
        assert_eq!(h.transport().local_id(), &fresh);
        assert_eq!(h.handle.diagnostics().await.unwrap().local_id, fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects_and_stops() {
        let h = start("memo-aaa", &["memo-bbb"]);
        settle().await;

        h.handle.shutdown().await.unwrap();
        assert!(!h.transport().is_initialized());
        assert!(matches!(
            h.handle.set_page(PAGE),
            Err(SyncError::CoordinatorStopped)
        ));
        assert!(h.handle.linked_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_diagnostics_lists_desired_peers() {
        let script = Script {
            init_failures: 100,
            ..Default::default()
        };
        let h = start_with("memo-aaa", Settings::default().sharing_with(["memo-bbb"]), script);
        h.handle.set_page(PAGE).unwrap();

        let diag = h.handle.diagnostics().await.unwrap();
        assert_eq!(diag.local_id, PeerId::from("memo-aaa"));
        assert_eq!(diag.page_url.as_deref(), Some(PAGE));
        assert_eq!(diag.peers.len(), 1);
        assert!(diag.peers[0].desired);
        assert_eq!(diag.peers[0].state, LinkState::Absent);
        assert!(diag.open_peers().is_empty());
    }
}
