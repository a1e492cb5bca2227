//! Link layer between peers
//!
//! A [`Transport`] manages zero or more logical links, one per remote identity,
//! and delivers opaque text payloads over them. Two implementations share the
//! contract:
//!
//! - [`RelayTransport`]: every payload travels through the rendezvous server,
//!   which forwards it to the registered identity.
//! - [`DirectTransport`]: the rendezvous only resolves addresses; payloads
//!   travel over a socket between the two peers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Transport (trait object, chosen by TransportKind)              │
//! │  ├── control: session with the rendezvous server                │
//! │  └── links: LinkTable                                           │
//! │      ├── per-peer state (connecting / open / closed)            │
//! │      ├── per-peer sender (never blocks the caller)              │
//! │      └── observers: on_message / on_link_open / on_link_closed  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::debug;

use crate::error::TransportError;
use crate::settings::TransportKind;
use crate::sync::events::LinkState;
use crate::types::PeerId;

pub mod direct;
pub mod frame;
pub mod relay;

pub use direct::DirectTransport;
pub use relay::RelayTransport;

use frame::{ClientFrame, FrameReader, ServerFrame};

/// Default bound on an outbound link attempt
pub const DEFAULT_LINK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default listening address for direct links (ephemeral port)
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:0";

/// Observer for inbound payloads: `(from, payload)`
pub type MessageHandler = Arc<dyn Fn(PeerId, String) + Send + Sync>;

/// Observer for link open/close transitions
pub type LinkHandler = Arc<dyn Fn(PeerId) + Send + Sync>;

/// Observer for the loss of the rendezvous session
pub type SessionHandler = Arc<dyn Fn() + Send + Sync>;

/// Decides whether a remote may open a link to us
pub type AdmitHandler = Arc<dyn Fn(&PeerId) -> bool + Send + Sync>;

/// Timing and socket options shared by both transports
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long `connect` (and `initialize`) wait before giving up
    pub link_timeout: Duration,
    /// Where [`DirectTransport`] listens for inbound peer sockets
    pub listen_addr: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            link_timeout: DEFAULT_LINK_TIMEOUT,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
        }
    }
}

/// Uniform link contract the sync coordinator is written against
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which implementation this is
    fn kind(&self) -> TransportKind;

    /// Identity this transport registers as
    fn local_id(&self) -> &PeerId;

    /// Open the control session with the rendezvous at `server_addr` (`host:port`)
    ///
    /// Must succeed before any link can be formed.
    async fn initialize(&self, server_addr: &str) -> Result<(), TransportError>;

    /// Link to `remote`
    ///
    /// Returns immediately if a link is already connecting or open.
    async fn connect(&self, remote: &PeerId) -> Result<(), TransportError>;

    /// Hand `payload` to every open link; returns how many links took it
    fn broadcast(&self, payload: &str) -> Result<usize, TransportError>;

    /// Hand `payload` to the link to `remote`; false if there is no open link
    fn send_to(&self, remote: &PeerId, payload: &str) -> bool;

    /// Register the inbound payload observer (replaces any previous one)
    fn on_message(&self, handler: MessageHandler);

    /// Register the link-open observer (replaces any previous one)
    fn on_link_open(&self, handler: LinkHandler);

    /// Register the link-closed observer (replaces any previous one)
    fn on_link_closed(&self, handler: LinkHandler);

    /// Register the observer told when the rendezvous session drops
    ///
    /// Fires after any links that depended on the session were closed. The
    /// transport stays usable for links that survive; `initialize` must be
    /// called again before new links can form.
    fn on_session_lost(&self, handler: SessionHandler);

    /// Install the inbound link policy (replaces any previous one)
    ///
    /// Remotes it rejects are refused during link setup. Without a policy
    /// every remote is admitted.
    fn set_admission(&self, admit: AdmitHandler);

    /// Tear down the link to `remote`, if any
    async fn close_link(&self, remote: &PeerId);

    /// Tear down every link and the control session
    ///
    /// Later operations fail with [`TransportError::NotInitialized`].
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Identities with an open link, sorted
    fn open_links(&self) -> Vec<PeerId>;

    /// Whether the control session is up
    fn is_initialized(&self) -> bool;
}

/// Build the transport selected by `kind`
pub fn build_transport(
    kind: TransportKind,
    local_id: PeerId,
    config: TransportConfig,
) -> Arc<dyn Transport> {
    match kind {
        TransportKind::Relay => Arc::new(RelayTransport::new(local_id, config)),
        TransportKind::Direct => Arc::new(DirectTransport::new(local_id, config)),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Link table
// ═══════════════════════════════════════════════════════════════════════════

/// Hands one payload to a link's channel
pub(crate) type LinkSender = Box<dyn Fn(&str) -> bool + Send + Sync>;

type Waiter = oneshot::Sender<Result<(), TransportError>>;

struct Link {
    id: u64,
    state: LinkState,
    sender: Option<LinkSender>,
    tasks: Vec<AbortHandle>,
    waiter: Option<Waiter>,
}

impl Link {
    fn new(state: LinkState) -> Self {
        Self {
            id: 0,
            state,
            sender: None,
            tasks: Vec::new(),
            waiter: None,
        }
    }

    fn teardown(&mut self) {
        self.state = LinkState::Closed;
        self.sender = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[derive(Default)]
struct Observers {
    message: Option<MessageHandler>,
    open: Option<LinkHandler>,
    closed: Option<LinkHandler>,
    session_lost: Option<SessionHandler>,
    admit: Option<AdmitHandler>,
}

/// Per-peer link states, senders and observers shared by both transports
///
/// Observers are always invoked after the table lock is released.
#[derive(Default)]
pub(crate) struct LinkTable {
    links: Mutex<HashMap<PeerId, Link>>,
    observers: RwLock<Observers>,
    next_id: AtomicU64,
}

impl LinkTable {
    pub fn set_on_message(&self, handler: MessageHandler) {
        self.observers.write().message = Some(handler);
    }

    pub fn set_on_open(&self, handler: LinkHandler) {
        self.observers.write().open = Some(handler);
    }

    pub fn set_on_closed(&self, handler: LinkHandler) {
        self.observers.write().closed = Some(handler);
    }

    pub fn set_on_session_lost(&self, handler: SessionHandler) {
        self.observers.write().session_lost = Some(handler);
    }

    pub fn set_admission(&self, admit: AdmitHandler) {
        self.observers.write().admit = Some(admit);
    }

    /// Whether `peer` may open a link to us
    pub fn admits(&self, peer: &PeerId) -> bool {
        let admit = self.observers.read().admit.clone();
        admit.map(|admit| admit(peer)).unwrap_or(true)
    }

    pub fn notify_session_lost(&self) {
        let handler = self.observers.read().session_lost.clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn notify_open(&self, peer: &PeerId) {
        let handler = self.observers.read().open.clone();
        if let Some(handler) = handler {
            handler(peer.clone());
        }
    }

    fn notify_closed(&self, peer: &PeerId) {
        let handler = self.observers.read().closed.clone();
        if let Some(handler) = handler {
            handler(peer.clone());
        }
    }

    pub fn state(&self, peer: &PeerId) -> LinkState {
        self.links
            .lock()
            .get(peer)
            .map(|l| l.state)
            .unwrap_or_default()
    }

    /// Mark `peer` connecting; `None` if a link is already connecting or open
    pub fn begin_connect(&self, peer: &PeerId) -> Option<oneshot::Receiver<Result<(), TransportError>>> {
        let mut links = self.links.lock();
        let link = links
            .entry(peer.clone())
            .or_insert_with(|| Link::new(LinkState::Absent));
        if matches!(link.state, LinkState::Connecting | LinkState::Open) {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        link.state = LinkState::Connecting;
        link.waiter = Some(tx);
        Some(rx)
    }

    /// Claim the open slot for `peer`; `None` if a link is already open
    ///
    /// The link carries no sender until [`activate`](Self::activate).
    pub fn reserve(&self, peer: &PeerId) -> Option<u64> {
        let mut links = self.links.lock();
        let link = links
            .entry(peer.clone())
            .or_insert_with(|| Link::new(LinkState::Absent));
        if link.state == LinkState::Open {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        link.id = id;
        link.state = LinkState::Open;
        Some(id)
    }

    /// Attach the sender and tasks of a reserved link and announce it
    pub fn activate(&self, peer: &PeerId, id: u64, sender: LinkSender, tasks: Vec<AbortHandle>) {
        let waiter = {
            let mut links = self.links.lock();
            match links.get_mut(peer) {
                Some(link) if link.id == id && link.state == LinkState::Open => {
                    link.sender = Some(sender);
                    link.tasks = tasks;
                    link.waiter.take()
                }
                _ => {
                    for task in tasks {
                        task.abort();
                    }
                    return;
                }
            }
        };
        debug!(peer = %peer, link = id, "Link open");
        // Observers hear about the link before the pending `connect` returns
        self.notify_open(peer);
        if let Some(waiter) = waiter {
            let _ = waiter.send(Ok(()));
        }
    }

    /// Reserve and activate in one step; false if already open
    pub fn establish(&self, peer: &PeerId, sender: LinkSender) -> bool {
        match self.reserve(peer) {
            Some(id) => {
                self.activate(peer, id, sender, Vec::new());
                true
            }
            None => false,
        }
    }

    /// Give back a reservation that never became active
    pub fn release(&self, peer: &PeerId, id: u64) {
        let mut links = self.links.lock();
        if let Some(link) = links.get_mut(peer) {
            if link.id == id && link.sender.is_none() {
                link.teardown();
            }
        }
    }

    /// Fail a pending attempt, waking its `connect`
    pub fn refuse(&self, peer: &PeerId, err: TransportError) {
        let mut links = self.links.lock();
        if let Some(link) = links.get_mut(peer) {
            if link.state == LinkState::Connecting {
                link.state = LinkState::Closed;
                if let Some(waiter) = link.waiter.take() {
                    let _ = waiter.send(Err(err));
                }
            }
        }
    }

    /// Drop a pending attempt whose caller stopped waiting
    pub fn abandon(&self, peer: &PeerId) {
        let mut links = self.links.lock();
        if let Some(link) = links.get_mut(peer) {
            if link.state == LinkState::Connecting {
                link.state = LinkState::Closed;
                link.waiter = None;
            }
        }
    }

    /// Close the link to `peer`; returns whether it was open
    pub fn close(&self, peer: &PeerId) -> bool {
        let was_open = {
            let mut links = self.links.lock();
            match links.get_mut(peer) {
                Some(link) if link.state == LinkState::Open => {
                    link.teardown();
                    true
                }
                Some(link) if link.state == LinkState::Connecting => {
                    link.state = LinkState::Closed;
                    if let Some(waiter) = link.waiter.take() {
                        let _ = waiter.send(Err(TransportError::Closed));
                    }
                    false
                }
                _ => false,
            }
        };
        if was_open {
            debug!(peer = %peer, "Link closed");
            self.notify_closed(peer);
        }
        was_open
    }

    /// Close the link only if it is still the instance `id`
    pub fn close_instance(&self, peer: &PeerId, id: u64) {
        let current = self
            .links
            .lock()
            .get(peer)
            .map(|l| l.id == id && l.state == LinkState::Open)
            .unwrap_or(false);
        if current {
            self.close(peer);
        }
    }

    /// Close every open link, notifying for each
    pub fn close_all(&self) {
        let peers: Vec<PeerId> = self.links.lock().keys().cloned().collect();
        for peer in peers {
            self.close(&peer);
        }
    }

    /// Drop every link without notifying observers
    pub fn clear(&self) {
        let drained: Vec<Link> = self.links.lock().drain().map(|(_, l)| l).collect();
        for mut link in drained {
            if let Some(waiter) = link.waiter.take() {
                let _ = waiter.send(Err(TransportError::Closed));
            }
            link.teardown();
        }
    }

    pub fn send(&self, peer: &PeerId, payload: &str) -> bool {
        let links = self.links.lock();
        match links.get(peer) {
            Some(Link {
                state: LinkState::Open,
                sender: Some(sender),
                ..
            }) => sender(payload),
            _ => false,
        }
    }

    pub fn broadcast(&self, payload: &str) -> usize {
        let links = self.links.lock();
        links
            .values()
            .filter(|l| l.state == LinkState::Open)
            .filter_map(|l| l.sender.as_ref())
            .filter(|sender| sender(payload))
            .count()
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .links
            .lock()
            .iter()
            .filter(|(_, l)| l.state == LinkState::Open)
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Pass an inbound payload to the message observer if the link is open
    pub fn deliver(&self, from: &PeerId, payload: String) {
        if self.state(from) != LinkState::Open {
            debug!(peer = %from, "Dropping payload from unlinked peer");
            return;
        }
        let handler = self.observers.read().message.clone();
        if let Some(handler) = handler {
            handler(from.clone(), payload);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Control session
// ═══════════════════════════════════════════════════════════════════════════

/// Live session with the rendezvous server
pub(crate) struct Control {
    pub generation: u64,
    pub tx: mpsc::UnboundedSender<String>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl Control {
    pub fn send(&self, frame: &ClientFrame) -> bool {
        match frame::encode(frame) {
            Ok(line) => self.tx.send(line).is_ok(),
            Err(_) => false,
        }
    }

    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Connect to the rendezvous, register, and wait for the acknowledgement
///
/// Returns the frame reader and a sender feeding a spawned writer task.
pub(crate) async fn open_control(
    server_addr: &str,
    register: ClientFrame,
    timeout: Duration,
) -> Result<(FrameReader, mpsc::UnboundedSender<String>, JoinHandle<()>), TransportError> {
    if server_addr.rsplit_once(':').map_or(true, |(host, port)| {
        host.is_empty() || port.parse::<u16>().is_err()
    }) {
        return Err(TransportError::Init(format!(
            "malformed server address '{}'",
            server_addr
        )));
    }

    let handshake = async {
        let stream = TcpStream::connect(server_addr)
            .await
            .map_err(|e| TransportError::Init(format!("{}: {}", server_addr, e)))?;
        let (mut reader, mut writer) = frame::split(stream);
        frame::write_frame(&mut writer, &register).await?;
        match frame::read_frame::<ServerFrame>(&mut reader).await? {
            Some(ServerFrame::Registered { .. }) => Ok((reader, writer)),
            Some(other) => Err(TransportError::Init(format!(
                "unexpected registration reply: {:?}",
                other
            ))),
            None => Err(TransportError::Init(
                "server closed during registration".to_string(),
            )),
        }
    };

    let (reader, writer) = tokio::time::timeout(timeout, handshake)
        .await
        .map_err(|_| TransportError::Init(format!("{}: registration timed out", server_addr)))??;

    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = frame::spawn_writer(writer, rx);
    Ok((reader, tx, writer_task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_sender(count: Arc<AtomicUsize>) -> LinkSender {
        Box::new(move |_: &str| {
            count.fetch_add(1, Ordering::SeqCst);
            true
        })
    }

    #[test]
    fn test_begin_connect_is_idempotent() {
        let table = LinkTable::default();
        let peer: PeerId = "memo-bbb".into();
        assert!(table.begin_connect(&peer).is_some());
        assert!(table.begin_connect(&peer).is_none());
        assert_eq!(table.state(&peer), LinkState::Connecting);
    }

    #[test]
    fn test_second_open_is_rejected() {
        let table = LinkTable::default();
        let peer: PeerId = "memo-bbb".into();
        let count = Arc::new(AtomicUsize::new(0));
        assert!(table.establish(&peer, counting_sender(count.clone())));
        assert!(!table.establish(&peer, counting_sender(count.clone())));
        assert_eq!(table.open_peers(), vec![peer.clone()]);
        assert!(table.begin_connect(&peer).is_none());
    }

    #[tokio::test]
    async fn test_establish_wakes_connect_waiter() {
        let table = LinkTable::default();
        let peer: PeerId = "memo-bbb".into();
        let rx = table.begin_connect(&peer).unwrap();
        table.establish(&peer, Box::new(|_: &str| true));
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_refuse_wakes_connect_waiter_with_error() {
        let table = LinkTable::default();
        let peer: PeerId = "memo-bbb".into();
        let rx = table.begin_connect(&peer).unwrap();
        let err = TransportError::LinkRefused {
            peer: peer.to_string(),
            reason: "no".into(),
        };
        table.refuse(&peer, err.clone());
        assert_eq!(rx.await.unwrap(), Err(err));
        assert_eq!(table.state(&peer), LinkState::Closed);
    }

    #[test]
    fn test_broadcast_counts_open_links_only() {
        let table = LinkTable::default();
        let count = Arc::new(AtomicUsize::new(0));
        assert_eq!(table.broadcast("x"), 0);

        table.establish(&"memo-a".into(), counting_sender(count.clone()));
        table.establish(&"memo-b".into(), counting_sender(count.clone()));
        table.begin_connect(&"memo-c".into());
        assert_eq!(table.broadcast("x"), 2);
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(table.send(&"memo-a".into(), "y"));
        assert!(!table.send(&"memo-c".into(), "y"));
    }

    #[test]
    fn test_observers_fire_on_transitions() {
        let table = LinkTable::default();
        let opened = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(Mutex::new(Vec::new()));
        {
            let opened = opened.clone();
            table.set_on_open(Arc::new(move |p: PeerId| opened.lock().push(p)));
        }
        {
            let closed = closed.clone();
            table.set_on_closed(Arc::new(move |p: PeerId| closed.lock().push(p)));
        }

        let peer: PeerId = "memo-bbb".into();
        table.establish(&peer, Box::new(|_: &str| true));
        assert!(table.close(&peer));
        assert!(!table.close(&peer));

        assert_eq!(*opened.lock(), vec![peer.clone()]);
        assert_eq!(*closed.lock(), vec![peer]);
    }

    #[test]
    fn test_session_lost_observer_is_replaced() {
        let table = LinkTable::default();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        {
            let first = first.clone();
            table.set_on_session_lost(Arc::new(move || {
                first.fetch_add(1, Ordering::SeqCst);
            }));
        }
        {
            let second = second.clone();
            table.set_on_session_lost(Arc::new(move || {
                second.fetch_add(1, Ordering::SeqCst);
            }));
        }
        table.notify_session_lost();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_admission_defaults_to_everyone() {
        let table = LinkTable::default();
        let peer: PeerId = "memo-bbb".into();
        assert!(table.admits(&peer));

        table.set_admission(Arc::new(|p: &PeerId| p.as_str() == "memo-ccc"));
        assert!(!table.admits(&peer));
        assert!(table.admits(&"memo-ccc".into()));
    }

    #[test]
    fn test_close_instance_ignores_stale_ids() {
        let table = LinkTable::default();
        let peer: PeerId = "memo-bbb".into();
        let first = table.reserve(&peer).unwrap();
        table.activate(&peer, first, Box::new(|_: &str| true), Vec::new());
        table.close(&peer);
        let second = table.reserve(&peer).unwrap();
        table.activate(&peer, second, Box::new(|_: &str| true), Vec::new());

        table.close_instance(&peer, first);
        assert_eq!(table.state(&peer), LinkState::Open);
        table.close_instance(&peer, second);
        assert_eq!(table.state(&peer), LinkState::Closed);
    }

    #[test]
    fn test_clear_is_silent() {
        let table = LinkTable::default();
        let closed = Arc::new(AtomicUsize::new(0));
        {
            let closed = closed.clone();
            table.set_on_closed(Arc::new(move |_: PeerId| {
                closed.fetch_add(1, Ordering::SeqCst);
            }));
        }
        table.establish(&"memo-a".into(), Box::new(|_: &str| true));
        table.clear();
        assert!(table.open_peers().is_empty());
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_delivery_requires_open_link() {
        let table = LinkTable::default();
        let received = Arc::new(Mutex::new(Vec::new()));
        {
            let received = received.clone();
            table.set_on_message(Arc::new(move |from: PeerId, payload: String| {
                received.lock().push((from, payload))
            }));
        }
        let peer: PeerId = "memo-bbb".into();
        table.deliver(&peer, "early".into());
        table.establish(&peer, Box::new(|_: &str| true));
        table.deliver(&peer, "late".into());
        assert_eq!(*received.lock(), vec![(peer, "late".to_string())]);
    }

    #[tokio::test]
    async fn test_malformed_server_address_fails_init() {
        let register = ClientFrame::Register {
            peer_id: "memo-a".into(),
            direct_addr: None,
        };
        for addr in ["no-port", ":7878", "host:notaport"] {
            let err = open_control(addr, register.clone(), Duration::from_secs(1))
                .await
                .err()
                .unwrap();
            assert!(matches!(err, TransportError::Init(_)), "{}: {:?}", addr, err);
        }
    }
}
