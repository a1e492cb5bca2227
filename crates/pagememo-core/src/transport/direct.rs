//! Direct transport
//!
//! The rendezvous server is used for signaling only: each peer registers the
//! address of its own listener, and a dialer looks the remote up before opening
//! a socket to it. Payloads then travel on that socket.
//!
//! ## Handshake
//!
//! ```text
//!   dialer                         listener
//!   │── hello{peerId: dialer} ──────▶│
//!   │◀───── welcome{peerId} ─────────│   or refuse{reason}
//!   │◀──────── data{payload} ───────▶│
//! ```
//!
//! When both sides dial each other at once, the listener accepts only a dialer
//! whose identity sorts lower than its own, so both ends settle on the same
//! socket.
//!
//! The listener and the peer sockets live independently of the rendezvous
//! session. Losing the session only stops lookups; open links keep working
//! and the listener keeps accepting until [`Transport::disconnect`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::frame::{self, ClientFrame, FrameReader, FrameWriter, PeerFrame, ServerFrame};
use super::{
    open_control, AdmitHandler, Control, LinkHandler, LinkSender, LinkTable, MessageHandler,
    SessionHandler, Transport, TransportConfig,
};
use crate::error::TransportError;
use crate::settings::TransportKind;
use crate::sync::events::LinkState;
use crate::types::PeerId;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

type AddressWaiter = oneshot::Sender<Option<String>>;

/// Bound peer listener and its accept loop
struct Listening {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

/// Peer-to-peer sockets negotiated through the rendezvous server
pub struct DirectTransport {
    inner: Arc<DirectInner>,
}

struct DirectInner {
    local_id: PeerId,
    config: TransportConfig,
    links: Arc<LinkTable>,
    control: Mutex<Option<Control>>,
    listening: Mutex<Option<Listening>>,
    generation: AtomicU64,
    lookups: Mutex<HashMap<PeerId, Vec<AddressWaiter>>>,
}

impl DirectTransport {
    pub fn new(local_id: PeerId, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(DirectInner {
                local_id,
                config,
                links: Arc::new(LinkTable::default()),
                control: Mutex::new(None),
                listening: Mutex::new(None),
                generation: AtomicU64::new(0),
                lookups: Mutex::new(HashMap::new()),
            }),
        }
    }
}

fn refused(peer: &PeerId, reason: impl Into<String>) -> TransportError {
    TransportError::LinkRefused {
        peer: peer.to_string(),
        reason: reason.into(),
    }
}

impl DirectInner {
    /// Whether the transport is between `initialize` and `disconnect`
    fn is_active(&self) -> bool {
        self.listening.lock().is_some()
    }

    /// Bind the peer listener on first use; later sessions reuse it
    async fn ensure_listener(self: &Arc<Self>) -> Result<SocketAddr, TransportError> {
        let existing = self.listening.lock().as_ref().map(|l| l.addr);
        if let Some(addr) = existing {
            return Ok(addr);
        }

        let listener = TcpListener::bind(&self.config.listen_addr)
            .await
            .map_err(|e| TransportError::Init(format!("listen on {}: {}", self.config.listen_addr, e)))?;
        let addr = listener
            .local_addr()
            .map_err(|e| TransportError::Init(e.to_string()))?;

        let mut listening = self.listening.lock();
        if let Some(current) = listening.as_ref() {
            return Ok(current.addr);
        }
        *listening = Some(Listening {
            addr,
            task: tokio::spawn(accept_loop(self.clone(), listener)),
        });
        Ok(addr)
    }

    fn send_control(&self, frame: &ClientFrame) -> bool {
        self.control
            .lock()
            .as_ref()
            .map(|c| c.send(frame))
            .unwrap_or(false)
    }

    /// Ask the rendezvous for `remote`'s listening address
    async fn lookup(&self, remote: &PeerId) -> Result<Option<String>, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.lookups.lock().entry(remote.clone()).or_default().push(tx);
        if !self.send_control(&ClientFrame::Lookup {
            peer_id: remote.clone(),
        }) {
            return Err(TransportError::NotInitialized);
        }
        rx.await.map_err(|_| TransportError::Closed)
    }

    /// Spawn reader/writer tasks for a handshaken socket and activate the reserved link
    fn attach(&self, remote: &PeerId, id: u64, reader: FrameReader, writer: FrameWriter) {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let writer_task = frame::spawn_writer(writer, rx);
        let reader_task = tokio::spawn(read_link(self.links.clone(), remote.clone(), id, reader));

        let sender: LinkSender = Box::new(move |payload: &str| {
            frame::encode(&PeerFrame::Data {
                payload: payload.to_string(),
            })
            .map(|line| tx.send(line).is_ok())
            .unwrap_or(false)
        });
        self.links.activate(
            remote,
            id,
            sender,
            vec![writer_task.abort_handle(), reader_task.abort_handle()],
        );
    }

    /// Outbound half of the handshake
    async fn dial(&self, remote: &PeerId) -> Result<(), TransportError> {
        let addr = self
            .lookup(remote)
            .await?
            .ok_or_else(|| refused(remote, "peer is not registered"))?;
        debug!(peer = %remote, %addr, "Dialing peer");

        let stream = TcpStream::connect(&addr).await?;
        let (mut reader, mut writer) = frame::split(stream);
        frame::write_frame(
            &mut writer,
            &PeerFrame::Hello {
                peer_id: self.local_id.clone(),
            },
        )
        .await?;

        match frame::read_frame::<PeerFrame>(&mut reader).await? {
            Some(PeerFrame::Welcome { peer_id }) if peer_id == *remote => {}
            Some(PeerFrame::Welcome { peer_id }) => {
                return Err(refused(remote, format!("listener answered as {}", peer_id)));
            }
            Some(PeerFrame::Refuse { reason }) => return Err(refused(remote, reason)),
            Some(_) => return Err(refused(remote, "unexpected handshake frame")),
            None => return Err(TransportError::Closed),
        }

        match self.links.reserve(remote) {
            Some(id) => self.attach(remote, id, reader, writer),
            None => debug!(peer = %remote, "Link opened by the remote meanwhile; dropping dialed socket"),
        }
        Ok(())
    }

    /// Inbound half of the handshake
    async fn accept(&self, stream: TcpStream) -> Result<(), TransportError> {
        let (mut reader, mut writer) = frame::split(stream);
        let hello = tokio::time::timeout(
            self.config.link_timeout,
            frame::read_frame::<PeerFrame>(&mut reader),
        )
        .await
        .map_err(|_| TransportError::LinkTimeout("inbound handshake".to_string()))??;

        let remote = match hello {
            Some(PeerFrame::Hello { peer_id }) => peer_id,
            Some(_) => return Err(TransportError::Io("expected hello".to_string())),
            None => return Err(TransportError::Closed),
        };

        let refusal = match self.links.state(&remote) {
            _ if !self.links.admits(&remote) => Some("not shared with"),
            LinkState::Open => Some("already linked"),
            LinkState::Connecting if remote > self.local_id => {
                Some("simultaneous dial; the lower identity's socket is kept")
            }
            _ => None,
        };
        if let Some(reason) = refusal {
            debug!(peer = %remote, reason, "Refusing inbound link");
            return frame::write_frame(
                &mut writer,
                &PeerFrame::Refuse {
                    reason: reason.to_string(),
                },
            )
            .await;
        }

        let Some(id) = self.links.reserve(&remote) else {
            return frame::write_frame(
                &mut writer,
                &PeerFrame::Refuse {
                    reason: "already linked".to_string(),
                },
            )
            .await;
        };
        let welcome = PeerFrame::Welcome {
            peer_id: self.local_id.clone(),
        };
        if let Err(e) = frame::write_frame(&mut writer, &welcome).await {
            self.links.release(&remote, id);
            return Err(e);
        }
        self.attach(&remote, id, reader, writer);
        Ok(())
    }

    fn handle_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::PeerAddress { peer_id, addr } => {
                let waiters = self.lookups.lock().remove(&peer_id).unwrap_or_default();
                for waiter in waiters {
                    let _ = waiter.send(addr.clone());
                }
            }
            ServerFrame::Replaced => {
                warn!(peer = %self.local_id, "Identity registered by another session");
            }
            other => debug!(frame = ?other, "Ignoring control frame"),
        }
    }

    fn control_lost(&self, generation: u64) {
        let lost = {
            let mut control = self.control.lock();
            match control.as_ref() {
                Some(c) if c.generation == generation => control.take(),
                _ => None,
            }
        };
        if let Some(control) = lost {
            warn!(peer = %self.local_id, "Rendezvous session lost; open links are kept");
            control.shutdown();
            self.lookups.lock().clear();
            self.links.notify_session_lost();
        }
    }
}

async fn read_link(links: Arc<LinkTable>, remote: PeerId, id: u64, mut reader: FrameReader) {
    loop {
        match frame::read_frame::<PeerFrame>(&mut reader).await {
            Ok(Some(PeerFrame::Data { payload })) => links.deliver(&remote, payload),
            Ok(Some(other)) => debug!(peer = %remote, frame = ?other, "Ignoring peer frame"),
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %remote, error = %e, "Peer socket failed");
                break;
            }
        }
    }
    links.close_instance(&remote, id);
}

async fn run_control(inner: Arc<DirectInner>, generation: u64, mut reader: FrameReader) {
    loop {
        match frame::read_frame::<ServerFrame>(&mut reader).await {
            Ok(Some(frame)) => inner.handle_frame(frame),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Rendezvous read failed");
                break;
            }
        }
    }
    inner.control_lost(generation);
}

async fn accept_loop(inner: Arc<DirectInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let inner = inner.clone();
                tokio::spawn(async move {
                    if let Err(e) = inner.accept(stream).await {
                        debug!(%addr, error = %e, "Inbound handshake failed");
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

#[async_trait]
impl Transport for DirectTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Direct
    }

    fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    async fn initialize(&self, server_addr: &str) -> Result<(), TransportError> {
        let listen_addr = self.inner.ensure_listener().await?;
        let register = ClientFrame::Register {
            peer_id: self.inner.local_id.clone(),
            direct_addr: Some(listen_addr.to_string()),
        };
        let (reader, tx, writer_task) =
            open_control(server_addr, register, self.inner.config.link_timeout).await?;

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let reader_task = tokio::spawn(run_control(self.inner.clone(), generation, reader));
        let previous = self.inner.control.lock().replace(Control {
            generation,
            tx,
            tasks: vec![writer_task, reader_task],
        });
        if let Some(previous) = previous {
            previous.shutdown();
        }

        info!(
            peer = %self.inner.local_id,
            server = %server_addr,
            listen = %listen_addr,
            "Direct transport ready"
        );
        Ok(())
    }

    async fn connect(&self, remote: &PeerId) -> Result<(), TransportError> {
        if !self.is_initialized() {
            return Err(TransportError::NotInitialized);
        }
        if self.inner.links.begin_connect(remote).is_none() {
            debug!(peer = %remote, "Link already connecting or open");
            return Ok(());
        }

        let outcome = tokio::time::timeout(self.inner.config.link_timeout, self.inner.dial(remote)).await;
        if self.inner.links.state(remote) == LinkState::Open {
            return Ok(());
        }
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.inner.links.refuse(remote, e.clone());
                Err(e)
            }
            Err(_) => {
                self.inner.links.abandon(remote);
                Err(TransportError::LinkTimeout(remote.to_string()))
            }
        }
    }

    fn broadcast(&self, payload: &str) -> Result<usize, TransportError> {
        if !self.inner.is_active() {
            return Err(TransportError::NotInitialized);
        }
        let sent = self.inner.links.broadcast(payload);
        if sent == 0 {
            debug!("Broadcast with no open links");
        }
        Ok(sent)
    }

    fn send_to(&self, remote: &PeerId, payload: &str) -> bool {
        self.inner.is_active() && self.inner.links.send(remote, payload)
    }

    fn on_message(&self, handler: MessageHandler) {
        self.inner.links.set_on_message(handler);
    }

    fn on_link_open(&self, handler: LinkHandler) {
        self.inner.links.set_on_open(handler);
    }

    fn on_link_closed(&self, handler: LinkHandler) {
        self.inner.links.set_on_closed(handler);
    }

    fn on_session_lost(&self, handler: SessionHandler) {
        self.inner.links.set_on_session_lost(handler);
    }

    fn set_admission(&self, admit: AdmitHandler) {
        self.inner.links.set_admission(admit);
    }

    async fn close_link(&self, remote: &PeerId) {
        self.inner.links.close(remote);
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let control = self.inner.control.lock().take();
        let listening = self.inner.listening.lock().take();
        if control.is_none() && listening.is_none() {
            return Err(TransportError::NotInitialized);
        }
        if let Some(control) = control {
            control.shutdown();
        }
        if let Some(listening) = listening {
            listening.task.abort();
        }
        self.inner.lookups.lock().clear();
        self.inner.links.clear();
        info!(peer = %self.inner.local_id, "Direct transport disconnected");
        Ok(())
    }

    fn open_links(&self) -> Vec<PeerId> {
        self.inner.links.open_peers()
    }

    fn is_initialized(&self) -> bool {
        self.inner.control.lock().is_some()
    }
}
