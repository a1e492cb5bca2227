//! Rendezvous and relay server
//!
//! One process serves both transports:
//!
//! - it keeps a registry of connected identities (and, for direct links, the
//!   address each one listens on),
//! - it forwards link requests, acceptances and closures between identities,
//! - it forwards relayed payloads to the addressed identity.
//!
//! A second registration of the same identity replaces the first session,
//! which is told `replaced` and closed. When a session ends, every other
//! session is told `peerGone`.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::transport::frame::{self, ClientFrame, FrameReader, ServerFrame};
use crate::types::PeerId;

struct Session {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
    direct_addr: Option<String>,
    kick: Option<oneshot::Sender<()>>,
}

impl Session {
    fn send(&self, frame: &ServerFrame) -> bool {
        match frame::encode(frame) {
            Ok(line) => self.tx.send(line).is_ok(),
            Err(_) => false,
        }
    }
}

#[derive(Default)]
struct Registry {
    sessions: Mutex<HashMap<PeerId, Session>>,
    next_id: AtomicU64,
}

impl Registry {
    fn register(
        &self,
        peer_id: &PeerId,
        tx: mpsc::UnboundedSender<String>,
        direct_addr: Option<String>,
    ) -> (u64, oneshot::Receiver<()>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (kick_tx, kick_rx) = oneshot::channel();
        let session = Session {
            id,
            tx,
            direct_addr,
            kick: Some(kick_tx),
        };
        let previous = self.sessions.lock().insert(peer_id.clone(), session);
        if let Some(mut previous) = previous {
            info!(peer = %peer_id, "Identity re-registered; replacing earlier session");
            previous.send(&ServerFrame::Replaced);
            if let Some(kick) = previous.kick.take() {
                let _ = kick.send(());
            }
        }
        (id, kick_rx)
    }

    /// Remove the session if it is still the current one for `peer_id`
    fn unregister(&self, peer_id: &PeerId, id: u64) {
        let removed = {
            let mut sessions = self.sessions.lock();
            match sessions.get(peer_id) {
                Some(s) if s.id == id => sessions.remove(peer_id).is_some(),
                _ => false,
            }
        };
        if removed {
            info!(peer = %peer_id, "Peer disconnected");
            let gone = ServerFrame::PeerGone {
                peer_id: peer_id.clone(),
            };
            for session in self.sessions.lock().values() {
                session.send(&gone);
            }
        }
    }

    /// Send to `to`; false if it is not connected
    fn send_to(&self, to: &PeerId, frame: &ServerFrame) -> bool {
        self.sessions
            .lock()
            .get(to)
            .map(|s| s.send(frame))
            .unwrap_or(false)
    }

    fn address_of(&self, peer_id: &PeerId) -> Option<String> {
        self.sessions
            .lock()
            .get(peer_id)
            .and_then(|s| s.direct_addr.clone())
    }

    fn route(&self, from: &PeerId, frame: ClientFrame) {
        match frame {
            ClientFrame::Register { .. } => {
                warn!(peer = %from, "Ignoring repeated registration");
            }
            ClientFrame::Lookup { peer_id } => {
                let addr = self.address_of(&peer_id);
                self.send_to(from, &ServerFrame::PeerAddress { peer_id, addr });
            }
            ClientFrame::LinkRequest { to } => {
                let forwarded = self.send_to(&to, &ServerFrame::LinkRequest { from: from.clone() });
                if !forwarded {
                    debug!(from = %from, to = %to, "Link request for unknown peer");
                    self.send_to(
                        from,
                        &ServerFrame::LinkRefused {
                            peer: to,
                            reason: "peer is not connected".to_string(),
                        },
                    );
                }
            }
            ClientFrame::LinkAccept { to } => {
                self.send_to(&to, &ServerFrame::LinkAccepted { from: from.clone() });
            }
            ClientFrame::LinkReject { to, reason } => {
                self.send_to(
                    &to,
                    &ServerFrame::LinkRefused {
                        peer: from.clone(),
                        reason,
                    },
                );
            }
            ClientFrame::Relay { to, payload } => {
                let bytes = payload.len();
                if !self.send_to(
                    &to,
                    &ServerFrame::Relay {
                        from: from.clone(),
                        payload,
                    },
                ) {
                    debug!(from = %from, to = %to, bytes, "Dropping relay payload for unknown peer");
                }
            }
            ClientFrame::LinkClose { to } => {
                self.send_to(&to, &ServerFrame::LinkClosed { from: from.clone() });
            }
        }
    }

    fn connected(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// Rendezvous/relay server bound to a TCP listener
pub struct RendezvousServer {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl RendezvousServer {
    /// Bind to `addr` (`127.0.0.1:0` picks a free port)
    pub async fn bind(addr: &str) -> SyncResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            registry: Arc::new(Registry::default()),
        })
    }

    pub fn local_addr(&self) -> SyncResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the process ends
    pub async fn run(self) {
        self.run_until(std::future::pending::<()>()).await
    }

    /// Serve until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let addr = self.listener.local_addr().ok();
        info!(addr = ?addr, "Rendezvous server listening");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(peers = self.registry.connected(), "Rendezvous server shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let registry = self.registry.clone();
                        tokio::spawn(async move {
                            handle_session(registry, stream, remote).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "Accept failed"),
                },
            }
        }
    }

    /// Run on a background task; returns the bound address
    pub fn spawn(self) -> SyncResult<(SocketAddr, tokio::task::JoinHandle<()>)> {
        let addr = self.local_addr()?;
        Ok((addr, tokio::spawn(self.run())))
    }
}

async fn handle_session(registry: Arc<Registry>, stream: TcpStream, remote: SocketAddr) {
    let (mut reader, writer) = frame::split(stream);

    let (peer_id, direct_addr) = match frame::read_frame::<ClientFrame>(&mut reader).await {
        Ok(Some(ClientFrame::Register {
            peer_id,
            direct_addr,
        })) => (peer_id, direct_addr),
        Ok(Some(other)) => {
            warn!(%remote, frame = ?other, "First frame was not a registration");
            return;
        }
        Ok(None) => return,
        Err(e) => {
            debug!(%remote, error = %e, "Session failed before registration");
            return;
        }
    };

    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = frame::spawn_writer(writer, rx);
    let (session_id, kick) = registry.register(&peer_id, tx.clone(), direct_addr.clone());
    if let Ok(line) = frame::encode(&ServerFrame::Registered {
        peer_id: peer_id.clone(),
    }) {
        let _ = tx.send(line);
    }
    drop(tx);
    info!(peer = %peer_id, %remote, direct = ?direct_addr, "Peer registered");

    serve_session(&registry, &peer_id, &mut reader, kick).await;

    registry.unregister(&peer_id, session_id);
    // The writer ends once the registry's sender is gone and the queue drains
    let _ = writer_task.await;
}

async fn serve_session(
    registry: &Registry,
    peer_id: &PeerId,
    reader: &mut FrameReader,
    mut kick: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut kick => {
                debug!(peer = %peer_id, "Session replaced");
                break;
            }
            next = frame::read_frame::<ClientFrame>(reader) => match next {
                Ok(Some(frame)) => registry.route(peer_id, frame),
                Ok(None) => break,
                Err(e) => {
                    debug!(peer = %peer_id, error = %e, "Session read failed");
                    break;
                }
            },
        }
    }
}
