//! Relay transport
//!
//! Every link is virtual: payloads are wrapped in `Relay` frames and the
//! rendezvous server forwards them to the registered identity. Link setup is a
//! request/accept exchange through the server:
//!
//! ```text
//!   A                      server                      B
//!   │── linkRequest{to:B} ──▶│── linkRequest{from:A} ──▶│
//!   │◀─ linkAccepted{from:B}─│◀── linkAccept{to:A} ─────│  (B open)
//!   │  (A open)              │                          │
//! ```
//!
//! A request from an identity the admission policy does not cover is answered
//! with `linkReject`. Losing the control session closes every link before the
//! session-lost observer fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::frame::{self, ClientFrame, FrameReader, ServerFrame};
use super::{
    open_control, AdmitHandler, Control, LinkHandler, LinkSender, LinkTable, MessageHandler,
    SessionHandler, Transport, TransportConfig,
};
use crate::error::TransportError;
use crate::settings::TransportKind;
use crate::sync::events::LinkState;
use crate::types::PeerId;

/// Links forwarded through the rendezvous server
pub struct RelayTransport {
    inner: Arc<RelayInner>,
}

struct RelayInner {
    local_id: PeerId,
    config: TransportConfig,
    links: LinkTable,
    control: Mutex<Option<Control>>,
    generation: AtomicU64,
}

impl RelayTransport {
    pub fn new(local_id: PeerId, config: TransportConfig) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                local_id,
                config,
                links: LinkTable::default(),
                control: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }
}

impl RelayInner {
    fn control_tx(&self) -> Option<mpsc::UnboundedSender<String>> {
        self.control.lock().as_ref().map(|c| c.tx.clone())
    }

    fn send_control(&self, frame: &ClientFrame) -> bool {
        self.control
            .lock()
            .as_ref()
            .map(|c| c.send(frame))
            .unwrap_or(false)
    }

    /// Sender that wraps payloads for `remote` in relay frames
    fn link_sender(&self, tx: mpsc::UnboundedSender<String>, remote: &PeerId) -> LinkSender {
        let to = remote.clone();
        Box::new(move |payload: &str| {
            let frame = ClientFrame::Relay {
                to: to.clone(),
                payload: payload.to_string(),
            };
            frame::encode(&frame)
                .map(|line| tx.send(line).is_ok())
                .unwrap_or(false)
        })
    }

    fn open_link(&self, remote: &PeerId) {
        let Some(tx) = self.control_tx() else {
            return;
        };
        let sender = self.link_sender(tx, remote);
        self.links.establish(remote, sender);
    }

    fn handle_frame(&self, frame: ServerFrame) {
        match frame {
            ServerFrame::LinkRequest { from } => {
                if !self.links.admits(&from) {
                    debug!(peer = %from, "Rejecting link request");
                    self.send_control(&ClientFrame::LinkReject {
                        to: from,
                        reason: "not shared with".to_string(),
                    });
                    return;
                }
                if self.links.state(&from) == LinkState::Open {
                    // Remote lost its side of the link; start over so both ends see a fresh open
                    self.links.close(&from);
                }
                self.send_control(&ClientFrame::LinkAccept { to: from.clone() });
                self.open_link(&from);
            }
            ServerFrame::LinkAccepted { from } => {
                if self.links.state(&from) == LinkState::Connecting {
                    self.open_link(&from);
                } else {
                    debug!(peer = %from, "Ignoring unsolicited link acceptance");
                }
            }
            ServerFrame::LinkRefused { peer, reason } => {
                self.links.refuse(
                    &peer,
                    TransportError::LinkRefused {
                        peer: peer.to_string(),
                        reason,
                    },
                );
            }
            ServerFrame::Relay { from, payload } => self.links.deliver(&from, payload),
            ServerFrame::LinkClosed { from } => {
                self.links.close(&from);
            }
            ServerFrame::PeerGone { peer_id } => {
                self.links.refuse(
                    &peer_id,
                    TransportError::LinkRefused {
                        peer: peer_id.to_string(),
                        reason: "peer went offline".to_string(),
                    },
                );
                self.links.close(&peer_id);
            }
            ServerFrame::Replaced => {
                warn!(peer = %self.local_id, "Identity registered by another session");
            }
            ServerFrame::Registered { .. } | ServerFrame::PeerAddress { .. } => {
                debug!("Ignoring control frame");
            }
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
            warn!(peer = %self.local_id, "Relay session lost");
            control.shutdown();
            self.links.close_all();
            self.links.notify_session_lost();
        }
    }
}

async fn run_control(inner: Arc<RelayInner>, generation: u64, mut reader: FrameReader) {
    loop {
        match frame::read_frame::<ServerFrame>(&mut reader).await {
            Ok(Some(frame)) => inner.handle_frame(frame),
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Relay read failed");
                break;
            }
        }
    }
    inner.control_lost(generation);
}

#[async_trait]
impl Transport for RelayTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Relay
    }

    fn local_id(&self) -> &PeerId {
        &self.inner.local_id
    }

    async fn initialize(&self, server_addr: &str) -> Result<(), TransportError> {
        let register = ClientFrame::Register {
            peer_id: self.inner.local_id.clone(),
            direct_addr: None,
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
            self.inner.links.close_all();
        }

        info!(peer = %self.inner.local_id, server = %server_addr, "Relay transport ready");
        Ok(())
    }

    async fn connect(&self, remote: &PeerId) -> Result<(), TransportError> {
        if self.inner.control_tx().is_none() {
            return Err(TransportError::NotInitialized);
        }
        let Some(rx) = self.inner.links.begin_connect(remote) else {
            debug!(peer = %remote, "Link already connecting or open");
            return Ok(());
        };

        if !self
            .inner
            .send_control(&ClientFrame::LinkRequest { to: remote.clone() })
        {
            self.inner.links.abandon(remote);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(self.inner.config.link_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.inner.links.abandon(remote);
                if self.inner.links.state(remote) == LinkState::Open {
                    return Ok(());
                }
                self.inner
                    .send_control(&ClientFrame::LinkClose { to: remote.clone() });
                Err(TransportError::LinkTimeout(remote.to_string()))
            }
        }
    }

    fn broadcast(&self, payload: &str) -> Result<usize, TransportError> {
        if !self.is_initialized() {
            return Err(TransportError::NotInitialized);
        }
        let sent = self.inner.links.broadcast(payload);
        if sent == 0 {
            debug!("Broadcast with no open links");
        }
        Ok(sent)
    }

    fn send_to(&self, remote: &PeerId, payload: &str) -> bool {
        self.is_initialized() && self.inner.links.send(remote, payload)
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
        if self.inner.links.close(remote) {
            self.inner
                .send_control(&ClientFrame::LinkClose { to: remote.clone() });
        }
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let control = self
            .inner
            .control
            .lock()
            .take()
            .ok_or(TransportError::NotInitialized)?;
        control.shutdown();
        self.inner.links.clear();
        info!(peer = %self.inner.local_id, "Relay transport disconnected");
        Ok(())
    }

    fn open_links(&self) -> Vec<PeerId> {
        self.inner.links.open_peers()
    }

    fn is_initialized(&self) -> bool {
        self.inner.control.lock().is_some()
    }
}
