//! Control-plane frames
//!
//! All sockets (client ↔ rendezvous, peer ↔ peer) carry newline-delimited JSON,
//! one frame per line, tagged by `type`:
//!
//! ```text
//! {"type":"register","peerId":"memo-aaa","directAddr":"127.0.0.1:50123"}
//! {"type":"linkRequest","from":"memo-aaa"}
//! {"type":"data","payload":"{\"protocolVersion\":1,...}"}
//! ```
//!
//! Sync payloads are opaque strings at this layer.

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::types::PeerId;

/// Longest accepted line (1 MiB)
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub type FrameReader = FramedRead<OwnedReadHalf, LinesCodec>;
pub type FrameWriter = FramedWrite<OwnedWriteHalf, LinesCodec>;

/// Frames a peer sends to the rendezvous server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientFrame {
    /// Claim an identity; must be the first frame of a session
    Register {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        /// Listening address for direct links, if any
        #[serde(rename = "directAddr", default, skip_serializing_if = "Option::is_none")]
        direct_addr: Option<String>,
    },
    /// Ask for a peer's direct address
    Lookup {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// Ask `to` to open a relayed link
    LinkRequest { to: PeerId },
    /// Accept a relayed link request from `to`
    LinkAccept { to: PeerId },
    /// Reject a relayed link request from `to`
    LinkReject { to: PeerId, reason: String },
    /// Forward a payload over a relayed link
    Relay { to: PeerId, payload: String },
    /// Tear down a relayed link
    LinkClose { to: PeerId },
}

/// Frames the rendezvous server sends to a peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    Registered {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// Another session registered the same identity; this one is closing
    Replaced,
    PeerAddress {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        addr: Option<String>,
    },
    LinkRequest { from: PeerId },
    LinkAccepted { from: PeerId },
    LinkRefused { peer: PeerId, reason: String },
    Relay { from: PeerId, payload: String },
    LinkClosed { from: PeerId },
    /// A registered identity disconnected
    PeerGone {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
}

/// Frames exchanged on a direct peer socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PeerFrame {
    /// Dialer introduces itself
    Hello {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// Listener accepts and confirms its identity
    Welcome {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// Listener declines the link
    Refuse { reason: String },
    /// A sync payload
    Data { payload: String },
}

/// Split a socket into framed halves
pub fn split(stream: TcpStream) -> (FrameReader, FrameWriter) {
    let (read, write) = stream.into_split();
    (
        FramedRead::new(read, LinesCodec::new_with_max_length(MAX_FRAME_LEN)),
        FramedWrite::new(write, LinesCodec::new_with_max_length(MAX_FRAME_LEN)),
    )
}

fn codec_error(err: LinesCodecError) -> TransportError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            TransportError::Io(format!("frame longer than {} bytes", MAX_FRAME_LEN))
        }
        LinesCodecError::Io(e) => e.into(),
    }
}

/// Encode a frame as one line (without the trailing newline)
pub fn encode<T: Serialize>(frame: &T) -> Result<String, TransportError> {
    serde_json::to_string(frame).map_err(|e| TransportError::Io(format!("encode frame: {}", e)))
}

/// Write one frame and flush
pub async fn write_frame<T: Serialize>(
    writer: &mut FrameWriter,
    frame: &T,
) -> Result<(), TransportError> {
    writer.send(encode(frame)?).await.map_err(codec_error)
}

/// Read the next well-formed frame; `None` at end of stream
///
/// Lines that do not parse as `T` are logged and skipped.
pub async fn read_frame<T: DeserializeOwned>(
    reader: &mut FrameReader,
) -> Result<Option<T>, TransportError> {
    while let Some(line) = reader.next().await {
        let line = line.map_err(codec_error)?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(frame) => return Ok(Some(frame)),
            Err(e) => warn!(error = %e, "Skipping malformed frame"),
        }
    }
    Ok(None)
}

/// Drain pre-encoded lines into `writer` until every sender is dropped or the socket fails
pub fn spawn_writer(mut writer: FrameWriter, mut rx: mpsc::UnboundedReceiver<String>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = writer.send(line).await {
                debug!(error = %e, "Frame writer stopped");
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_client_frame_json_shape() {
        let frame = ClientFrame::Register {
            peer_id: "memo-aaa".into(),
            direct_addr: None,
        };
        assert_eq!(
            encode(&frame).unwrap(),
            r#"{"type":"register","peerId":"memo-aaa"}"#
        );

        let frame = ClientFrame::LinkRequest { to: "memo-bbb".into() };
        assert_eq!(
            encode(&frame).unwrap(),
            r#"{"type":"linkRequest","to":"memo-bbb"}"#
        );
    }

    #[test]
    fn test_server_unit_variant() {
        assert_eq!(encode(&ServerFrame::Replaced).unwrap(), r#"{"type":"replaced"}"#);
        let back: ServerFrame = serde_json::from_str(r#"{"type":"replaced"}"#).unwrap();
        assert_eq!(back, ServerFrame::Replaced);
    }

    #[tokio::test]
    async fn test_read_skips_garbage_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (_reader, mut writer) = split(stream);
            writer.send("garbage".to_string()).await.unwrap();
            write_frame(&mut writer, &PeerFrame::Data { payload: "x".into() })
                .await
                .unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (mut reader, _writer) = split(stream);
        let frame: Option<PeerFrame> = read_frame(&mut reader).await.unwrap();
        assert_eq!(frame, Some(PeerFrame::Data { payload: "x".into() }));
        client.await.unwrap();
        assert_eq!(read_frame::<PeerFrame>(&mut reader).await.unwrap(), None);
    }
}
