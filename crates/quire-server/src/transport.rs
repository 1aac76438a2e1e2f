//! TCP transport: one JSON object per line in each direction.
//!
//! A client opens a connection and sends a handshake line naming the
//! notebook it wants:
//!
//! ```text
//! → {"notebookPath": "demo.json"}
//! ← {"update": "notebook.snapshot", "notebook": {...}}
//! ← {"update": "notebook.sessionStatus", "kernelState": "idle", "kernelName": "echo"}
//! → {"action": "cell.execute", "worksheetId": "...", "cellId": "..."}
//! ← {"update": "cell.update", ...}
//! ```
//!
//! Every later inbound line is an action; every outbound line is an update.
//! Lines that fail to decode are logged and skipped, including lines over the
//! length limit and lines that are not UTF-8. Only socket errors end the
//! connection.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Decoder, FramedRead, FramedWrite, LinesCodec, LinesCodecError};

use quire_kernel::{SessionError, SessionManager};
use quire_types::Action;

use crate::constants::HANDSHAKE_TIMEOUT;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection closed before handshake")]
    NoHandshake,

    #[error("no handshake within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("invalid handshake: {0}")]
    BadHandshake(#[from] serde_json::Error),

    #[error("unreadable line: {0}")]
    BadLine(String),

    #[error("line framing error: {0}")]
    Lines(#[from] LinesCodecError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

/// First line a client sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub notebook_path: String,
}

// ============================================================================
// Inbound framing
// ============================================================================

/// One inbound frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Line(String),
    /// A line that was discarded: too long, or not UTF-8.
    Skipped(String),
}

/// [`LinesCodec`] that reports bad lines in-band instead of as stream errors,
/// so the reader keeps going after them.
#[derive(Debug)]
pub struct InboundCodec {
    lines: LinesCodec,
}

impl InboundCodec {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_line_bytes),
        }
    }

    fn frame(
        &self,
        decoded: Result<Option<String>, LinesCodecError>,
    ) -> Result<Option<Inbound>, LinesCodecError> {
        match decoded {
            Ok(line) => Ok(line.map(Inbound::Line)),
            // The codec discards the rest of the line on later calls.
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Inbound::Skipped(format!(
                "line longer than {} bytes",
                self.lines.max_length()
            )))),
            Err(LinesCodecError::Io(e)) if e.kind() == std::io::ErrorKind::InvalidData => {
                Ok(Some(Inbound::Skipped(e.to_string())))
            }
            Err(e) => Err(e),
        }
    }
}

impl Decoder for InboundCodec {
    type Item = Inbound;
    type Error = LinesCodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, LinesCodecError> {
        let decoded = self.lines.decode(src);
        self.frame(decoded)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, LinesCodecError> {
        let decoded = self.lines.decode_eof(src);
        self.frame(decoded)
    }
}

// ============================================================================
// Connections
// ============================================================================

/// Accept connections until the task is cancelled, one task per connection.
pub async fn serve(listener: TcpListener, manager: Arc<SessionManager>, max_line_bytes: usize) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, manager, max_line_bytes).await {
                        tracing::info!(%peer, error = %e, "connection ended with error");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept error");
            }
        }
    }
}

type LineReader = FramedRead<OwnedReadHalf, InboundCodec>;

async fn read_handshake(lines: &mut LineReader) -> Result<Handshake, TransportError> {
    loop {
        match lines.next().await {
            None => return Err(TransportError::NoHandshake),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(Inbound::Skipped(reason))) => return Err(TransportError::BadLine(reason)),
            Some(Ok(Inbound::Line(line))) if line.trim().is_empty() => continue,
            Some(Ok(Inbound::Line(line))) => return Ok(serde_json::from_str(&line)?),
        }
    }
}

/// Serve one client: handshake, attach to the session, then pump lines both
/// ways until either side goes away.
pub async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    manager: Arc<SessionManager>,
    max_line_bytes: usize,
) -> Result<(), TransportError> {
    let (reader, writer) = stream.into_split();
    let mut lines = FramedRead::new(reader, InboundCodec::new(max_line_bytes));
    let mut sink = FramedWrite::new(writer, LinesCodec::new());

    let handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut lines))
        .await
        .map_err(|_| TransportError::HandshakeTimeout(HANDSHAKE_TIMEOUT))??;
    let path = handshake.notebook_path;

    let connected = manager.connect(&path).await?;
    let session = connected.session;
    let connection_id = connected.connection_id;
    let mut updates = connected.updates;
    tracing::info!(%peer, path = %path, connection = %connection_id.short(), "client attached");

    // Outbound: drain the client's update channel onto the socket. Ends when
    // the session drops this client or the socket fails.
    let mut outbound = tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            let line = match serde_json::to_string(&update) {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!(update = update.kind(), error = %e, "failed to encode update");
                    continue;
                }
            };
            if let Err(e) = sink.send(line).await {
                tracing::debug!(error = %e, "write failed");
                break;
            }
        }
    });

    let result = loop {
        tokio::select! {
            _ = &mut outbound => {
                tracing::debug!(%peer, "outbound closed");
                break Ok(());
            }
            line = lines.next() => {
                match line {
                    None => break Ok(()),
                    Some(Err(e)) => break Err(TransportError::from(e)),
                    Some(Ok(Inbound::Skipped(reason))) => {
                        tracing::warn!(%peer, path = %path, %reason, "skipping unreadable line");
                    }
                    Some(Ok(Inbound::Line(line))) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match Action::from_str_json(&line) {
                            Ok(action) => {
                                if let Err(e) = session.submit(action).await {
                                    break Err(e.into());
                                }
                            }
                            Err(e) => {
                                tracing::warn!(%peer, path = %path, error = %e, "skipping undecodable line");
                            }
                        }
                    }
                }
            }
        }
    };

    outbound.abort();
    if let Err(e) = session.disconnect(connection_id).await {
        tracing::debug!(%peer, path = %path, error = %e, "session already stopped");
    }
    tracing::info!(%peer, path = %path, "client detached");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut InboundCodec, input: &[u8]) -> Vec<Inbound> {
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        if let Some(frame) = codec.decode_eof(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_inbound_codec_skips_bad_lines_and_resumes() {
        let mut codec = InboundCodec::new(8);
        let mut input = b"short\n".to_vec();
        input.extend_from_slice(&[b'x'; 20]);
        input.extend_from_slice(b"\n\xff\xfe\nafter\ntail");

        let frames = decode_all(&mut codec, &input);
        assert_eq!(frames.len(), 5, "{frames:?}");
        assert_eq!(frames[0], Inbound::Line("short".into()));
        assert!(matches!(&frames[1], Inbound::Skipped(r) if r.contains("8 bytes")));
        assert!(matches!(frames[2], Inbound::Skipped(_)));
        assert_eq!(frames[3], Inbound::Line("after".into()));
        assert_eq!(frames[4], Inbound::Line("tail".into()));
    }

    #[test]
    fn test_handshake_wire_shape() {
        let hs: Handshake = serde_json::from_str(r#"{"notebookPath":"a/b.json"}"#).unwrap();
        assert_eq!(hs.notebook_path, "a/b.json");
        assert!(serde_json::from_str::<Handshake>(r#"{"path":"a.json"}"#).is_err());
    }
}
