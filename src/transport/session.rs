//! Per-connection session.
//!
//! A [`Session`] is an explicit state machine, `Connecting -> Open -> Closed`,
//! whose transitions are plain method calls. [`run`] drives it from any
//! stream of WebSocket frames, so the protocol logic does not depend on how
//! the frames are produced.
//!
//! Outbound frames go through an unbounded queue drained by a separate
//! writer task (see [`spawn_writer`]). Replies are queued synchronously while
//! the triggering frame is handled, which keeps them in inbound order.

use std::fmt;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tungstenite::protocol::frame::Utf8Bytes;
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::{CloseFrame, Message as WsMessage};

use crate::config::MalformedPolicy;
use crate::registry::engine::lock;
use crate::registry::{SessionEntry, SessionId, SharedRegistry};
use crate::transport::message::{Event, decode_count};
use crate::utils::error::SessionError;

/// Close code reported when the peer sent a close frame without a status.
const NO_STATUS_RECEIVED: u16 = 1005;

/// How long a closed session waits for its writer to flush queued frames.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

impl SessionState {
    fn name(self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closed => "closed",
        }
    }
}

/// Why a session reached the closed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer completed the closing handshake.
    Clean { code: u16, reason: String },
    /// The stream ended without a close frame.
    Dropped,
    /// Reading from or writing to the transport failed.
    Error(String),
    /// The server is shutting down.
    Shutdown,
    /// A payload failed to decode and the policy is to close.
    Malformed(String),
}

impl CloseReason {
    pub fn is_clean(&self) -> bool {
        matches!(self, CloseReason::Clean { .. })
    }

    /// The close frame the server sends when it is the side ending the
    /// connection.
    fn close_frame(&self) -> Option<CloseFrame> {
        match self {
            CloseReason::Shutdown => Some(CloseFrame {
                code: CloseCode::Away,
                reason: Utf8Bytes::from_static("server shutting down"),
            }),
            CloseReason::Malformed(_) => Some(CloseFrame {
                code: CloseCode::Invalid,
                reason: Utf8Bytes::from_static("malformed event"),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Clean { code, reason } if reason.is_empty() => {
                write!(f, "closed by peer ({code})")
            }
            CloseReason::Clean { code, reason } => write!(f, "closed by peer ({code}): {reason}"),
            CloseReason::Dropped => f.write_str("connection dropped"),
            CloseReason::Error(err) => write!(f, "transport error: {err}"),
            CloseReason::Shutdown => f.write_str("server shutdown"),
            CloseReason::Malformed(err) => write!(f, "malformed payload: {err}"),
        }
    }
}

/// Server-side state of one WebSocket connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    peer: String,
    state: SessionState,
    /// Transport handle; `None` once the session has released it.
    outbound: Option<UnboundedSender<WsMessage>>,
    registry: SharedRegistry,
    policy: MalformedPolicy,
    /// Close frame received from the peer, applied when the stream ends.
    peer_close: Option<CloseReason>,
}

impl Session {
    /// Creates a session for a connection whose handshake has completed but
    /// which has not been opened yet.
    pub fn new(
        peer: impl Into<String>,
        outbound: UnboundedSender<WsMessage>,
        registry: SharedRegistry,
        policy: MalformedPolicy,
    ) -> Self {
        Self {
            id: format!("session-{}", uuid::Uuid::new_v4()),
            peer: peer.into(),
            state: SessionState::Connecting,
            outbound: Some(outbound),
            registry,
            policy,
            peer_close: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Moves to `Open`: registers the session and sends the greeting.
    pub fn open(&mut self) -> Result<(), SessionError> {
        self.expect_state(SessionState::Connecting)?;
        self.state = SessionState::Open;

        lock(&self.registry).add(
            self.id.clone(),
            SessionEntry {
                peer: self.peer.clone(),
                opened_at: chrono::Utc::now().timestamp(),
            },
        );
        info!(session = %self.id, peer = %self.peer, "WebSocket connection open");

        self.notify(0, false)
    }

    /// Handles one inbound frame. Text and binary payloads are echoed with
    /// the same framing; control frames produce no reply.
    pub fn on_frame(&mut self, message: WsMessage) -> Result<(), SessionError> {
        self.expect_state(SessionState::Open)?;

        match message {
            WsMessage::Text(text) => self.echo(text.as_bytes(), false),
            WsMessage::Binary(data) => self.echo(&data, true),
            WsMessage::Close(frame) => {
                let reason = match frame {
                    Some(frame) => CloseReason::Clean {
                        code: u16::from(frame.code),
                        reason: frame.reason.to_string(),
                    },
                    None => CloseReason::Clean {
                        code: NO_STATUS_RECEIVED,
                        reason: String::new(),
                    },
                };
                self.peer_close = Some(reason);
                Ok(())
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(()),
        }
    }

    /// Sends an event carrying `count` and the current time.
    pub fn notify(&mut self, count: u64, binary: bool) -> Result<(), SessionError> {
        self.expect_state(SessionState::Open)?;

        let text = Event::now(count).encode()?;
        let frame = if binary {
            WsMessage::binary(text.into_bytes())
        } else {
            WsMessage::text(text)
        };
        self.send(frame)
    }

    /// Moves to `Closed`. Returns false if the session was already closed,
    /// in which case nothing happens.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        let was_open = self.state == SessionState::Open;
        self.state = SessionState::Closed;

        if was_open {
            lock(&self.registry).remove(&self.id);
        }

        if let Some(frame) = reason.close_frame() {
            // Best effort: the writer may already be gone.
            let _ = self.send(WsMessage::Close(Some(frame)));
        }
        self.outbound = None;
        info!(
            session = %self.id,
            peer = %self.peer,
            clean = reason.is_clean(),
            %reason,
            "WebSocket connection closed"
        );
        true
    }

    /// Handles a frame and applies the malformed-payload policy.
    /// Returns false once the session is closed.
    pub fn dispatch(&mut self, message: WsMessage) -> bool {
        match self.on_frame(message) {
            Ok(()) => true,
            Err(SessionError::Codec(err)) => match self.policy {
                MalformedPolicy::Drop => {
                    warn!(session = %self.id, error = %err, "Dropping malformed message");
                    true
                }
                MalformedPolicy::Close => {
                    warn!(session = %self.id, error = %err, "Closing on malformed message");
                    self.close(CloseReason::Malformed(err.to_string()));
                    false
                }
            },
            Err(err) => {
                self.close(CloseReason::Error(err.to_string()));
                false
            }
        }
    }

    /// The inbound stream ended.
    pub fn end_of_stream(&mut self) {
        let reason = self.peer_close.take().unwrap_or(CloseReason::Dropped);
        self.close(reason);
    }

    /// Reading from the transport failed. A close frame already received
    /// still counts as a clean close.
    pub fn fail(&mut self, err: impl fmt::Display) {
        let reason = self
            .peer_close
            .take()
            .unwrap_or_else(|| CloseReason::Error(err.to_string()));
        self.close(reason);
    }

    fn echo(&mut self, payload: &[u8], binary: bool) -> Result<(), SessionError> {
        let count = decode_count(payload)?;
        self.notify(count, binary)
    }

    fn send(&self, frame: WsMessage) -> Result<(), SessionError> {
        let outbound = self.outbound.as_ref().ok_or(SessionError::TransportClosed)?;
        outbound
            .send(frame)
            .map_err(|_| SessionError::TransportClosed)
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                expected: expected.name(),
                actual: self.state.name(),
            })
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close(CloseReason::Dropped);
    }
}

/// Drives `session` until the connection ends or shutdown is signalled,
/// then waits for `writer` to flush whatever was queued.
pub async fn run<St>(
    mut session: Session,
    mut inbound: St,
    mut writer: JoinHandle<()>,
    mut shutdown: watch::Receiver<bool>,
) where
    St: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    match session.open() {
        Ok(()) => loop {
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => {
                    session.close(CloseReason::Shutdown);
                    break;
                }
                frame = inbound.next() => match frame {
                    Some(Ok(message)) => {
                        if !session.dispatch(message) {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        session.fail(err);
                        break;
                    }
                    None => {
                        session.end_of_stream();
                        break;
                    }
                },
            }
        },
        Err(err) => {
            session.close(CloseReason::Error(err.to_string()));
        }
    }

    let id = session.id().to_string();
    // Releases the outbound queue so the writer stops after draining it.
    drop(session);
    drop(inbound);

    match tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(session = %id, error = %err, "Writer task failed"),
        Err(_) => {
            warn!(session = %id, "Writer did not drain in time, aborting");
            writer.abort();
        }
    }
}

/// Completes once shutdown is signalled or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Spawns the task forwarding queued frames to the socket.
pub fn spawn_writer<S>(
    mut sink: S,
    mut rx: UnboundedReceiver<WsMessage>,
    peer: String,
) -> JoinHandle<()>
where
    S: Sink<WsMessage> + Unpin + Send + 'static,
    S::Error: fmt::Display,
{
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                warn!(peer = %peer, error = %e, "Failed to send message");
                break;
            }
        }
        debug!(peer = %peer, "Send loop closed");
    })
}
