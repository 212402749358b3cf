//! The per-connection session.
//!
//! One session task per client socket. It authenticates the connection,
//! walks the `connected → authenticated → in-room → closed` state machine,
//! parses and validates inbound frames, and drains the bounded outbound
//! queue that the room hub fans events into. A peer that cannot keep up
//! overflows that queue and is disconnected instead of back-pressuring the
//! hub.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthProvider, Identity};
use crate::config::{Limits, Ttls};
use crate::protocol::{ClientMessage, Envelope, ErrorKind, ServerMessage};
use crate::room::{JoinRequest, RoomHubHandle, RoomMessage};
use crate::server::RoomDirectory;
use crate::types::{ConnectionId, Position};

/// Bounded outbound queue per session.
pub const OUTBOUND_QUEUE: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// What the room hub holds per connection: a way to enqueue outbound events
/// and a way to cut the connection loose.
#[derive(Clone)]
pub struct SessionHandle {
    connection: ConnectionId,
    outbound: mpsc::Sender<Envelope<ServerMessage>>,
    cancel: CancellationToken,
    close_reason: Arc<OnceLock<ErrorKind>>,
}

impl SessionHandle {
    fn new(connection: ConnectionId) -> (Self, mpsc::Receiver<Envelope<ServerMessage>>) {
        let (outbound, rx) = mpsc::channel(OUTBOUND_QUEUE);
        (
            Self {
                connection,
                outbound,
                cancel: CancellationToken::new(),
                close_reason: Arc::new(OnceLock::new()),
            },
            rx,
        )
    }

    /// A handle wired to a plain receiver instead of a socket.
    pub fn for_tests(
        connection: ConnectionId,
    ) -> (Self, mpsc::Receiver<Envelope<ServerMessage>>) {
        Self::new(connection)
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Enqueues an event without waiting. Overflow means the peer is too
    /// slow; the session is closed rather than the sender blocked.
    pub fn deliver(&self, envelope: Envelope<ServerMessage>) -> bool {
        match self.outbound.try_send(envelope) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    connection = %self.connection,
                    "outbound queue overflowed, disconnecting slow consumer"
                );
                let _ = self.close_reason.set(ErrorKind::SlowConsumer);
                self.cancel.cancel();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// Everything a session needs from the surrounding server.
#[derive(Clone)]
pub struct SessionContext {
    pub auth: Arc<dyn AuthProvider>,
    pub rooms: RoomDirectory,
    pub limits: Limits,
    pub ttls: Ttls,
}

enum SessionState {
    Connected,
    Authenticated(Identity),
    InRoom {
        identity: Identity,
        hub: RoomHubHandle,
    },
}

/// Drives one client connection to completion.
pub async fn run(stream: TcpStream, context: SessionContext) {
    let connection = ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed));
    let peer = stream
        .peer_addr()
        .map_or_else(|_| "unknown".to_string(), |addr| addr.to_string());
    info!(%connection, %peer, "client connected");

    let codec = LinesCodec::new_with_max_length(context.limits.max_message_bytes);
    let mut framed = Framed::new(stream, codec);
    let (handle, mut outbound_rx) = SessionHandle::new(connection);
    let mut state = SessionState::Connected;
    let mut last_activity = Instant::now();

    loop {
        let idle_deadline = last_activity + context.ttls.session_idle;
        tokio::select! {
            () = handle.cancelled() => {
                if let Some(reason) = handle.close_reason.get() {
                    let frame = encode(&Envelope::new(ServerMessage::error(reason)));
                    let _ = framed.send(frame).await;
                }
                debug!(%connection, "session cancelled");
                break;
            }
            () = tokio::time::sleep_until(idle_deadline) => {
                info!(%connection, "closing idle session");
                break;
            }
            outbound = outbound_rx.recv() => {
                let Some(envelope) = outbound else { break };
                if framed.send(encode(&envelope)).await.is_err() {
                    break;
                }
            }
            frame = framed.next() => {
                let Some(frame) = frame else {
                    debug!(%connection, "client disconnected");
                    break;
                };
                let Ok(line) = frame else {
                    warn!(%connection, "unreadable frame, closing");
                    break;
                };
                last_activity = Instant::now();
                let envelope: Envelope<ClientMessage> = match serde_json::from_str(&line) {
                    Ok(envelope) => envelope,
                    Err(error) => {
                        // Malformed or unknown input is a protocol
                        // violation, not a recoverable error.
                        warn!(%connection, %error, "malformed message, closing");
                        break;
                    }
                };
                match handle_message(envelope.message, &mut state, &handle, &context).await {
                    Flow::Continue => {}
                    Flow::Close => break,
                }
            }
        }
    }

    // Flush whatever was queued before the loop ended, so a final error
    // message still reaches the client.
    while let Ok(envelope) = outbound_rx.try_recv() {
        if framed.send(encode(&envelope)).await.is_err() {
            break;
        }
    }

    if let SessionState::InRoom { hub, .. } = &state {
        let _ = hub.send(RoomMessage::Leave { connection }).await;
    }
    info!(%connection, "session closed");
}

enum Flow {
    Continue,
    Close,
}

async fn handle_message(
    message: ClientMessage,
    state: &mut SessionState,
    handle: &SessionHandle,
    context: &SessionContext,
) -> Flow {
    match message {
        ClientMessage::Ping => {
            handle.deliver(Envelope::new(ServerMessage::Pong));
            Flow::Continue
        }
        ClientMessage::Auth { token } => handle_auth(token, state, handle, context).await,
        ClientMessage::JoinRoom {
            room_id,
            resume_from_version,
        } => handle_join(room_id, resume_from_version, state, handle, context).await,
        ClientMessage::LeaveRoom => {
            if let SessionState::InRoom { hub, identity } = state {
                let identity = identity.clone();
                let _ = hub
                    .send(RoomMessage::Leave {
                        connection: handle.connection(),
                    })
                    .await;
                *state = SessionState::Authenticated(identity);
            }
            Flow::Continue
        }
        ClientMessage::OpenDocument { doc_id } => {
            forward(
                state,
                handle,
                RoomMessage::OpenDocument {
                    connection: handle.connection(),
                    doc_id,
                },
            )
            .await
        }
        ClientMessage::Operation {
            doc_id,
            ops,
            base_version,
            client_id,
            client_seq,
        } => {
            let payload_size = serde_json::to_string(&ops).map_or(usize::MAX, |json| json.len());
            if payload_size > context.limits.max_bundle_bytes {
                handle.deliver(Envelope::new(ServerMessage::error(
                    &ErrorKind::InvalidOperation,
                )));
                return Flow::Continue;
            }
            forward(
                state,
                handle,
                RoomMessage::Operation {
                    connection: handle.connection(),
                    doc_id,
                    ops,
                    base_version,
                    client_id,
                    client_seq,
                },
            )
            .await
        }
        ClientMessage::CursorUpdate {
            doc_id,
            line,
            col,
            selection,
            version,
        } => {
            // Without a reported version the cursor counts as current, so
            // there is nothing to transform it through.
            forward(
                state,
                handle,
                RoomMessage::CursorUpdate {
                    connection: handle.connection(),
                    doc_id,
                    position: Position { line, column: col },
                    selection,
                    base_version: version.unwrap_or(u64::MAX),
                },
            )
            .await
        }
        ClientMessage::PresenceUpdate { status, activity } => {
            forward(
                state,
                handle,
                RoomMessage::PresenceUpdate {
                    connection: handle.connection(),
                    status,
                    activity,
                },
            )
            .await
        }
    }
}

async fn handle_auth(
    token: String,
    state: &mut SessionState,
    handle: &SessionHandle,
    context: &SessionContext,
) -> Flow {
    if !matches!(state, SessionState::Connected) {
        handle.deliver(Envelope::new(ServerMessage::error(
            &ErrorKind::PermissionDenied,
        )));
        return Flow::Continue;
    }
    match context.auth.verify(&token).await {
        Ok(identity) => {
            debug!(user = %identity.user_id, "authenticated");
            *state = SessionState::Authenticated(identity);
            Flow::Continue
        }
        Err(error) => {
            debug!(%error, "rejected token");
            handle.deliver(Envelope::new(ServerMessage::error(&ErrorKind::InvalidToken)));
            Flow::Close
        }
    }
}

async fn handle_join(
    room_id: crate::types::RoomId,
    resume_from_version: Option<u64>,
    state: &mut SessionState,
    handle: &SessionHandle,
    context: &SessionContext,
) -> Flow {
    let SessionState::Authenticated(identity) = state else {
        let error = if matches!(state, SessionState::Connected) {
            ErrorKind::AuthRequired
        } else {
            ErrorKind::PermissionDenied
        };
        handle.deliver(Envelope::new(ServerMessage::error(&error)));
        return Flow::Continue;
    };
    let identity = identity.clone();

    let hub = match context.rooms.hub(&room_id).await {
        Ok(hub) => hub,
        Err(error) => {
            handle.deliver(Envelope::new(ServerMessage::error(&error)));
            return Flow::Continue;
        }
    };
    let request = JoinRequest {
        connection: handle.connection(),
        identity: identity.clone(),
        resume_from_version,
        session: handle.clone(),
    };
    let joined = tokio::time::timeout(context.ttls.join_deadline, hub.join(request)).await;
    match joined {
        Ok(Ok(join_context)) => {
            debug!(
                participant = %join_context.participant_id,
                role = %join_context.role,
                "joined room"
            );
            *state = SessionState::InRoom { identity, hub };
            Flow::Continue
        }
        Ok(Err(error)) => {
            handle.deliver(Envelope::new(ServerMessage::error(&error)));
            Flow::Continue
        }
        Err(_) => {
            handle.deliver(Envelope::new(ServerMessage::error(&ErrorKind::Unavailable)));
            Flow::Continue
        }
    }
}

/// Forwards a room-scoped message, or reports why it cannot be forwarded.
async fn forward(state: &mut SessionState, handle: &SessionHandle, message: RoomMessage) -> Flow {
    match state {
        SessionState::InRoom { hub, .. } => {
            if let Err(error) = hub.send(message).await {
                handle.deliver(Envelope::new(ServerMessage::error(&error)));
            }
        }
        SessionState::Connected => {
            handle.deliver(Envelope::new(ServerMessage::error(&ErrorKind::AuthRequired)));
        }
        SessionState::Authenticated(_) => {
            handle.deliver(Envelope::new(ServerMessage::error(
                &ErrorKind::PermissionDenied,
            )));
        }
    }
    Flow::Continue
}

fn encode(envelope: &Envelope<ServerMessage>) -> String {
    serde_json::to_string(envelope).expect("server messages serialize to JSON")
}
