//! The per-room hub.
//!
//! One [`RoomHub`] actor runs per live room. It tracks which connections
//! belong to which participants, fans accepted operations and cursor and
//! presence events out to the rest of the room, enforces the per-participant
//! rate limits, and lazily starts one document actor per edited document.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::auth::{can_edit, Identity};
use crate::config::{Limits, Ttls};
use crate::document::{
    CursorCommand, DocEvent, DocumentActor, DocumentActorHandle, SubmitCommand,
};
use crate::ot::Bundle;
use crate::protocol::{
    DocumentSnapshot, Envelope, ErrorKind, RoomSnapshot, Selection, ServerMessage,
};
use crate::session::SessionHandle;
use crate::store::{StoreError, StoreHandle};
use crate::types::{
    pick_color, Activity, ClientId, ConnectionId, DocumentId, Participant, ParticipantId,
    Position, Presence, PresenceStatus, Role, Room, RoomId, RoomStatus, MAX_ROOM_PARTICIPANTS,
};

/// What a session needs to know after a successful join.
#[derive(Debug, Clone)]
pub struct JoinContext {
    pub participant_id: ParticipantId,
    pub role: Role,
}

pub struct JoinRequest {
    pub connection: ConnectionId,
    pub identity: Identity,
    pub resume_from_version: Option<u64>,
    pub session: SessionHandle,
}

pub enum RoomMessage {
    Join {
        request: JoinRequest,
        response_tx: oneshot::Sender<Result<JoinContext, ErrorKind>>,
    },
    Leave {
        connection: ConnectionId,
    },
    Operation {
        connection: ConnectionId,
        doc_id: DocumentId,
        ops: Bundle,
        base_version: u64,
        client_id: ClientId,
        client_seq: u64,
    },
    CursorUpdate {
        connection: ConnectionId,
        doc_id: DocumentId,
        position: Position,
        selection: Option<Selection>,
        base_version: u64,
    },
    PresenceUpdate {
        connection: ConnectionId,
        status: PresenceStatus,
        activity: Option<Activity>,
    },
    OpenDocument {
        connection: ConnectionId,
        doc_id: DocumentId,
    },
    /// Posted by the cursor coalescing timer.
    FlushCursor {
        participant_id: ParticipantId,
        doc_id: DocumentId,
    },
    /// Posted by the leave-grace timer.
    OfflineDeadline {
        participant_id: ParticipantId,
        generation: u64,
    },
    /// The server-side sweeper marked this presence row offline.
    PresenceSwept {
        presence: Presence,
    },
    /// The room was deleted or expired; drop everyone and stop.
    Shutdown,
}

#[derive(Clone)]
pub struct RoomHubHandle {
    room_id: RoomId,
    tx: mpsc::Sender<RoomMessage>,
}

impl RoomHubHandle {
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    pub async fn join(&self, request: JoinRequest) -> Result<JoinContext, ErrorKind> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(RoomMessage::Join {
                request,
                response_tx,
            })
            .await
            .map_err(|_| ErrorKind::Unavailable)?;
        response_rx.await.map_err(|_| ErrorKind::Unavailable)?
    }

    pub async fn send(&self, message: RoomMessage) -> Result<(), ErrorKind> {
        self.tx
            .send(message)
            .await
            .map_err(|_| ErrorKind::Unavailable)
    }
}

struct Connection {
    session: SessionHandle,
    participant_id: ParticipantId,
    /// Per document, the version already covered by the join snapshot.
    /// Fan-out skips operations at or below this floor so a join racing a
    /// broadcast cannot deliver duplicates.
    floors: HashMap<DocumentId, u64>,
}

struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            tokens: f64::from(capacity),
            capacity: f64::from(capacity),
            refill_per_sec: f64::from(refill_per_sec),
            refilled_at: Instant::now(),
        }
    }

    /// One event per `interval`.
    fn one_per(interval: Duration) -> Self {
        Self {
            tokens: 1.0,
            capacity: 1.0,
            refill_per_sec: 1.0 / interval.as_secs_f64().max(f64::EPSILON),
            refilled_at: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.refilled_at = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

struct CursorSlot {
    sent_at: Instant,
    pending: Option<PendingCursor>,
    flush_scheduled: bool,
}

struct PendingCursor {
    position: Position,
    selection: Option<Selection>,
    base_version: u64,
}

struct ParticipantState {
    participant: Participant,
    connections: usize,
    op_budget: HashMap<DocumentId, TokenBucket>,
    presence_budget: TokenBucket,
    violations: VecDeque<Instant>,
    cursor_slots: HashMap<DocumentId, CursorSlot>,
    /// Bumped whenever a leave-grace timer is armed, so a reconnect
    /// invalidates older deadlines.
    offline_generation: u64,
}

/// Rate-limit violations within this window that close the session.
const VIOLATION_LIMIT: usize = 10;
const VIOLATION_WINDOW: Duration = Duration::from_secs(60);

/// Upper bound on hub-side waits for a document actor response. The actor
/// can itself be waiting to push an event into the hub, so an unbounded
/// wait here could close a cycle.
const ACTOR_CALL_DEADLINE: Duration = Duration::from_secs(5);

async fn with_deadline<T>(
    call: impl std::future::Future<Output = Result<T, ErrorKind>>,
) -> Result<T, ErrorKind> {
    tokio::time::timeout(ACTOR_CALL_DEADLINE, call)
        .await
        .map_err(|_| ErrorKind::Unavailable)?
}

pub struct RoomHub {
    room: Room,
    store: StoreHandle,
    limits: Limits,
    ttls: Ttls,
    connections: HashMap<ConnectionId, Connection>,
    participants: HashMap<ParticipantId, ParticipantState>,
    documents: HashMap<DocumentId, DocumentActorHandle>,
    doc_events_tx: mpsc::Sender<DocEvent>,
    doc_events_rx: mpsc::Receiver<DocEvent>,
    self_tx: mpsc::Sender<RoomMessage>,
    rx: mpsc::Receiver<RoomMessage>,
    idle_since: Instant,
}

impl RoomHub {
    pub fn spawn(room: Room, store: StoreHandle, limits: Limits, ttls: Ttls) -> RoomHubHandle {
        let (tx, rx) = mpsc::channel(256);
        let (doc_events_tx, doc_events_rx) = mpsc::channel(256);
        let handle = RoomHubHandle {
            room_id: room.id.clone(),
            tx: tx.clone(),
        };
        let mut hub = Self {
            room,
            store,
            limits,
            ttls,
            connections: HashMap::new(),
            participants: HashMap::new(),
            documents: HashMap::new(),
            doc_events_tx,
            doc_events_rx,
            self_tx: tx,
            rx,
            idle_since: Instant::now(),
        };
        tokio::spawn(async move { hub.run().await });
        handle
    }

    async fn run(&mut self) {
        info!(room = %self.room.id, "room hub started");
        let mut idle_check = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                message = self.rx.recv() => {
                    let Some(message) = message else { break };
                    if matches!(message, RoomMessage::Shutdown) {
                        self.drop_everyone();
                        break;
                    }
                    self.handle_message(message).await;
                }
                event = self.doc_events_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_doc_event(event).await;
                    }
                }
                _ = idle_check.tick() => {
                    if self.connections.is_empty()
                        && self.idle_since.elapsed() > self.ttls.room_idle
                    {
                        debug!(room = %self.room.id, "room hub idle, shutting down");
                        break;
                    }
                }
            }
        }
        info!(room = %self.room.id, "room hub stopped");
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                request,
                response_tx,
            } => {
                let result = self.handle_join(request).await;
                let _ = response_tx.send(result);
            }
            RoomMessage::Leave { connection } => self.handle_leave(connection).await,
            RoomMessage::Operation {
                connection,
                doc_id,
                ops,
                base_version,
                client_id,
                client_seq,
            } => {
                self.handle_operation(connection, doc_id, ops, base_version, client_id, client_seq)
                    .await;
            }
            RoomMessage::CursorUpdate {
                connection,
                doc_id,
                position,
                selection,
                base_version,
            } => {
                self.handle_cursor_update(connection, doc_id, position, selection, base_version)
                    .await;
            }
            RoomMessage::PresenceUpdate {
                connection,
                status,
                activity,
            } => self.handle_presence_update(connection, status, activity).await,
            RoomMessage::OpenDocument {
                connection,
                doc_id,
            } => self.handle_open_document(connection, doc_id).await,
            RoomMessage::FlushCursor {
                participant_id,
                doc_id,
            } => self.flush_cursor(&participant_id, &doc_id).await,
            RoomMessage::OfflineDeadline {
                participant_id,
                generation,
            } => self.handle_offline_deadline(participant_id, generation).await,
            RoomMessage::PresenceSwept { presence } => {
                self.broadcast(
                    Envelope::new(ServerMessage::PresenceUpdated { presence }),
                    None,
                );
            }
            RoomMessage::Shutdown => unreachable!("handled in the run loop"),
        }
    }

    async fn handle_join(&mut self, request: JoinRequest) -> Result<JoinContext, ErrorKind> {
        if !self.room.accepts_joins() {
            return Err(if self.room.status == RoomStatus::Active {
                ErrorKind::Internal
            } else {
                ErrorKind::PermissionDenied
            });
        }

        let participant = self
            .find_or_create_participant(&request.identity)
            .await?;
        let participant_id = participant.id.clone();
        let role = participant.role;

        // Go online immediately; any pending leave-grace deadline for this
        // participant is invalidated by bumping the generation below.
        let now = OffsetDateTime::now_utc();
        let presence = Presence {
            participant_id: participant_id.clone(),
            room_id: self.room.id.clone(),
            status: PresenceStatus::Online,
            current_document: None,
            activity: Activity::Idle,
            last_activity: now,
        };
        self.store
            .upsert_presence(presence)
            .await
            .map_err(|error| join_store_error(&error))?;

        let (snapshot, floors, replays) = self
            .build_snapshot(&participant_id, request.resume_from_version)
            .await?;

        let newly_joined = !self.participants.contains_key(&participant_id);
        let state = self
            .participants
            .entry(participant_id.clone())
            .or_insert_with(|| ParticipantState {
                participant: participant.clone(),
                connections: 0,
                op_budget: HashMap::new(),
                presence_budget: TokenBucket::one_per(self.limits.presence_interval),
                violations: VecDeque::new(),
                cursor_slots: HashMap::new(),
                offline_generation: 0,
            });
        state.connections += 1;
        state.offline_generation += 1;
        state.participant.presence_status = PresenceStatus::Online;

        request.session.deliver(Envelope::new(ServerMessage::RoomJoined { snapshot }));
        for replay in replays {
            request.session.deliver(replay);
        }

        self.connections.insert(
            request.connection,
            Connection {
                session: request.session,
                participant_id: participant_id.clone(),
                floors,
            },
        );

        if newly_joined {
            self.broadcast(
                Envelope::from_sender(
                    ServerMessage::ParticipantJoined { participant },
                    participant_id.clone(),
                ),
                Some(request.connection),
            );
        }
        debug!(room = %self.room.id, %participant_id, "participant joined");

        Ok(JoinContext {
            participant_id,
            role,
        })
    }

    async fn find_or_create_participant(
        &mut self,
        identity: &Identity,
    ) -> Result<Participant, ErrorKind> {
        if let Some(existing) = self
            .store
            .participant(&self.room.id, &identity.user_id)
            .await
            .map_err(|error| join_store_error(&error))?
        {
            return Ok(existing);
        }

        let existing_count = self
            .store
            .participants(&self.room.id)
            .await
            .map_err(|error| join_store_error(&error))?
            .len();
        let capacity = self.room.max_participants.min(MAX_ROOM_PARTICIPANTS);
        if existing_count >= capacity {
            return Err(ErrorKind::PermissionDenied);
        }

        let now = OffsetDateTime::now_utc();
        let participant = Participant {
            id: ParticipantId::generate(),
            room_id: self.room.id.clone(),
            user_id: identity.user_id.clone(),
            role: if identity.user_id == self.room.owner_id {
                Role::Owner
            } else {
                Role::Editor
            },
            display_name: identity.display_name.clone(),
            color: pick_color(),
            avatar_url: identity.avatar_url.clone(),
            presence_status: PresenceStatus::Online,
            last_seen: now,
            joined_at: now,
        };
        self.store
            .upsert_participant(participant.clone())
            .await
            .map_err(|error| join_store_error(&error))?;
        Ok(participant)
    }

    /// Assembles the join snapshot. Returns the per-document version floors
    /// for the new connection and, when resuming within `MAX_LAG`, the
    /// operation replay to enqueue right after `room-joined`.
    async fn build_snapshot(
        &mut self,
        joining: &ParticipantId,
        resume_from_version: Option<u64>,
    ) -> Result<(RoomSnapshot, HashMap<DocumentId, u64>, Vec<Envelope<ServerMessage>>), ErrorKind>
    {
        let participants = self
            .store
            .participants(&self.room.id)
            .await
            .map_err(|error| join_store_error(&error))?;
        let mut documents = self
            .store
            .documents(&self.room.id)
            .await
            .map_err(|error| join_store_error(&error))?;
        // Live actors are ahead of the store row between appends only in
        // memory ordering, never in versions, but prefer them anyway.
        for document in &mut documents {
            if let Some(handle) = self.documents.get(&document.id) {
                if let Ok(fresh) = with_deadline(handle.snapshot()).await {
                    *document = fresh;
                }
            }
        }

        let mut cursors = Vec::new();
        for document in &documents {
            let mut document_cursors = self
                .store
                .cursors(&document.id)
                .await
                .map_err(|error| join_store_error(&error))?;
            cursors.append(&mut document_cursors);
        }
        let presence = self
            .store
            .presence_in_room(&self.room.id)
            .await
            .map_err(|error| join_store_error(&error))?;

        let mut floors = HashMap::new();
        let mut replays = Vec::new();
        let mut snapshots = Vec::new();
        for document in &documents {
            let resumable = resume_from_version.is_some_and(|version| {
                version <= document.version
                    && document.version - version <= self.limits.max_lag
            });
            if resumable {
                let from = resume_from_version.expect("checked by resumable");
                let handle = self.document_handle(&document.id).await?;
                let operations =
                    with_deadline(handle.operations_since(from, self.limits.max_lag as usize))
                        .await?;
                for operation in operations {
                    let new_version = operation.server_sequence;
                    replays.push(Envelope::from_sender(
                        ServerMessage::OperationReceived {
                            doc_id: document.id.clone(),
                            new_version,
                            op: operation,
                        },
                        joining.clone(),
                    ));
                }
                floors.insert(document.id.clone(), document.version);
                snapshots.push(DocumentSnapshot::without_content(document));
            } else {
                floors.insert(document.id.clone(), document.version);
                snapshots.push(DocumentSnapshot::full(document));
            }
        }

        Ok((
            RoomSnapshot {
                room: self.room.clone(),
                participant_id: joining.clone(),
                participants,
                documents: snapshots,
                cursors,
                presence,
            },
            floors,
            replays,
        ))
    }

    async fn handle_leave(&mut self, connection: ConnectionId) {
        let Some(removed) = self.connections.remove(&connection) else {
            return;
        };
        if self.connections.is_empty() {
            self.idle_since = Instant::now();
        }
        let participant_id = removed.participant_id;
        let Some(state) = self.participants.get_mut(&participant_id) else {
            return;
        };
        state.connections = state.connections.saturating_sub(1);
        if state.connections > 0 {
            return;
        }
        // Last connection for this participant: give it a grace period to
        // reconnect before declaring it gone.
        state.offline_generation += 1;
        let generation = state.offline_generation;
        let grace = self.ttls.leave_grace;
        let self_tx = self.self_tx.clone();
        let participant_id_clone = participant_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = self_tx
                .send(RoomMessage::OfflineDeadline {
                    participant_id: participant_id_clone,
                    generation,
                })
                .await;
        });
    }

    async fn handle_offline_deadline(&mut self, participant_id: ParticipantId, generation: u64) {
        let Some(state) = self.participants.get_mut(&participant_id) else {
            return;
        };
        if state.connections > 0 || state.offline_generation != generation {
            // A newer connection or deadline took over in the meantime.
            return;
        }
        let now = OffsetDateTime::now_utc();
        let presence = Presence {
            participant_id: participant_id.clone(),
            room_id: self.room.id.clone(),
            status: PresenceStatus::Offline,
            current_document: None,
            activity: Activity::Idle,
            last_activity: now,
        };
        if let Err(error) = self.store.upsert_presence(presence).await {
            warn!(room = %self.room.id, %error, "failed to persist offline presence");
        }
        self.participants.remove(&participant_id);
        self.broadcast(
            Envelope::new(ServerMessage::ParticipantLeft {
                participant_id: participant_id.clone(),
            }),
            None,
        );
        debug!(room = %self.room.id, %participant_id, "participant left");
    }

    async fn handle_operation(
        &mut self,
        connection: ConnectionId,
        doc_id: DocumentId,
        ops: Bundle,
        base_version: u64,
        client_id: ClientId,
        client_seq: u64,
    ) {
        let Some(conn) = self.connections.get(&connection) else {
            return;
        };
        let participant_id = conn.participant_id.clone();
        let Some(state) = self.participants.get_mut(&participant_id) else {
            return;
        };

        if !can_edit(state.participant.role) {
            self.report(connection, &ErrorKind::ReadOnly);
            return;
        }

        let bucket = state.op_budget.entry(doc_id.clone()).or_insert_with(|| {
            TokenBucket::new(self.limits.operation_burst, self.limits.operations_per_second)
        });
        if !bucket.try_take() {
            self.record_violation(connection, &participant_id);
            self.report(connection, &ErrorKind::RateLimited);
            return;
        }

        let handle = match self.document_handle(&doc_id).await {
            Ok(handle) => handle,
            Err(error) => {
                self.report(connection, &error);
                return;
            }
        };
        let command = SubmitCommand {
            submitter: connection,
            participant_id,
            bundle: ops,
            base_version,
            client_id,
            client_seq,
        };
        if let Err(error) = handle.try_submit(command) {
            self.report(connection, &error);
        }
    }

    async fn handle_doc_event(&mut self, event: DocEvent) {
        match event {
            DocEvent::Accepted {
                submitter,
                operation,
                new_version,
                transformed: _,
            } => {
                let doc_id = operation.document_id.clone();
                let sender = operation.participant_id.clone();
                let envelope = Envelope::from_sender(
                    ServerMessage::OperationReceived {
                        doc_id: doc_id.clone(),
                        op: operation,
                        new_version,
                    },
                    sender,
                );
                // Ack first: the submitter sees its own operation before any
                // peer is served.
                if let Some(conn) = self.connections.get(&submitter) {
                    conn.session.deliver(envelope.clone());
                }
                for (id, conn) in &self.connections {
                    if *id == submitter {
                        continue;
                    }
                    if conn
                        .floors
                        .get(&doc_id)
                        .is_some_and(|floor| new_version <= *floor)
                    {
                        continue;
                    }
                    conn.session.deliver(envelope.clone());
                }
            }
            DocEvent::Duplicate {
                submitter,
                operation,
                version,
            } => {
                let doc_id = operation.document_id.clone();
                let sender = operation.participant_id.clone();
                if let Some(conn) = self.connections.get(&submitter) {
                    conn.session.deliver(Envelope::from_sender(
                        ServerMessage::OperationReceived {
                            doc_id,
                            op: operation,
                            new_version: version,
                        },
                        sender,
                    ));
                }
            }
            DocEvent::Rejected {
                submitter,
                document_id,
                error,
                current_version,
            } => {
                self.report(submitter, &error);
                if error == ErrorKind::SyncRequired {
                    if let Some(conn) = self.connections.get(&submitter) {
                        conn.session.deliver(Envelope::new(ServerMessage::SyncRequest {
                            doc_id: document_id,
                            from: current_version,
                        }));
                    }
                }
            }
        }
    }

    async fn handle_cursor_update(
        &mut self,
        connection: ConnectionId,
        doc_id: DocumentId,
        position: Position,
        selection: Option<Selection>,
        base_version: u64,
    ) {
        let Some(conn) = self.connections.get(&connection) else {
            return;
        };
        let participant_id = conn.participant_id.clone();
        let Some(state) = self.participants.get_mut(&participant_id) else {
            return;
        };

        let interval = self.limits.cursor_interval;
        let slot = state
            .cursor_slots
            .entry(doc_id.clone())
            .or_insert_with(|| CursorSlot {
                sent_at: Instant::now() - interval,
                pending: None,
                flush_scheduled: false,
            });
        let pending = PendingCursor {
            position,
            selection,
            base_version,
        };
        if slot.sent_at.elapsed() < interval {
            // Coalesce: keep only the newest update, flush when the
            // interval expires.
            slot.pending = Some(pending);
            if !slot.flush_scheduled {
                slot.flush_scheduled = true;
                let delay = interval.saturating_sub(slot.sent_at.elapsed());
                let self_tx = self.self_tx.clone();
                let participant_id = participant_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = self_tx
                        .send(RoomMessage::FlushCursor {
                            participant_id,
                            doc_id,
                        })
                        .await;
                });
            }
            return;
        }
        slot.sent_at = Instant::now();
        self.apply_cursor(&participant_id, &doc_id, pending).await;
    }

    async fn flush_cursor(&mut self, participant_id: &ParticipantId, doc_id: &DocumentId) {
        let Some(state) = self.participants.get_mut(participant_id) else {
            return;
        };
        let Some(slot) = state.cursor_slots.get_mut(doc_id) else {
            return;
        };
        slot.flush_scheduled = false;
        let Some(pending) = slot.pending.take() else {
            return;
        };
        slot.sent_at = Instant::now();
        self.apply_cursor(participant_id, doc_id, pending).await;
    }

    async fn apply_cursor(
        &mut self,
        participant_id: &ParticipantId,
        doc_id: &DocumentId,
        pending: PendingCursor,
    ) {
        let handle = match self.document_handle(doc_id).await {
            Ok(handle) => handle,
            Err(error) => {
                debug!(room = %self.room.id, %error, "dropping cursor update");
                return;
            }
        };
        let cursor = match with_deadline(handle.sync_cursor(CursorCommand {
            participant_id: participant_id.clone(),
            position: pending.position,
            selection: pending.selection.map(|s| (s.start, s.end)),
            base_version: pending.base_version,
        }))
        .await
        {
            Ok(cursor) => cursor,
            Err(error) => {
                debug!(room = %self.room.id, %error, "dropping cursor update");
                return;
            }
        };
        if let Err(error) = self.store.upsert_cursor(cursor.clone()).await {
            warn!(room = %self.room.id, %error, "failed to persist cursor");
        }
        let sender_connection = self.connection_of(participant_id);
        self.broadcast(
            Envelope::from_sender(
                ServerMessage::CursorUpdated {
                    doc_id: doc_id.clone(),
                    cursor,
                },
                participant_id.clone(),
            ),
            sender_connection,
        );
    }

    async fn handle_presence_update(
        &mut self,
        connection: ConnectionId,
        status: PresenceStatus,
        activity: Option<Activity>,
    ) {
        let Some(conn) = self.connections.get(&connection) else {
            return;
        };
        let participant_id = conn.participant_id.clone();
        let Some(state) = self.participants.get_mut(&participant_id) else {
            return;
        };
        if !state.presence_budget.try_take() {
            self.record_violation(connection, &participant_id);
            self.report(connection, &ErrorKind::RateLimited);
            return;
        }
        let presence = Presence {
            participant_id: participant_id.clone(),
            room_id: self.room.id.clone(),
            status,
            current_document: None,
            activity: activity.unwrap_or(Activity::Idle),
            last_activity: OffsetDateTime::now_utc(),
        };
        if let Err(error) = self.store.upsert_presence(presence.clone()).await {
            warn!(room = %self.room.id, %error, "failed to persist presence");
            self.report(connection, &ErrorKind::Unavailable);
            return;
        }
        self.broadcast(
            Envelope::from_sender(
                ServerMessage::PresenceUpdated { presence },
                participant_id,
            ),
            Some(connection),
        );
    }

    async fn handle_open_document(&mut self, connection: ConnectionId, doc_id: DocumentId) {
        let Some(conn) = self.connections.get(&connection) else {
            return;
        };
        let participant_id = conn.participant_id.clone();
        let now = OffsetDateTime::now_utc();
        let presence = Presence {
            participant_id: participant_id.clone(),
            room_id: self.room.id.clone(),
            status: PresenceStatus::Online,
            current_document: Some(doc_id),
            activity: Activity::Viewing,
            last_activity: now,
        };
        if let Err(error) = self.store.upsert_presence(presence.clone()).await {
            warn!(room = %self.room.id, %error, "failed to persist presence");
            return;
        }
        self.broadcast(
            Envelope::from_sender(
                ServerMessage::PresenceUpdated { presence },
                participant_id,
            ),
            Some(connection),
        );
    }

    /// Looks up the live document actor, starting (or restarting) it from
    /// the stored document when needed.
    async fn document_handle(
        &mut self,
        doc_id: &DocumentId,
    ) -> Result<DocumentActorHandle, ErrorKind> {
        if let Some(handle) = self.documents.get(doc_id) {
            if handle.is_alive() {
                return Ok(handle.clone());
            }
            warn!(room = %self.room.id, document = %doc_id, "restarting document actor");
            self.documents.remove(doc_id);
        }
        let document = self.store.document(doc_id).await.map_err(|error| match error {
            StoreError::NotFound(what) => ErrorKind::NotFound(what),
            _ => ErrorKind::Unavailable,
        })?;
        if document.room_id != self.room.id {
            return Err(ErrorKind::NotFound("document"));
        }
        let handle = DocumentActor::spawn(
            document,
            self.store.clone(),
            self.limits.clone(),
            self.doc_events_tx.clone(),
        );
        self.documents.insert(doc_id.clone(), handle.clone());
        Ok(handle)
    }

    fn record_violation(&mut self, connection: ConnectionId, participant_id: &ParticipantId) {
        let Some(state) = self.participants.get_mut(participant_id) else {
            return;
        };
        let now = Instant::now();
        state.violations.push_back(now);
        while state
            .violations
            .front()
            .is_some_and(|at| now.duration_since(*at) > VIOLATION_WINDOW)
        {
            state.violations.pop_front();
        }
        if state.violations.len() >= VIOLATION_LIMIT {
            warn!(
                room = %self.room.id,
                %participant_id, "closing session after repeated rate-limit violations"
            );
            if let Some(conn) = self.connections.get(&connection) {
                conn.session.close();
            }
        }
    }

    fn report(&self, connection: ConnectionId, error: &ErrorKind) {
        if let Some(conn) = self.connections.get(&connection) {
            conn.session.deliver(Envelope::new(ServerMessage::error(error)));
        }
    }

    fn connection_of(&self, participant_id: &ParticipantId) -> Option<ConnectionId> {
        self.connections
            .iter()
            .find(|(_, conn)| &conn.participant_id == participant_id)
            .map(|(id, _)| *id)
    }

    fn broadcast(&self, envelope: Envelope<ServerMessage>, except: Option<ConnectionId>) {
        for (id, conn) in &self.connections {
            if Some(*id) == except {
                continue;
            }
            conn.session.deliver(envelope.clone());
        }
    }

    fn drop_everyone(&mut self) {
        for conn in self.connections.values() {
            conn.session.close();
        }
        self.connections.clear();
        self.participants.clear();
        self.documents.clear();
    }
}

fn join_store_error(error: &StoreError) -> ErrorKind {
    match error {
        StoreError::NotFound(what) => ErrorKind::NotFound(what),
        _ => ErrorKind::Unavailable,
    }
}

/// Convenience for the server and tests: spawn a hub for the stored room.
pub async fn start_hub(
    room_id: &RoomId,
    store: &StoreHandle,
    limits: &Limits,
    ttls: &Ttls,
) -> Result<RoomHubHandle, ErrorKind> {
    let room = store.room(room_id).await.map_err(|error| join_store_error(&error))?;
    Ok(RoomHub::spawn(
        room,
        store.clone(),
        limits.clone(),
        ttls.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::factories::{insert, padded};
    use crate::session::SessionHandle;
    use crate::store::{MemoryStore, Store, STORE_DEADLINE};
    use crate::types::factories::{document, room};
    use crate::types::UserId;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    struct TestClient {
        connection: ConnectionId,
        // Kept so the hub-side handle is not the only one alive.
        _handle: SessionHandle,
        inbox: mpsc::Receiver<Envelope<ServerMessage>>,
        context: JoinContext,
    }

    impl TestClient {
        async fn join(
            hub: &RoomHubHandle,
            connection: u64,
            user: &str,
        ) -> Result<Self, ErrorKind> {
            let connection = ConnectionId(connection);
            let (handle, inbox) = SessionHandle::for_tests(connection);
            let context = hub
                .join(JoinRequest {
                    connection,
                    identity: Identity {
                        user_id: UserId::new(user),
                        display_name: user.to_string(),
                        avatar_url: None,
                    },
                    resume_from_version: None,
                    session: handle.clone(),
                })
                .await?;
            Ok(Self {
                connection,
                _handle: handle,
                inbox,
                context,
            })
        }

        async fn recv(&mut self) -> ServerMessage {
            tokio::time::timeout(Duration::from_secs(2), self.inbox.recv())
                .await
                .expect("timed out waiting for a message")
                .expect("session channel closed")
                .message
        }

        async fn expect_snapshot(&mut self) -> RoomSnapshot {
            match self.recv().await {
                ServerMessage::RoomJoined { snapshot } => snapshot,
                other => panic!("expected room-joined, got {other:?}"),
            }
        }

        async fn expect_operation(&mut self) -> (DocumentId, u64) {
            match self.recv().await {
                ServerMessage::OperationReceived {
                    doc_id, new_version, ..
                } => (doc_id, new_version),
                other => panic!("expected operation-received, got {other:?}"),
            }
        }

        async fn expect_error(&mut self) -> String {
            match self.recv().await {
                ServerMessage::Error { code, .. } => code,
                other => panic!("expected error, got {other:?}"),
            }
        }
    }

    struct Harness {
        store: StoreHandle,
        hub: RoomHubHandle,
        doc_id: DocumentId,
    }

    async fn harness(content: &str, limits: Limits) -> Harness {
        let memory: Arc<dyn Store> = MemoryStore::shared();
        let store = StoreHandle::new(memory, STORE_DEADLINE);
        store.create_room(room("r1", "alice")).await.unwrap();
        let doc = document("r1", "main.rs", content);
        store.create_document(doc.clone()).await.unwrap();
        let hub = start_hub(&RoomId::new("r1"), &store, &limits, &Ttls::default())
            .await
            .unwrap();
        Harness {
            store,
            hub,
            doc_id: doc.id,
        }
    }

    fn operation_message(
        client: &TestClient,
        doc_id: &DocumentId,
        ops: Bundle,
        base_version: u64,
        client_seq: u64,
    ) -> RoomMessage {
        RoomMessage::Operation {
            connection: client.connection,
            doc_id: doc_id.clone(),
            ops,
            base_version,
            client_id: ClientId::new(format!("client-{}", client.connection)),
            client_seq,
        }
    }

    #[tokio::test]
    async fn join_delivers_a_full_snapshot() {
        let hx = harness("fn main() {}\n", Limits::default()).await;
        let mut alice = TestClient::join(&hx.hub, 1, "alice").await.unwrap();
        let snapshot = alice.expect_snapshot().await;
        assert_eq!(snapshot.room.id, RoomId::new("r1"));
        assert_eq!(snapshot.documents.len(), 1);
        assert_eq!(
            snapshot.documents[0].content.as_deref(),
            Some("fn main() {}\n")
        );
        // The room owner's record got the owner role.
        assert_eq!(alice.context.role, Role::Owner);
    }

    #[tokio::test]
    async fn viewers_cannot_submit_operations() {
        let hx = harness("AB", Limits::default()).await;
        // Seed a viewer participant record before the user connects.
        let mut viewer = crate::types::factories::participant("r1", "watcher", Role::Viewer);
        viewer.id = ParticipantId::new("p-viewer");
        hx.store.upsert_participant(viewer).await.unwrap();

        let mut watcher = TestClient::join(&hx.hub, 1, "watcher").await.unwrap();
        watcher.expect_snapshot().await;
        assert_eq!(watcher.context.role, Role::Viewer);

        hx.hub
            .send(operation_message(
                &watcher,
                &hx.doc_id,
                padded(insert(0, "nope"), 2),
                0,
                1,
            ))
            .await
            .unwrap();
        assert_eq!(watcher.expect_error().await, "READ_ONLY");
        // Nothing was accepted.
        assert_eq!(
            hx.store
                .operations_since(&hx.doc_id, 0, 10)
                .await
                .unwrap(),
            vec![]
        );
    }

    #[tokio::test]
    async fn peers_observe_the_same_operation_order() {
        let hx = harness("AB", Limits::default()).await;
        let mut p1 = TestClient::join(&hx.hub, 1, "alice").await.unwrap();
        let mut p2 = TestClient::join(&hx.hub, 2, "bob").await.unwrap();
        let mut p3 = TestClient::join(&hx.hub, 3, "carol").await.unwrap();
        p1.expect_snapshot().await;
        // p1 sees the two later joins.
        assert!(matches!(
            p1.recv().await,
            ServerMessage::ParticipantJoined { .. }
        ));
        assert!(matches!(
            p1.recv().await,
            ServerMessage::ParticipantJoined { .. }
        ));
        p2.expect_snapshot().await;
        assert!(matches!(
            p2.recv().await,
            ServerMessage::ParticipantJoined { .. }
        ));
        p3.expect_snapshot().await;

        hx.hub
            .send(operation_message(
                &p1,
                &hx.doc_id,
                padded(insert(1, "X"), 2),
                0,
                1,
            ))
            .await
            .unwrap();
        hx.hub
            .send(operation_message(
                &p2,
                &hx.doc_id,
                padded(insert(1, "Y"), 2),
                0,
                1,
            ))
            .await
            .unwrap();

        let p1_order = [p1.expect_operation().await.1, p1.expect_operation().await.1];
        let p2_order = [p2.expect_operation().await.1, p2.expect_operation().await.1];
        let p3_order = [p3.expect_operation().await.1, p3.expect_operation().await.1];
        assert_eq!(p1_order, [1, 2]);
        assert_eq!(p1_order, p2_order);
        assert_eq!(p1_order, p3_order);

        let document = hx.store.document(&hx.doc_id).await.unwrap();
        assert_eq!(document.version, 2);
        assert_eq!(document.content, "AXYB");
    }

    #[tokio::test]
    async fn operation_floods_are_rate_limited() {
        let limits = Limits {
            operation_burst: 2,
            operations_per_second: 1,
            ..Limits::default()
        };
        let hx = harness("", limits).await;
        let mut alice = TestClient::join(&hx.hub, 1, "alice").await.unwrap();
        alice.expect_snapshot().await;

        for sequence in 1..=2u64 {
            hx.hub
                .send(operation_message(
                    &alice,
                    &hx.doc_id,
                    padded(insert(0, "x"), sequence as usize - 1),
                    sequence - 1,
                    sequence,
                ))
                .await
                .unwrap();
            alice.expect_operation().await;
        }
        hx.hub
            .send(operation_message(
                &alice,
                &hx.doc_id,
                padded(insert(0, "x"), 2),
                2,
                3,
            ))
            .await
            .unwrap();
        assert_eq!(alice.expect_error().await, "RATE_LIMITED");
    }

    #[tokio::test]
    async fn cursor_updates_reach_peers_transformed() {
        let hx = harness("hello", Limits::default()).await;
        let mut alice = TestClient::join(&hx.hub, 1, "alice").await.unwrap();
        let mut bob = TestClient::join(&hx.hub, 2, "bob").await.unwrap();
        alice.expect_snapshot().await;
        assert!(matches!(
            alice.recv().await,
            ServerMessage::ParticipantJoined { .. }
        ));
        bob.expect_snapshot().await;

        hx.hub
            .send(operation_message(
                &alice,
                &hx.doc_id,
                padded(insert(0, ">> "), 5),
                0,
                1,
            ))
            .await
            .unwrap();
        alice.expect_operation().await;
        bob.expect_operation().await;

        // Bob reports a cursor against the version he joined at.
        hx.hub
            .send(RoomMessage::CursorUpdate {
                connection: bob.connection,
                doc_id: hx.doc_id.clone(),
                position: Position { line: 0, column: 2 },
                selection: None,
                base_version: 0,
            })
            .await
            .unwrap();

        match alice.recv().await {
            ServerMessage::CursorUpdated { cursor, .. } => {
                assert_eq!((cursor.line, cursor.column), (0, 5));
            }
            other => panic!("expected cursor-updated, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_submission_triggers_a_sync_request() {
        let limits = Limits {
            max_lag: 1,
            ..Limits::default()
        };
        let hx = harness("", limits).await;
        let mut alice = TestClient::join(&hx.hub, 1, "alice").await.unwrap();
        alice.expect_snapshot().await;

        for sequence in 1..=3u64 {
            hx.hub
                .send(operation_message(
                    &alice,
                    &hx.doc_id,
                    padded(insert(0, "x"), sequence as usize - 1),
                    sequence - 1,
                    sequence,
                ))
                .await
                .unwrap();
            alice.expect_operation().await;
        }

        hx.hub
            .send(operation_message(
                &alice,
                &hx.doc_id,
                padded(insert(0, "y"), 1),
                1,
                4,
            ))
            .await
            .unwrap();
        assert_eq!(alice.expect_error().await, "SYNC_REQUIRED");
        match alice.recv().await {
            ServerMessage::SyncRequest { from, .. } => assert_eq!(from, 3),
            other => panic!("expected sync-request, got {other:?}"),
        }
    }
}
