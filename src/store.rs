//! Typed gateway to the persistence layer.
//!
//! [`Store`] is the seam a production backend implements. [`MemoryStore`] is
//! the complete in-process implementation used by tests and by `start` when
//! the configured store URL has the `memory` scheme. [`StoreHandle`] is what
//! the rest of the crate holds: it applies the call deadline and keeps the
//! backend behind one shared handle.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::types::{
    Cursor, Document, DocumentId, Participant, ParticipantId, PersistedOperation, Presence,
    PresenceStatus, Room, RoomId, RoomStatus, UserId,
};

/// Deadline applied to every store call.
pub const STORE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("a document already exists at that path")]
    DocumentExists,
    #[error("server sequence {0} was already taken by another writer")]
    SequenceTaken(u64),
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Content columns of the document row updated together with an append.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentUpdate {
    pub content: String,
    pub version: u64,
    pub size_bytes: usize,
    pub line_count: usize,
    pub last_operation_at: OffsetDateTime,
}

/// Result of [`Store::append_operations`].
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Applied,
    /// The same `(client_id, client_sequence)` was accepted before; the
    /// original operation is returned so resubmits are idempotent.
    Duplicate(PersistedOperation),
}

/// The persistence contract. All mutations of one document's operation log
/// go through `append_operations`, which is atomic and enforces the
/// uniqueness of `(document_id, server_sequence)` and
/// `(document_id, client_id, client_sequence)`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn migrate(&self) -> Result<(), StoreError>;
    async fn ping(&self) -> Result<(), StoreError>;

    async fn create_room(&self, room: Room) -> Result<(), StoreError>;
    async fn room(&self, id: &RoomId) -> Result<Room, StoreError>;
    async fn update_room(&self, room: Room) -> Result<(), StoreError>;
    async fn delete_room(&self, id: &RoomId) -> Result<(), StoreError>;
    /// Marks rooms past their expiry as expired and returns their ids.
    async fn expire_rooms(&self, now: OffsetDateTime) -> Result<Vec<RoomId>, StoreError>;

    async fn upsert_participant(&self, participant: Participant) -> Result<(), StoreError>;
    async fn participant(
        &self,
        room: &RoomId,
        user: &UserId,
    ) -> Result<Option<Participant>, StoreError>;
    async fn participants(&self, room: &RoomId) -> Result<Vec<Participant>, StoreError>;
    async fn remove_participant(&self, id: &ParticipantId) -> Result<(), StoreError>;

    async fn create_document(&self, document: Document) -> Result<(), StoreError>;
    async fn document(&self, id: &DocumentId) -> Result<Document, StoreError>;
    async fn documents(&self, room: &RoomId) -> Result<Vec<Document>, StoreError>;
    async fn delete_document(&self, id: &DocumentId) -> Result<(), StoreError>;

    async fn append_operations(
        &self,
        document_id: &DocumentId,
        operations: Vec<PersistedOperation>,
        update: ContentUpdate,
    ) -> Result<AppendOutcome, StoreError>;
    /// Operations with `server_sequence > from`, ascending, at most `limit`.
    async fn operations_since(
        &self,
        document_id: &DocumentId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<PersistedOperation>, StoreError>;

    async fn upsert_cursor(&self, cursor: Cursor) -> Result<(), StoreError>;
    async fn cursors(&self, document: &DocumentId) -> Result<Vec<Cursor>, StoreError>;
    async fn remove_cursor(
        &self,
        participant: &ParticipantId,
        document: &DocumentId,
    ) -> Result<(), StoreError>;

    async fn upsert_presence(&self, presence: Presence) -> Result<(), StoreError>;
    async fn presence_in_room(&self, room: &RoomId) -> Result<Vec<Presence>, StoreError>;
    /// Marks presence rows idle since `older_than` as offline and returns
    /// the updated rows.
    async fn sweep_presence(&self, older_than: OffsetDateTime)
        -> Result<Vec<Presence>, StoreError>;
}

/// Cloneable handle the runtime components hold. Wraps every call in the
/// store deadline; a missed deadline surfaces as [`StoreError::Unavailable`].
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<dyn Store>,
    deadline: Duration,
}

impl StoreHandle {
    pub fn new(store: Arc<dyn Store>, deadline: Duration) -> Self {
        Self { store, deadline }
    }

    async fn within<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>> + Send,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.deadline, call)
            .await
            .map_err(|_| StoreError::Unavailable("store call deadline exceeded".into()))?
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        self.within(self.store.migrate()).await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.within(self.store.ping()).await
    }

    pub async fn create_room(&self, room: Room) -> Result<(), StoreError> {
        self.within(self.store.create_room(room)).await
    }

    pub async fn room(&self, id: &RoomId) -> Result<Room, StoreError> {
        self.within(self.store.room(id)).await
    }

    pub async fn update_room(&self, room: Room) -> Result<(), StoreError> {
        self.within(self.store.update_room(room)).await
    }

    pub async fn delete_room(&self, id: &RoomId) -> Result<(), StoreError> {
        self.within(self.store.delete_room(id)).await
    }

    pub async fn expire_rooms(&self, now: OffsetDateTime) -> Result<Vec<RoomId>, StoreError> {
        self.within(self.store.expire_rooms(now)).await
    }

    pub async fn upsert_participant(&self, participant: Participant) -> Result<(), StoreError> {
        self.within(self.store.upsert_participant(participant))
            .await
    }

    pub async fn participant(
        &self,
        room: &RoomId,
        user: &UserId,
    ) -> Result<Option<Participant>, StoreError> {
        self.within(self.store.participant(room, user)).await
    }

    pub async fn participants(&self, room: &RoomId) -> Result<Vec<Participant>, StoreError> {
        self.within(self.store.participants(room)).await
    }

    pub async fn remove_participant(&self, id: &ParticipantId) -> Result<(), StoreError> {
        self.within(self.store.remove_participant(id)).await
    }

    pub async fn create_document(&self, document: Document) -> Result<(), StoreError> {
        self.within(self.store.create_document(document)).await
    }

    pub async fn document(&self, id: &DocumentId) -> Result<Document, StoreError> {
        self.within(self.store.document(id)).await
    }

    pub async fn documents(&self, room: &RoomId) -> Result<Vec<Document>, StoreError> {
        self.within(self.store.documents(room)).await
    }

    pub async fn delete_document(&self, id: &DocumentId) -> Result<(), StoreError> {
        self.within(self.store.delete_document(id)).await
    }

    pub async fn append_operations(
        &self,
        document_id: &DocumentId,
        operations: Vec<PersistedOperation>,
        update: ContentUpdate,
    ) -> Result<AppendOutcome, StoreError> {
        self.within(
            self.store
                .append_operations(document_id, operations, update),
        )
        .await
    }

    pub async fn operations_since(
        &self,
        document_id: &DocumentId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<PersistedOperation>, StoreError> {
        self.within(self.store.operations_since(document_id, from, limit))
            .await
    }

    pub async fn upsert_cursor(&self, cursor: Cursor) -> Result<(), StoreError> {
        self.within(self.store.upsert_cursor(cursor)).await
    }

    pub async fn cursors(&self, document: &DocumentId) -> Result<Vec<Cursor>, StoreError> {
        self.within(self.store.cursors(document)).await
    }

    pub async fn remove_cursor(
        &self,
        participant: &ParticipantId,
        document: &DocumentId,
    ) -> Result<(), StoreError> {
        self.within(self.store.remove_cursor(participant, document))
            .await
    }

    pub async fn upsert_presence(&self, presence: Presence) -> Result<(), StoreError> {
        self.within(self.store.upsert_presence(presence)).await
    }

    pub async fn presence_in_room(&self, room: &RoomId) -> Result<Vec<Presence>, StoreError> {
        self.within(self.store.presence_in_room(room)).await
    }

    pub async fn sweep_presence(
        &self,
        older_than: OffsetDateTime,
    ) -> Result<Vec<Presence>, StoreError> {
        self.within(self.store.sweep_presence(older_than)).await
    }
}

/// In-process store. One mutex plays the role of the backend's transaction
/// scope, which makes `append_operations` naturally atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    rooms: HashMap<RoomId, Room>,
    participants: HashMap<ParticipantId, Participant>,
    documents: HashMap<DocumentId, Document>,
    /// Per document, ascending by `server_sequence`.
    operations: HashMap<DocumentId, Vec<PersistedOperation>>,
    cursors: HashMap<(ParticipantId, DocumentId), Cursor>,
    presence: HashMap<(ParticipantId, RoomId), Presence>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Inner {
    fn drop_document_children(&mut self, document_id: &DocumentId) {
        self.operations.remove(document_id);
        self.cursors.retain(|(_, doc), _| doc != document_id);
    }

    fn drop_participant_children(&mut self, participant_id: &ParticipantId) {
        self.cursors.retain(|(p, _), _| p != participant_id);
        self.presence.retain(|(p, _), _| p != participant_id);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn migrate(&self) -> Result<(), StoreError> {
        // Nothing to create; the in-memory schema is implicit.
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn create_room(&self, room: Room) -> Result<(), StoreError> {
        self.inner.lock().await.rooms.insert(room.id.clone(), room);
        Ok(())
    }

    async fn room(&self, id: &RoomId) -> Result<Room, StoreError> {
        self.inner
            .lock()
            .await
            .rooms
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound("room"))
    }

    async fn update_room(&self, room: Room) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.rooms.contains_key(&room.id) {
            return Err(StoreError::NotFound("room"));
        }
        inner.rooms.insert(room.id.clone(), room);
        Ok(())
    }

    async fn delete_room(&self, id: &RoomId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.rooms.remove(id).ok_or(StoreError::NotFound("room"))?;
        let documents: Vec<_> = inner
            .documents
            .values()
            .filter(|d| &d.room_id == id)
            .map(|d| d.id.clone())
            .collect();
        for document_id in documents {
            inner.documents.remove(&document_id);
            inner.drop_document_children(&document_id);
        }
        let participants: Vec<_> = inner
            .participants
            .values()
            .filter(|p| &p.room_id == id)
            .map(|p| p.id.clone())
            .collect();
        for participant_id in participants {
            inner.participants.remove(&participant_id);
            inner.drop_participant_children(&participant_id);
        }
        Ok(())
    }

    async fn expire_rooms(&self, now: OffsetDateTime) -> Result<Vec<RoomId>, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut expired = Vec::new();
        for room in inner.rooms.values_mut() {
            if room.status == RoomStatus::Active
                && room.expires_at.is_some_and(|expiry| expiry <= now)
            {
                room.status = RoomStatus::Expired;
                room.updated_at = now;
                expired.push(room.id.clone());
            }
        }
        Ok(expired)
    }

    async fn upsert_participant(&self, participant: Participant) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        // One record per (room, user): replace any existing one in place.
        let existing = inner
            .participants
            .values()
            .find(|p| p.room_id == participant.room_id && p.user_id == participant.user_id)
            .map(|p| p.id.clone());
        if let Some(id) = existing {
            if id != participant.id {
                inner.participants.remove(&id);
            }
        }
        inner
            .participants
            .insert(participant.id.clone(), participant);
        Ok(())
    }

    async fn participant(
        &self,
        room: &RoomId,
        user: &UserId,
    ) -> Result<Option<Participant>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .participants
            .values()
            .find(|p| &p.room_id == room && &p.user_id == user)
            .cloned())
    }

    async fn participants(&self, room: &RoomId) -> Result<Vec<Participant>, StoreError> {
        let mut participants: Vec<_> = self
            .inner
            .lock()
            .await
            .participants
            .values()
            .filter(|p| &p.room_id == room)
            .cloned()
            .collect();
        participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at));
        Ok(participants)
    }

    async fn remove_participant(&self, id: &ParticipantId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .participants
            .remove(id)
            .ok_or(StoreError::NotFound("participant"))?;
        inner.drop_participant_children(id);
        Ok(())
    }

    async fn create_document(&self, document: Document) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.rooms.contains_key(&document.room_id) {
            return Err(StoreError::NotFound("room"));
        }
        let exists = inner
            .documents
            .values()
            .any(|d| d.room_id == document.room_id && d.file_path == document.file_path);
        if exists {
            return Err(StoreError::DocumentExists);
        }
        inner.documents.insert(document.id.clone(), document);
        Ok(())
    }

    async fn document(&self, id: &DocumentId) -> Result<Document, StoreError> {
        self.inner
            .lock()
            .await
            .documents
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound("document"))
    }

    async fn documents(&self, room: &RoomId) -> Result<Vec<Document>, StoreError> {
        let mut documents: Vec<_> = self
            .inner
            .lock()
            .await
            .documents
            .values()
            .filter(|d| &d.room_id == room)
            .cloned()
            .collect();
        documents.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        Ok(documents)
    }

    async fn delete_document(&self, id: &DocumentId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .documents
            .remove(id)
            .ok_or(StoreError::NotFound("document"))?;
        inner.drop_document_children(id);
        Ok(())
    }

    async fn append_operations(
        &self,
        document_id: &DocumentId,
        operations: Vec<PersistedOperation>,
        update: ContentUpdate,
    ) -> Result<AppendOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.documents.contains_key(document_id) {
            return Err(StoreError::NotFound("document"));
        }
        let log = inner.operations.entry(document_id.clone()).or_default();
        for operation in &operations {
            if let Some(original) = log.iter().find(|existing| {
                existing.client_id == operation.client_id
                    && existing.client_sequence == operation.client_sequence
            }) {
                return Ok(AppendOutcome::Duplicate(original.clone()));
            }
            if log
                .iter()
                .any(|existing| existing.server_sequence == operation.server_sequence)
            {
                return Err(StoreError::SequenceTaken(operation.server_sequence));
            }
        }
        log.extend(operations);
        log.sort_by_key(|operation| operation.server_sequence);
        let document = inner
            .documents
            .get_mut(document_id)
            .expect("document existence checked above");
        document.content = update.content;
        document.version = update.version;
        document.size_bytes = update.size_bytes;
        document.line_count = update.line_count;
        document.last_operation_at = Some(update.last_operation_at);
        Ok(AppendOutcome::Applied)
    }

    async fn operations_since(
        &self,
        document_id: &DocumentId,
        from: u64,
        limit: usize,
    ) -> Result<Vec<PersistedOperation>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .operations
            .get(document_id)
            .map(|log| {
                log.iter()
                    .filter(|operation| operation.server_sequence > from)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert_cursor(&self, cursor: Cursor) -> Result<(), StoreError> {
        self.inner.lock().await.cursors.insert(
            (cursor.participant_id.clone(), cursor.document_id.clone()),
            cursor,
        );
        Ok(())
    }

    async fn cursors(&self, document: &DocumentId) -> Result<Vec<Cursor>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .cursors
            .values()
            .filter(|c| &c.document_id == document)
            .cloned()
            .collect())
    }

    async fn remove_cursor(
        &self,
        participant: &ParticipantId,
        document: &DocumentId,
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .cursors
            .remove(&(participant.clone(), document.clone()));
        Ok(())
    }

    async fn upsert_presence(&self, presence: Presence) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(participant) = inner.participants.get_mut(&presence.participant_id) {
            participant.presence_status = presence.status;
            participant.last_seen = presence.last_activity;
        }
        inner.presence.insert(
            (presence.participant_id.clone(), presence.room_id.clone()),
            presence,
        );
        Ok(())
    }

    async fn presence_in_room(&self, room: &RoomId) -> Result<Vec<Presence>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .presence
            .values()
            .filter(|p| &p.room_id == room)
            .cloned()
            .collect())
    }

    async fn sweep_presence(
        &self,
        older_than: OffsetDateTime,
    ) -> Result<Vec<Presence>, StoreError> {
        let mut inner = self.inner.lock().await;
        let mut swept = Vec::new();
        let stale: Vec<_> = inner
            .presence
            .values()
            .filter(|p| p.status != PresenceStatus::Offline && p.last_activity < older_than)
            .map(|p| (p.participant_id.clone(), p.room_id.clone()))
            .collect();
        for key in stale {
            if let Some(presence) = inner.presence.get_mut(&key) {
                presence.status = PresenceStatus::Offline;
                swept.push(presence.clone());
            }
            if let Some(participant) = inner.participants.get_mut(&key.0) {
                participant.presence_status = PresenceStatus::Offline;
            }
        }
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::factories::{insert, padded};
    use crate::types::factories::{document, participant, presence, room};
    use crate::types::{ClientId, OperationId, OperationSummary, Role};
    use pretty_assertions::assert_eq;

    fn handle(store: Arc<MemoryStore>) -> StoreHandle {
        StoreHandle::new(store, STORE_DEADLINE)
    }

    fn operation(
        document: &Document,
        participant: &Participant,
        server_sequence: u64,
        client_seq: u64,
    ) -> PersistedOperation {
        let bundle = padded(insert(0, "x"), 0);
        let now = OffsetDateTime::now_utc();
        PersistedOperation {
            id: OperationId::generate(),
            document_id: document.id.clone(),
            participant_id: participant.id.clone(),
            client_id: ClientId::new("client-a"),
            client_sequence: client_seq,
            server_sequence,
            summary: OperationSummary::of(&bundle),
            bundle,
            timestamp: now,
            applied_at: now,
            vector_clock: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
        }
    }

    fn update(version: u64) -> ContentUpdate {
        ContentUpdate {
            content: "x".repeat(version as usize),
            version,
            size_bytes: version as usize,
            line_count: 1,
            last_operation_at: OffsetDateTime::now_utc(),
        }
    }

    #[tokio::test]
    async fn append_rejects_taken_server_sequences() {
        let store = handle(MemoryStore::shared());
        store.create_room(room("r1", "alice")).await.unwrap();
        let doc = document("r1", "main.rs", "");
        store.create_document(doc.clone()).await.unwrap();
        let alice = participant("r1", "alice", Role::Owner);

        let mut op = operation(&doc, &alice, 1, 1);
        store
            .append_operations(&doc.id, vec![op.clone()], update(1))
            .await
            .unwrap();

        op.id = OperationId::generate();
        op.client_sequence = 2;
        let result = store
            .append_operations(&doc.id, vec![op], update(2))
            .await;
        assert_eq!(result, Err(StoreError::SequenceTaken(1)));
    }

    #[tokio::test]
    async fn append_is_idempotent_per_client_sequence() {
        let store = handle(MemoryStore::shared());
        store.create_room(room("r1", "alice")).await.unwrap();
        let doc = document("r1", "main.rs", "");
        store.create_document(doc.clone()).await.unwrap();
        let alice = participant("r1", "alice", Role::Owner);

        let op = operation(&doc, &alice, 1, 7);
        store
            .append_operations(&doc.id, vec![op.clone()], update(1))
            .await
            .unwrap();

        // The retry carries a fresh id and the next sequence, but the same
        // (client_id, client_sequence).
        let mut retry = operation(&doc, &alice, 2, 7);
        retry.id = OperationId::generate();
        let outcome = store
            .append_operations(&doc.id, vec![retry], update(2))
            .await
            .unwrap();
        assert_eq!(outcome, AppendOutcome::Duplicate(op));
        // The duplicate must not have advanced the document.
        assert_eq!(store.document(&doc.id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn operations_since_paginates_in_order() {
        let store = handle(MemoryStore::shared());
        store.create_room(room("r1", "alice")).await.unwrap();
        let doc = document("r1", "main.rs", "");
        store.create_document(doc.clone()).await.unwrap();
        let alice = participant("r1", "alice", Role::Owner);

        for sequence in 1..=5 {
            let op = operation(&doc, &alice, sequence, sequence);
            store
                .append_operations(&doc.id, vec![op], update(sequence))
                .await
                .unwrap();
        }

        let page = store.operations_since(&doc.id, 2, 2).await.unwrap();
        let sequences: Vec<_> = page.iter().map(|op| op.server_sequence).collect();
        assert_eq!(sequences, vec![3, 4]);
    }

    #[tokio::test]
    async fn duplicate_paths_in_a_room_are_rejected() {
        let store = handle(MemoryStore::shared());
        store.create_room(room("r1", "alice")).await.unwrap();
        store
            .create_document(document("r1", "main.rs", ""))
            .await
            .unwrap();
        assert_eq!(
            store.create_document(document("r1", "main.rs", "")).await,
            Err(StoreError::DocumentExists)
        );
    }

    #[tokio::test]
    async fn deleting_a_room_cascades() {
        let store = handle(MemoryStore::shared());
        store.create_room(room("r1", "alice")).await.unwrap();
        let doc = document("r1", "main.rs", "");
        store.create_document(doc.clone()).await.unwrap();
        let alice = participant("r1", "alice", Role::Owner);
        store.upsert_participant(alice.clone()).await.unwrap();
        store.upsert_presence(presence(&alice)).await.unwrap();
        store
            .upsert_cursor(Cursor {
                participant_id: alice.id.clone(),
                document_id: doc.id.clone(),
                line: 0,
                column: 0,
                selection_start: None,
                selection_end: None,
                updated_at: OffsetDateTime::now_utc(),
            })
            .await
            .unwrap();

        store.delete_room(&RoomId::new("r1")).await.unwrap();

        assert_eq!(
            store.document(&doc.id).await,
            Err(StoreError::NotFound("document"))
        );
        assert_eq!(store.cursors(&doc.id).await.unwrap(), vec![]);
        assert_eq!(
            store
                .presence_in_room(&RoomId::new("r1"))
                .await
                .unwrap(),
            vec![]
        );
        assert_eq!(
            store
                .participant(&RoomId::new("r1"), &alice.user_id)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn presence_sweep_marks_stale_rows_offline() {
        let store = handle(MemoryStore::shared());
        store.create_room(room("r1", "alice")).await.unwrap();
        let alice = participant("r1", "alice", Role::Owner);
        store.upsert_participant(alice.clone()).await.unwrap();
        let mut row = presence(&alice);
        row.last_activity = OffsetDateTime::now_utc() - time::Duration::minutes(10);
        store.upsert_presence(row).await.unwrap();

        let swept = store
            .sweep_presence(OffsetDateTime::now_utc() - time::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].status, PresenceStatus::Offline);

        // A second sweep finds nothing left to do.
        let swept = store
            .sweep_presence(OffsetDateTime::now_utc() - time::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(swept, vec![]);
    }

    #[tokio::test]
    async fn room_expiry_flips_status_once() {
        let store = handle(MemoryStore::shared());
        let mut expiring = room("r1", "alice");
        expiring.expires_at = Some(OffsetDateTime::now_utc() - time::Duration::hours(1));
        store.create_room(expiring).await.unwrap();
        store.create_room(room("r2", "bob")).await.unwrap();

        let expired = store.expire_rooms(OffsetDateTime::now_utc()).await.unwrap();
        assert_eq!(expired, vec![RoomId::new("r1")]);
        assert_eq!(
            store.room(&RoomId::new("r1")).await.unwrap().status,
            RoomStatus::Expired
        );

        let expired = store.expire_rooms(OffsetDateTime::now_utc()).await.unwrap();
        assert_eq!(expired, vec![]);
    }
}
