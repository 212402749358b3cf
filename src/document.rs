//! The per-document coordinator.
//!
//! One [`DocumentActor`] task owns each live document. Everything that
//! mutates document state flows through its message channel, which is what
//! serializes concurrent submissions. Accepted and rejected submissions are
//! reported to the owning room hub through an event channel so that every
//! participant observes the same per-document order.

use std::collections::VecDeque;

use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::Limits;
use crate::ot::{self, utf16_len, Bundle, TieBreak};
use crate::protocol::ErrorKind;
use crate::store::{AppendOutcome, ContentUpdate, StoreError, StoreHandle};
use crate::types::{
    ClientId, ConnectionId, Cursor, Document, DocumentId, OperationId, OperationSummary,
    ParticipantId, PersistedOperation, Position,
};

/// A client submission, as forwarded by the room hub.
#[derive(Debug)]
pub struct SubmitCommand {
    pub submitter: ConnectionId,
    pub participant_id: ParticipantId,
    pub bundle: Bundle,
    pub base_version: u64,
    pub client_id: ClientId,
    pub client_seq: u64,
}

/// A cursor update to be transformed into current document coordinates.
#[derive(Debug)]
pub struct CursorCommand {
    pub participant_id: ParticipantId,
    pub position: Position,
    pub selection: Option<(usize, usize)>,
    pub base_version: u64,
}

/// Outcomes the actor reports to the room hub.
#[derive(Debug)]
pub enum DocEvent {
    Accepted {
        submitter: ConnectionId,
        operation: PersistedOperation,
        new_version: u64,
        /// Whether the bundle had to be transformed against newer history.
        transformed: bool,
    },
    /// An idempotent resubmission; only the submitter is told again.
    Duplicate {
        submitter: ConnectionId,
        operation: PersistedOperation,
        version: u64,
    },
    Rejected {
        submitter: ConnectionId,
        document_id: DocumentId,
        error: ErrorKind,
        current_version: u64,
    },
}

pub enum DocMessage {
    Submit(SubmitCommand),
    Snapshot {
        response_tx: oneshot::Sender<Document>,
    },
    OperationsSince {
        from: u64,
        limit: usize,
        response_tx: oneshot::Sender<Result<Vec<PersistedOperation>, ErrorKind>>,
    },
    SyncCursor {
        command: CursorCommand,
        response_tx: oneshot::Sender<Result<Cursor, ErrorKind>>,
    },
}

impl std::fmt::Debug for DocMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let repr = match self {
            Self::Submit(_) => "submit",
            Self::Snapshot { .. } => "snapshot",
            Self::OperationsSince { .. } => "operations since",
            Self::SyncCursor { .. } => "sync cursor",
        };
        write!(f, "{repr}")
    }
}

#[derive(Clone)]
pub struct DocumentActorHandle {
    document_id: DocumentId,
    tx: mpsc::Sender<DocMessage>,
}

impl DocumentActorHandle {
    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    /// Whether the actor behind this handle is still running.
    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Forwards a submission; its outcome arrives on the hub event channel.
    pub async fn submit(&self, command: SubmitCommand) -> Result<(), ErrorKind> {
        self.tx
            .send(DocMessage::Submit(command))
            .await
            .map_err(|_| ErrorKind::Unavailable)
    }

    /// Like [`Self::submit`] but never waits. The hub uses this so a
    /// saturated document queue surfaces as back-pressure to the client
    /// instead of stalling the whole room.
    pub fn try_submit(&self, command: SubmitCommand) -> Result<(), ErrorKind> {
        self.tx
            .try_send(DocMessage::Submit(command))
            .map_err(|error| match error {
                mpsc::error::TrySendError::Full(_) => ErrorKind::RateLimited,
                mpsc::error::TrySendError::Closed(_) => ErrorKind::Unavailable,
            })
    }

    pub async fn snapshot(&self) -> Result<Document, ErrorKind> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(DocMessage::Snapshot { response_tx })
            .await
            .map_err(|_| ErrorKind::Unavailable)?;
        response_rx.await.map_err(|_| ErrorKind::Unavailable)
    }

    pub async fn operations_since(
        &self,
        from: u64,
        limit: usize,
    ) -> Result<Vec<PersistedOperation>, ErrorKind> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(DocMessage::OperationsSince {
                from,
                limit,
                response_tx,
            })
            .await
            .map_err(|_| ErrorKind::Unavailable)?;
        response_rx.await.map_err(|_| ErrorKind::Unavailable)?
    }

    pub async fn sync_cursor(&self, command: CursorCommand) -> Result<Cursor, ErrorKind> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(DocMessage::SyncCursor {
                command,
                response_tx,
            })
            .await
            .map_err(|_| ErrorKind::Unavailable)?;
        response_rx.await.map_err(|_| ErrorKind::Unavailable)?
    }
}

struct RingEntry {
    operation: PersistedOperation,
    /// Undoes the operation; lets the actor rebuild recent content states
    /// for exact cursor transformation.
    inverse: Bundle,
}

pub struct DocumentActor {
    document: Document,
    ring: VecDeque<RingEntry>,
    store: StoreHandle,
    limits: Limits,
    events_tx: mpsc::Sender<DocEvent>,
    rx: mpsc::Receiver<DocMessage>,
}

impl DocumentActor {
    /// Spawns the actor task for `document` and returns its handle. The
    /// actor stops when the last handle is dropped.
    pub fn spawn(
        document: Document,
        store: StoreHandle,
        limits: Limits,
        events_tx: mpsc::Sender<DocEvent>,
    ) -> DocumentActorHandle {
        let (tx, rx) = mpsc::channel(64);
        let handle = DocumentActorHandle {
            document_id: document.id.clone(),
            tx,
        };
        let mut actor = Self {
            document,
            ring: VecDeque::new(),
            store,
            limits,
            events_tx,
            rx,
        };
        tokio::spawn(async move { actor.run().await });
        handle
    }

    async fn run(&mut self) {
        debug!(document = %self.document.id, "document actor started");
        while let Some(message) = self.rx.recv().await {
            self.handle_message(message).await;
        }
        debug!(document = %self.document.id, "document actor stopped");
    }

    async fn handle_message(&mut self, message: DocMessage) {
        match message {
            DocMessage::Submit(command) => {
                let event = self.handle_submit(command).await;
                let _ = self.events_tx.send(event).await;
            }
            DocMessage::Snapshot { response_tx } => {
                let _ = response_tx.send(self.document.clone());
            }
            DocMessage::OperationsSince {
                from,
                limit,
                response_tx,
            } => {
                let _ = response_tx.send(self.operations_since(from, limit).await);
            }
            DocMessage::SyncCursor {
                command,
                response_tx,
            } => {
                let _ = response_tx.send(self.sync_cursor(&command));
            }
        }
    }

    async fn handle_submit(&mut self, command: SubmitCommand) -> DocEvent {
        // The append can lose the race against another writer on the same
        // document in a multi-process deployment; reload and retry a few
        // times before giving up.
        for _ in 0..3 {
            match self.try_submit(&command).await {
                Ok(event) => return event,
                Err(StoreError::SequenceTaken(sequence)) => {
                    warn!(
                        document = %self.document.id,
                        sequence, "lost an append race, reloading document state"
                    );
                    if let Err(error) = self.reload().await {
                        return self.rejected(&command, store_error_kind(&error));
                    }
                }
                Err(error) => return self.rejected(&command, store_error_kind(&error)),
            }
        }
        self.rejected(&command, ErrorKind::Unavailable)
    }

    /// The submit pipeline: transform against the gap, apply, persist
    /// atomically. Returns `Err` only for store-level failures that warrant
    /// a retry or abort; protocol-level rejections are `Ok(Rejected)`.
    async fn try_submit(&mut self, command: &SubmitCommand) -> Result<DocEvent, StoreError> {
        let current = self.document.version;
        if command.base_version > current {
            return Ok(self.rejected(
                command,
                ErrorKind::OutOfOrder {
                    base: command.base_version,
                    current,
                },
            ));
        }
        if current - command.base_version > self.limits.max_lag {
            return Ok(self.rejected(command, ErrorKind::SyncRequired));
        }

        let gap = self.gap_bundles(command.base_version).await?;
        let mut transformed = command.bundle.normalized();
        let was_transformed = !gap.is_empty();
        for server_bundle in &gap {
            // The server op takes the left side so its inserts win ties.
            match ot::transform(server_bundle, &transformed, TieBreak::Left) {
                Ok((_, client_prime)) => transformed = client_prime,
                Err(error) => {
                    warn!(
                        document = %self.document.id,
                        %error, "inconsistent state while transforming a submission"
                    );
                    return Ok(self.rejected(command, ErrorKind::SyncRequired));
                }
            }
        }

        if !transformed.is_valid_for(utf16_len(&self.document.content)) {
            warn!(
                document = %self.document.id,
                base = command.base_version,
                "transformed bundle does not fit the document, client must re-sync"
            );
            return Ok(self.rejected(command, ErrorKind::SyncRequired));
        }
        let inverse = match transformed.invert(&self.document.content) {
            Ok(inverse) => inverse,
            Err(_) => return Ok(self.rejected(command, ErrorKind::SyncRequired)),
        };
        let content = match transformed.apply(&self.document.content) {
            Ok(content) => content,
            Err(_) => return Ok(self.rejected(command, ErrorKind::SyncRequired)),
        };

        let new_version = current + 1;
        let now = OffsetDateTime::now_utc();
        let operation = PersistedOperation {
            id: OperationId::generate(),
            document_id: self.document.id.clone(),
            participant_id: command.participant_id.clone(),
            client_id: command.client_id.clone(),
            client_sequence: command.client_seq,
            server_sequence: new_version,
            summary: OperationSummary::of(&transformed),
            bundle: transformed,
            timestamp: now,
            applied_at: now,
            vector_clock: serde_json::Value::Null,
            metadata: serde_json::Value::Null,
        };
        let update = {
            let mut updated = self.document.clone();
            updated.content = content;
            updated.refresh_counters();
            ContentUpdate {
                size_bytes: updated.size_bytes,
                line_count: updated.line_count,
                content: updated.content,
                version: new_version,
                last_operation_at: now,
            }
        };

        match self
            .store
            .append_operations(&self.document.id, vec![operation.clone()], update.clone())
            .await?
        {
            AppendOutcome::Applied => {
                self.document.content = update.content;
                self.document.version = new_version;
                self.document.size_bytes = update.size_bytes;
                self.document.line_count = update.line_count;
                self.document.last_operation_at = Some(now);
                self.ring.push_back(RingEntry {
                    operation: operation.clone(),
                    inverse,
                });
                while self.ring.len() > self.limits.op_ring_size {
                    self.ring.pop_front();
                }
                debug!(
                    document = %self.document.id,
                    version = new_version,
                    transformed = was_transformed,
                    "accepted operation"
                );
                Ok(DocEvent::Accepted {
                    submitter: command.submitter,
                    operation,
                    new_version,
                    transformed: was_transformed,
                })
            }
            AppendOutcome::Duplicate(original) => Ok(DocEvent::Duplicate {
                submitter: command.submitter,
                operation: original,
                version: self.document.version,
            }),
        }
    }

    fn rejected(&self, command: &SubmitCommand, error: ErrorKind) -> DocEvent {
        DocEvent::Rejected {
            submitter: command.submitter,
            document_id: self.document.id.clone(),
            error,
            current_version: self.document.version,
        }
    }

    /// Server bundles with sequence in `(base_version, current]`, from the
    /// ring when possible, from the store otherwise.
    async fn gap_bundles(&self, base_version: u64) -> Result<Vec<Bundle>, StoreError> {
        let current = self.document.version;
        if base_version == current {
            return Ok(Vec::new());
        }
        if base_version >= self.ring_floor() {
            return Ok(self
                .ring
                .iter()
                .filter(|entry| entry.operation.server_sequence > base_version)
                .map(|entry| entry.operation.bundle.clone())
                .collect());
        }
        let expected = (current - base_version) as usize;
        let operations = self
            .store
            .operations_since(&self.document.id, base_version, expected)
            .await?;
        if operations.len() != expected {
            return Err(StoreError::Unavailable(format!(
                "operation log has a hole: wanted {expected} operations after {base_version}, got {}",
                operations.len()
            )));
        }
        Ok(operations.into_iter().map(|op| op.bundle).collect())
    }

    /// The highest version the ring can *not* serve as a base.
    fn ring_floor(&self) -> u64 {
        self.document.version - self.ring.len() as u64
    }

    async fn operations_since(
        &self,
        from: u64,
        limit: usize,
    ) -> Result<Vec<PersistedOperation>, ErrorKind> {
        if from >= self.ring_floor() {
            return Ok(self
                .ring
                .iter()
                .filter(|entry| entry.operation.server_sequence > from)
                .take(limit)
                .map(|entry| entry.operation.clone())
                .collect());
        }
        self.store
            .operations_since(&self.document.id, from, limit)
            .await
            .map_err(|error| store_error_kind(&error))
    }

    /// Transforms a cursor reported against `base_version` into current
    /// document coordinates.
    fn sync_cursor(&self, command: &CursorCommand) -> Result<Cursor, ErrorKind> {
        // When the base state cannot be rebuilt (too old for the ring) the
        // position is taken against the current content and nothing is
        // transformed; the cursor gets re-reported within the next
        // coalescing interval anyway.
        let (base_content, effective_base) = match self.content_at(command.base_version) {
            Some(content) => (content, command.base_version),
            None => (self.document.content.clone(), self.document.version),
        };
        let end_of_base = utf16_len(&base_content);
        let mut offset = command
            .position
            .to_offset(&base_content)
            .unwrap_or(end_of_base);
        let mut selection = command
            .selection
            .map(|(start, end)| (start.min(end_of_base), end.min(end_of_base)));

        for entry in &self.ring {
            if entry.operation.server_sequence <= effective_base {
                continue;
            }
            offset = ot::transform_cursor(offset, &entry.operation.bundle, false);
            selection = selection.map(|(start, end)| {
                (
                    ot::transform_cursor(start, &entry.operation.bundle, false),
                    ot::transform_cursor(end, &entry.operation.bundle, false),
                )
            });
        }

        let position = Position::from_offset(offset, &self.document.content)
            .ok_or(ErrorKind::InconsistentState)?;
        Ok(Cursor {
            participant_id: command.participant_id.clone(),
            document_id: self.document.id.clone(),
            line: position.line,
            column: position.column,
            selection_start: selection.map(|(start, _)| start),
            selection_end: selection.map(|(_, end)| end),
            updated_at: OffsetDateTime::now_utc(),
        })
    }

    /// Rebuilds the content as of `version` by undoing ring operations.
    /// `None` when the version is current, in the future, or has already
    /// left the ring.
    fn content_at(&self, version: u64) -> Option<String> {
        if version >= self.document.version || version < self.ring_floor() {
            return None;
        }
        let mut content = self.document.content.clone();
        for entry in self.ring.iter().rev() {
            if entry.operation.server_sequence <= version {
                break;
            }
            match entry.inverse.apply(&content) {
                Ok(earlier) => content = earlier,
                Err(error) => {
                    warn!(
                        document = %self.document.id,
                        %error, "ring inverse did not apply, treating the cursor as current"
                    );
                    return None;
                }
            }
        }
        Some(content)
    }

    async fn reload(&mut self) -> Result<(), StoreError> {
        self.document = self.store.document(&self.document.id).await?;
        self.ring.clear();
        Ok(())
    }
}

fn store_error_kind(error: &StoreError) -> ErrorKind {
    match error {
        StoreError::NotFound(what) => ErrorKind::NotFound(what),
        StoreError::DocumentExists => ErrorKind::DocumentExists,
        StoreError::SequenceTaken(_) => ErrorKind::Unavailable,
        StoreError::Unavailable(_) => ErrorKind::Unavailable,
    }
}
