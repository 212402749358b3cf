//! The wire protocol: framed JSON messages exchanged with clients over the
//! persistent socket, and the error kinds with their stable machine codes.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::ot::Bundle;
use crate::types::{
    Activity, ClientId, Cursor, Document, DocumentId, Participant, ParticipantId,
    PersistedOperation, Presence, PresenceStatus, Room, RoomId,
};

/// Every frame on the socket is one envelope. `timestamp` is Unix
/// milliseconds; `sender_id` is set on events fanned out on behalf of
/// another participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
    #[serde(flatten)]
    pub message: M,
    pub timestamp: i64,
    #[serde(
        rename = "senderId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_id: Option<ParticipantId>,
}

impl<M> Envelope<M> {
    pub fn new(message: M) -> Self {
        Self {
            message,
            timestamp: unix_millis(),
            sender_id: None,
        }
    }

    pub fn from_sender(message: M, sender_id: ParticipantId) -> Self {
        Self {
            message,
            timestamp: unix_millis(),
            sender_id: Some(sender_id),
        }
    }
}

fn unix_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// A cursor's selection range, absolute UTF-16 offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// First message on a fresh connection.
    Auth {
        token: String,
    },
    JoinRoom {
        room_id: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resume_from_version: Option<u64>,
    },
    LeaveRoom,
    OpenDocument {
        doc_id: DocumentId,
    },
    Operation {
        doc_id: DocumentId,
        ops: Bundle,
        base_version: u64,
        client_id: ClientId,
        client_seq: u64,
    },
    CursorUpdate {
        doc_id: DocumentId,
        line: usize,
        col: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<Selection>,
        /// Document version the position refers to; omitted means current.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
    },
    PresenceUpdate {
        status: PresenceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        activity: Option<Activity>,
    },
    Ping,
}

/// Messages the server emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    RoomJoined {
        snapshot: RoomSnapshot,
    },
    ParticipantJoined {
        participant: Participant,
    },
    ParticipantLeft {
        participant_id: ParticipantId,
    },
    OperationReceived {
        doc_id: DocumentId,
        op: PersistedOperation,
        new_version: u64,
    },
    CursorUpdated {
        doc_id: DocumentId,
        cursor: Cursor,
    },
    PresenceUpdated {
        presence: Presence,
    },
    SyncRequest {
        doc_id: DocumentId,
        from: u64,
    },
    Error {
        code: String,
        message: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(kind: &ErrorKind) -> Self {
        Self::Error {
            code: kind.code().to_string(),
            message: kind.to_string(),
        }
    }
}

/// State handed to a client on `room-joined`. Documents carry their content
/// unless the join resumed within `MAX_LAG`, in which case the operation gap
/// is replayed instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub room: Room,
    pub participant_id: ParticipantId,
    pub participants: Vec<Participant>,
    pub documents: Vec<DocumentSnapshot>,
    pub cursors: Vec<Cursor>,
    pub presence: Vec<Presence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub id: DocumentId,
    pub file_path: String,
    pub language: String,
    pub version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub size_bytes: usize,
    pub line_count: usize,
}

impl DocumentSnapshot {
    pub fn full(document: &Document) -> Self {
        Self {
            id: document.id.clone(),
            file_path: document.file_path.clone(),
            language: document.language.clone(),
            version: document.version,
            content: Some(document.content.clone()),
            size_bytes: document.size_bytes,
            line_count: document.line_count,
        }
    }

    pub fn without_content(document: &Document) -> Self {
        Self {
            content: None,
            ..Self::full(document)
        }
    }
}

/// The error kinds of the service. Each maps to a stable machine code that
/// clients can dispatch on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorKind {
    #[error("authenticate before sending anything else")]
    AuthRequired,
    #[error("the bearer token was rejected")]
    InvalidToken,
    #[error("you are not allowed to do that")]
    PermissionDenied,
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("a document already exists at that path")]
    DocumentExists,
    #[error("base version {base} is ahead of the current version {current}")]
    OutOfOrder { base: u64, current: u64 },
    #[error("too far behind, re-sync the document")]
    SyncRequired,
    #[error("the operation does not apply to the document")]
    InvalidOperation,
    #[error("server-side state mismatch, re-sync the document")]
    InconsistentState,
    #[error("slow down")]
    RateLimited,
    #[error("viewers cannot edit")]
    ReadOnly,
    #[error("outbound queue overflowed")]
    SlowConsumer,
    #[error("the storage backend did not respond")]
    Unavailable,
    #[error("internal error")]
    Internal,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::DocumentExists => "DOCUMENT_EXISTS",
            Self::OutOfOrder { .. } => "OUT_OF_ORDER",
            Self::SyncRequired => "SYNC_REQUIRED",
            Self::InvalidOperation => "INVALID_OPERATION",
            Self::InconsistentState => "INCONSISTENT_STATE",
            Self::RateLimited => "RATE_LIMITED",
            Self::ReadOnly => "READ_ONLY",
            Self::SlowConsumer => "SLOW_CONSUMER",
            Self::Unavailable => "UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }
}
