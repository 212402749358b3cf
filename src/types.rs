//! Domain model: rooms, participants, documents, persisted operations,
//! cursors and presence, plus the id newtypes shared across the crate.

use rand::distributions::Alphanumeric;
use rand::Rng;
use ropey::Rope;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ot::{utf16_len, Bundle, TextOperation};

/// Hard upper bound on a room's `max_participants` setting.
pub const MAX_ROOM_PARTICIPANTS: usize = 50;

/// Fixed palette the server assigns participant colors from. A participant
/// keeps the color it was created with.
pub const PARTICIPANT_COLORS: [&str; 10] = [
    "#e06c75", "#98c379", "#e5c07b", "#61afef", "#c678dd", "#56b6c2", "#d19a66", "#f47fd4",
    "#7bc96f", "#ee9b4f",
];

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug,
            Clone,
            PartialEq,
            Eq,
            Hash,
            PartialOrd,
            Ord,
            Serialize,
            Deserialize,
            derive_more::Display,
            derive_more::From,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[must_use]
            pub fn generate() -> Self {
                Self(random_id())
            }

            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }
    };
}

opaque_id!(RoomId);
opaque_id!(DocumentId);
opaque_id!(ParticipantId);
opaque_id!(
    /// Stable identity assigned by the auth provider.
    UserId
);
opaque_id!(
    /// Client-chosen id used for idempotent resubmission.
    ClientId
);
opaque_id!(OperationId);

/// Process-local identifier of one live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, derive_more::Display)]
pub struct ConnectionId(pub u64);

fn random_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// Picks a color for a newly created participant.
pub fn pick_color() -> String {
    let index = rand::thread_rng().gen_range(0..PARTICIPANT_COLORS.len());
    PARTICIPANT_COLORS[index].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[display("owner")]
    Owner,
    #[display("editor")]
    Editor,
    #[display("viewer")]
    Viewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Active,
    Archived,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Idle,
    Away,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activity {
    Idle,
    Viewing,
    Editing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: UserId,
    pub max_participants: usize,
    pub status: RoomStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Room {
    pub fn accepts_joins(&self) -> bool {
        self.status == RoomStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub room_id: RoomId,
    pub user_id: UserId,
    pub role: Role,
    pub display_name: String,
    pub color: String,
    pub avatar_url: Option<String>,
    pub presence_status: PresenceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub room_id: RoomId,
    pub file_path: String,
    pub content: String,
    pub version: u64,
    pub language: String,
    pub size_bytes: usize,
    pub line_count: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_operation_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Document {
    /// Recomputes the derived counters after a content change.
    /// `size_bytes` counts UTF-8 bytes; positions elsewhere are UTF-16.
    pub fn refresh_counters(&mut self) {
        self.size_bytes = self.content.len();
        self.line_count = 1 + self.content.matches('\n').count();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Delete,
    Replace,
    Composite,
}

/// Flat summary of a bundle, filling the legacy `operation_type`,
/// `position`, `content` and `length` columns without duplicating the
/// payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    #[serde(rename = "operation_type")]
    pub kind: OperationKind,
    pub position: usize,
    pub content: Option<String>,
    pub length: usize,
}

impl OperationSummary {
    pub fn of(bundle: &Bundle) -> Self {
        let mut position = 0;
        let mut first_site = None;
        let mut inserted = String::new();
        let mut deleted = 0;
        let mut sites = 0;
        let mut previous_was_edit = false;
        for op in bundle.ops() {
            match op {
                TextOperation::Retain(n) => {
                    if first_site.is_none() {
                        position += n;
                    }
                    previous_was_edit = false;
                }
                TextOperation::Insert(s) => {
                    if !previous_was_edit {
                        sites += 1;
                    }
                    first_site.get_or_insert(position);
                    inserted.push_str(s);
                    previous_was_edit = true;
                }
                TextOperation::Delete(n) => {
                    if !previous_was_edit {
                        sites += 1;
                    }
                    first_site.get_or_insert(position);
                    deleted += n;
                    previous_was_edit = true;
                }
            }
        }
        let position = first_site.unwrap_or(0);
        match (sites, inserted.is_empty(), deleted) {
            (0, ..) => Self {
                kind: OperationKind::Composite,
                position: 0,
                content: None,
                length: 0,
            },
            (1, false, 0) => Self {
                kind: OperationKind::Insert,
                position,
                length: utf16_len(&inserted),
                content: Some(inserted),
            },
            (1, true, _) => Self {
                kind: OperationKind::Delete,
                position,
                content: None,
                length: deleted,
            },
            (1, false, _) => Self {
                kind: OperationKind::Replace,
                position,
                length: deleted,
                content: Some(inserted),
            },
            _ => Self {
                kind: OperationKind::Composite,
                position,
                length: deleted + utf16_len(&inserted),
                content: None,
            },
        }
    }
}

/// A bundle the server accepted, as persisted per document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedOperation {
    pub id: OperationId,
    pub document_id: DocumentId,
    pub participant_id: ParticipantId,
    pub client_id: ClientId,
    pub client_sequence: u64,
    /// Equals the document version right after this bundle was applied.
    pub server_sequence: u64,
    pub bundle: Bundle,
    #[serde(flatten)]
    pub summary: OperationSummary,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub applied_at: OffsetDateTime,
    #[serde(default)]
    pub vector_clock: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub participant_id: ParticipantId,
    pub document_id: DocumentId,
    pub line: usize,
    pub column: usize,
    pub selection_start: Option<usize>,
    pub selection_end: Option<usize>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    pub participant_id: ParticipantId,
    pub room_id: RoomId,
    pub status: PresenceStatus,
    pub current_document: Option<DocumentId>,
    pub activity: Activity,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
}

/// A line/column pair as editors report it. Columns are UTF-16 code units
/// within the line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    /// Converts to an absolute UTF-16 offset, or `None` when the position
    /// lies outside `content`.
    pub fn to_offset(self, content: &str) -> Option<usize> {
        let rope = Rope::from_str(content);
        if self.line >= rope.len_lines() {
            return None;
        }
        let line_start = rope.char_to_utf16_cu(rope.line_to_char(self.line));
        let line_end = if self.line + 1 < rope.len_lines() {
            rope.char_to_utf16_cu(rope.line_to_char(self.line + 1))
        } else {
            rope.len_utf16_cu()
        };
        let offset = line_start + self.column;
        (offset <= line_end).then_some(offset)
    }

    /// Converts an absolute UTF-16 offset back into a line/column pair, or
    /// `None` when the offset lies past the end of `content`.
    pub fn from_offset(offset: usize, content: &str) -> Option<Self> {
        let rope = Rope::from_str(content);
        if offset > rope.len_utf16_cu() {
            return None;
        }
        let char_index = rope.utf16_cu_to_char(offset);
        let line = rope.char_to_line(char_index);
        let column = offset - rope.char_to_utf16_cu(rope.line_to_char(line));
        Some(Self { line, column })
    }
}

/// Build helpers for tests across the crate.
pub mod factories {
    use super::{
        pick_color, Activity, Document, DocumentId, OffsetDateTime, Participant, ParticipantId,
        Presence, PresenceStatus, Role, Room, RoomId, RoomStatus, UserId,
    };

    pub fn room(id: &str, owner: &str) -> Room {
        let now = OffsetDateTime::now_utc();
        Room {
            id: RoomId::new(id),
            name: format!("room {id}"),
            description: None,
            owner_id: UserId::new(owner),
            max_participants: 8,
            status: RoomStatus::Active,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn participant(room_id: &str, user: &str, role: Role) -> Participant {
        let now = OffsetDateTime::now_utc();
        Participant {
            id: ParticipantId::generate(),
            room_id: RoomId::new(room_id),
            user_id: UserId::new(user),
            role,
            display_name: user.to_string(),
            color: pick_color(),
            avatar_url: None,
            presence_status: PresenceStatus::Online,
            last_seen: now,
            joined_at: now,
        }
    }

    pub fn document(room_id: &str, path: &str, content: &str) -> Document {
        let mut document = Document {
            id: DocumentId::generate(),
            room_id: RoomId::new(room_id),
            file_path: path.to_string(),
            content: content.to_string(),
            version: 0,
            language: "plaintext".to_string(),
            size_bytes: 0,
            line_count: 0,
            last_operation_at: None,
            metadata: serde_json::Value::Null,
        };
        document.refresh_counters();
        document
    }

    pub fn presence(participant: &Participant) -> Presence {
        Presence {
            participant_id: participant.id.clone(),
            room_id: participant.room_id.clone(),
            status: PresenceStatus::Online,
            current_document: None,
            activity: Activity::Idle,
            last_activity: OffsetDateTime::now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::factories::{insert, padded, replace};
    use pretty_assertions::assert_eq;

    mod position {
        use super::*;
        use pretty_assertions::assert_eq;

        //                     offset   0123456 78901 2345
        //                     column   0123456 01234 0124
        const TEXT: &str = "hallo,\nneue\nwelt";

        #[test]
        fn round_trips_at_line_starts() {
            for (offset, line) in [(0, 0), (7, 1), (12, 2)] {
                let position = Position { line, column: 0 };
                assert_eq!(position.to_offset(TEXT), Some(offset));
                assert_eq!(Position::from_offset(offset, TEXT), Some(position));
            }
        }

        #[test]
        fn columns_count_utf16_units() {
            // '🥕' occupies two code units, so the 'l' after it sits at
            // column 3.
            let text = "h🥕llo\nwelt";
            assert_eq!(
                Position { line: 0, column: 3 }.to_offset(text),
                Some(3),
            );
            assert_eq!(
                Position::from_offset(8, text),
                Some(Position { line: 1, column: 1 })
            );
        }

        #[test]
        fn end_of_text_is_addressable() {
            assert_eq!(
                Position { line: 2, column: 4 }.to_offset(TEXT),
                Some(16)
            );
            assert_eq!(
                Position::from_offset(16, TEXT),
                Some(Position { line: 2, column: 4 })
            );
        }

        #[test]
        fn out_of_bounds_is_none() {
            assert_eq!(Position { line: 3, column: 0 }.to_offset(TEXT), None);
            assert_eq!(Position { line: 0, column: 9 }.to_offset(TEXT), None);
            assert_eq!(Position::from_offset(17, TEXT), None);
        }

        #[test]
        fn trailing_newline_creates_a_last_line() {
            let text = "a\n";
            assert_eq!(
                Position { line: 1, column: 0 }.to_offset(text),
                Some(2)
            );
            assert_eq!(
                Position::from_offset(2, text),
                Some(Position { line: 1, column: 0 })
            );
        }
    }

    mod document_counters {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn counts_bytes_and_lines() {
            let mut document = factories::document("r1", "notes.md", "");
            assert_eq!((document.size_bytes, document.line_count), (0, 1));

            document.content = "a🥕\nb\n".to_string();
            document.refresh_counters();
            assert_eq!(document.size_bytes, 7);
            assert_eq!(document.line_count, 3);
        }
    }

    mod summaries {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn single_insert() {
            let summary = OperationSummary::of(&padded(insert(2, "hey"), 10));
            assert_eq!(
                summary,
                OperationSummary {
                    kind: OperationKind::Insert,
                    position: 2,
                    content: Some("hey".into()),
                    length: 3,
                }
            );
        }

        #[test]
        fn single_delete() {
            let summary = OperationSummary::of(&padded(crate::ot::factories::delete(4, 2), 10));
            assert_eq!(
                summary,
                OperationSummary {
                    kind: OperationKind::Delete,
                    position: 4,
                    content: None,
                    length: 2,
                }
            );
        }

        #[test]
        fn replacement_at_one_site() {
            let summary = OperationSummary::of(&padded(replace(1, 2, "🥕"), 10));
            assert_eq!(
                summary,
                OperationSummary {
                    kind: OperationKind::Replace,
                    position: 1,
                    content: Some("🥕".into()),
                    length: 2,
                }
            );
        }

        #[test]
        fn multiple_sites_are_composite() {
            let mut bundle = insert(0, "a");
            bundle.retain(3);
            bundle.delete(2);
            let summary = OperationSummary::of(&bundle);
            assert_eq!(summary.kind, OperationKind::Composite);
            assert_eq!(summary.position, 0);
        }
    }

    #[test]
    fn generated_ids_are_opaque_and_distinct() {
        let a = RoomId::generate();
        let b = RoomId::generate();
        assert_eq!(a.as_str().len(), 16);
        assert_ne!(a, b);
    }
}
