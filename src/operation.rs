//! Operation and state records.
//!
//! An [`Operation`] is the unit of ingest and live streaming: an
//! append-only record of one mutation to an external object. An
//! [`ObjectState`] is the latest known payload for one object, with a
//! tombstone for deletions. Both flow to subscribers as a
//! [`StreamEvent`], alongside the `reset`/`live` control events.

use serde::{Deserialize, Serialize};

use crate::ident::OpId;

/// Current wall clock as epoch milliseconds.
#[must_use]
pub fn unix_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Mutation kind carried by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

impl EventKind {
    /// Case-insensitive wire parse (`INSERT|UPDATE|DELETE`).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("insert") {
            Some(Self::Insert)
        } else if s.eq_ignore_ascii_case("update") {
            Some(Self::Update)
        } else if s.eq_ignore_ascii_case("delete") {
            Some(Self::Delete)
        } else {
            None
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Collapse for the state store: updates become inserts, since the
    /// state only encodes "live or tombstoned".
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Update => Self::Insert,
            other => other,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload shared by operations and states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationData {
    /// Object kind (e.g. `video`).
    #[serde(rename = "type")]
    pub object_type: String,
    /// Object identity within its type. Never empty.
    #[serde(rename = "id")]
    pub object_id: String,
    /// `type/id` references to parent objects. May be empty.
    #[serde(default)]
    pub parents: Vec<String>,
    /// Source-side modification time, epoch milliseconds.
    pub timestamp: i64,
    /// URL rendered from the configured template; absent when no
    /// template is configured.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub ref_url: Option<String>,
}

impl OperationData {
    /// Canonical `type/id` key, the state store's primary key.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.object_type, self.object_id)
    }
}

/// One appended mutation record. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub event: EventKind,
    pub data: OperationData,
}

/// Latest known state of one object.
///
/// `event` is `Insert` or `Delete` only; `ts` is the append wall clock
/// recorded by the ingestor (not the source timestamp) and orders
/// replication reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectState {
    #[serde(rename = "_id")]
    pub id: String,
    pub event: EventKind,
    pub ts: i64,
    pub data: OperationData,
}

impl ObjectState {
    /// Wire event id of a replayed state: its decimal `ts`, which parses
    /// back as a replication cursor.
    #[must_use]
    pub fn event_id(&self) -> String {
        self.ts.to_string()
    }
}

/// One event on a subscriber stream: a data event or a control event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Live-tailed operation.
    Operation(Operation),
    /// Replayed state snapshot.
    State(ObjectState),
    /// Full sync is starting; the consumer should clear its database.
    /// Always carries id `"1"` so a reconnect after the reset does not
    /// trigger a second one.
    Reset,
    /// Replication finished; subsequent events are live operations. The
    /// id is the last replayed state's id (or empty when nothing was
    /// replayed), so a consumer that loses the connection right after
    /// `live` resumes replication at that point.
    Live { id: String },
}

impl StreamEvent {
    /// Stable wire id for SSE framing and resume.
    #[must_use]
    pub fn event_id(&self) -> String {
        match self {
            Self::Operation(op) => op.id.to_string(),
            Self::State(state) => state.event_id(),
            Self::Reset => "1".to_string(),
            Self::Live { id } => id.clone(),
        }
    }

    /// SSE `event:` field value.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Operation(op) => op.event.as_str(),
            Self::State(state) => state.event.as_str(),
            Self::Reset => "reset",
            Self::Live { .. } => "live",
        }
    }

    /// Payload for data events; control events carry none.
    #[must_use]
    pub fn data(&self) -> Option<&OperationData> {
        match self {
            Self::Operation(op) => Some(&op.data),
            Self::State(state) => Some(&state.data),
            Self::Reset | Self::Live { .. } => None,
        }
    }
}

/// Object URL template with `{{type}}` and `{{id}}` placeholders.
#[derive(Debug, Clone)]
pub struct UrlTemplate(String);

impl UrlTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self(template.into())
    }

    #[must_use]
    pub fn render(&self, object_type: &str, object_id: &str) -> String {
        self.0
            .replace("{{type}}", object_type)
            .replace("{{id}}", object_id)
    }
}
