//! Event records and the factory that authors them.
//!
//! An event record is an immutable, validated entry in the event log. The
//! factory builds canonical records from caller input: it assigns a
//! time-ordered id, a monotonic `created` timestamp and the default stream
//! name. It performs no I/O and no validation.
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// An immutable entry in the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Globally unique, time-ordered identifier.
    pub id: Uuid,
    /// Opaque name of the aggregate the event belongs to.
    pub stream: String,
    /// One value from the closed set declared at store construction.
    pub event_type: String,
    /// Structured payload conforming to the data schema for `event_type`.
    pub data: Value,
    /// Structured metadata conforming to the meta schema for `event_type`.
    pub meta: Value,
    /// Per-stream ordering key and global cursor, microsecond precision.
    pub created: DateTime<Utc>,
    /// Server-side acceptance time, stamped at insert.
    pub recorded: DateTime<Utc>,
}

impl EventRecord {
    /// Advances `created` by the smallest representable step.
    ///
    /// Used by the append path to resolve `(stream, created)` collisions
    /// while preserving per-stream total order.
    pub(crate) fn bump_created(&mut self) {
        self.created += TimeDelta::microseconds(1);
    }
}

/// Caller input for authoring a new record.
///
/// Everything but the event type is optional: a missing stream defaults to a
/// fresh unique id, missing payloads default to empty objects.
#[derive(Debug, Clone, Default)]
pub struct EventDraft {
    pub event_type: String,
    pub stream: Option<String>,
    pub data: Option<Value>,
    pub meta: Option<Value>,
}

impl EventDraft {
    /// Creates a draft for the given event type with empty payloads.
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            ..Default::default()
        }
    }

    /// Sets the target stream.
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Sets the data payload.
    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Sets the metadata payload.
    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Builds canonical records from drafts.
///
/// `created` timestamps issued by one factory are strictly increasing even
/// when the wall clock stalls or steps backwards, so records authored through
/// the same store always satisfy the per-stream ordering invariant.
#[derive(Debug, Default)]
pub struct EventFactory {
    last_issued: Mutex<Option<DateTime<Utc>>>,
}

impl EventFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a record from the given draft.
    ///
    /// Assigns a v7 uuid, a monotonic `created` and `recorded = created`;
    /// the server overwrites `recorded` at insert.
    pub fn make(&self, draft: EventDraft) -> EventRecord {
        let created = self.next_created();
        EventRecord {
            id: Uuid::now_v7(),
            stream: draft
                .stream
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
            event_type: draft.event_type,
            data: draft.data.unwrap_or_else(empty_object),
            meta: draft.meta.unwrap_or_else(empty_object),
            created,
            recorded: created,
        }
    }

    fn next_created(&self) -> DateTime<Utc> {
        let now = truncate_to_micros(Utc::now());
        let mut last = self.last_issued.lock();
        let next = match *last {
            Some(prev) if now <= prev => prev + TimeDelta::microseconds(1),
            _ => now,
        };
        *last = Some(next);
        next
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Drops sub-microsecond precision so timestamps round-trip unchanged
/// through microsecond-resolution storage.
pub(crate) fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}
