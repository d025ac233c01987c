//! Storage provider contracts.
//!
//! The store persists three tables: events, contexts and snapshots. Each is
//! specified as a trait so any embedded or server SQL engine can back it.
//! Implementations must be safe to call from concurrent writers; the store
//! façade is responsible for transactional composition.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::StorageError;
use crate::record::EventRecord;

/// Read direction for event queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// Options applied to every event query.
///
/// Results are always ordered by `(created, id)` in the requested direction.
/// The cursor is exclusive: strictly `>` when ascending, strictly `<` when
/// descending.
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Restrict to these event types.
    pub types: Option<Vec<String>>,
    /// Resume after this `created` value.
    pub cursor: Option<DateTime<Utc>>,
    pub direction: Direction,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn cursor(mut self, cursor: DateTime<Utc>) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }
}

/// Persists and queries the events table.
#[async_trait]
pub trait EventProvider: Send + Sync {
    /// Appends one record.
    ///
    /// Fails with `StorageError::DuplicateId` or
    /// `StorageError::DuplicateCreated` on the respective unique violations.
    async fn insert(&self, record: &EventRecord) -> Result<(), StorageError>;

    /// Appends a batch of records, atomic over the whole set.
    ///
    /// Internal batching is an implementation concern; externally the call
    /// is observable as a single transaction.
    async fn insert_many(&self, records: &[EventRecord]) -> Result<(), StorageError>;

    /// Fetches a record by id.
    async fn get_by_id(&self, id: Uuid) -> Result<Option<EventRecord>, StorageError>;

    /// Fetches records across all streams.
    async fn get(&self, opts: &ReadOptions) -> Result<Vec<EventRecord>, StorageError>;

    /// Fetches the records of one stream.
    async fn get_by_stream(
        &self,
        stream: &str,
        opts: &ReadOptions,
    ) -> Result<Vec<EventRecord>, StorageError>;

    /// Fetches the records of a set of streams, interleaved in
    /// `(created, id)` order.
    async fn get_by_streams(
        &self,
        streams: &[String],
        opts: &ReadOptions,
    ) -> Result<Vec<EventRecord>, StorageError>;

    /// Returns true iff a record with the same stream and type exists with
    /// strictly greater `created`.
    async fn check_outdated(
        &self,
        stream: &str,
        event_type: &str,
        created: DateTime<Utc>,
    ) -> Result<bool, StorageError>;
}

/// The operation kind of a context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextOpKind {
    Insert,
    Remove,
}

/// A single stream-to-context index operation.
///
/// The logical set of streams under a key is the sequential replay of its
/// ops; removing an entry that was never inserted is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextOp {
    pub key: String,
    pub op: ContextOpKind,
    pub stream: String,
}

impl ContextOp {
    /// An `insert` op associating `stream` with `key`.
    pub fn insert(key: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: ContextOpKind::Insert,
            stream: stream.into(),
        }
    }

    /// A `remove` op dissociating `stream` from `key`.
    pub fn remove(key: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: ContextOpKind::Remove,
            stream: stream.into(),
        }
    }
}

/// Persists and queries the contexts table, an append-only stream-keyed
/// secondary index.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    /// Appends one insert/remove entry.
    async fn handle(&self, op: &ContextOp) -> Result<(), StorageError>;

    /// Returns the distinct streams currently associated with the key.
    async fn get_by_key(&self, key: &str) -> Result<Vec<String>, StorageError>;
}

/// A reducer state checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The reducer that produced the state.
    pub name: String,
    /// The stream or context key the state was folded over.
    pub key: String,
    /// The `created` of the last folded event.
    pub cursor: DateTime<Utc>,
    /// The reducer's opaque state value.
    pub state: Value,
}

/// Persists and queries the snapshots table. At most one snapshot exists per
/// `(name, key)`; writes replace any existing row.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Upserts a snapshot.
    async fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Fetches the snapshot of `(name, key)`.
    async fn load_snapshot(&self, name: &str, key: &str)
        -> Result<Option<Snapshot>, StorageError>;

    /// Removes the snapshot of `(name, key)` if present.
    async fn remove_snapshot(&self, name: &str, key: &str) -> Result<(), StorageError>;
}

/// A complete storage backend: all three provider contracts.
pub trait Backend: EventProvider + ContextProvider + SnapshotProvider {}

impl<T> Backend for T where T: EventProvider + ContextProvider + SnapshotProvider {}
