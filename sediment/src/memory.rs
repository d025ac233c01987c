//! In-memory storage backend.
//!
//! Implements the three provider contracts with the same observable
//! semantics as a SQL backend. Intended for tests, examples and ephemeral
//! stores; everything lives in process memory and is lost on drop.
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::StorageError;
use crate::provider::{
    ContextOp, ContextOpKind, ContextProvider, Direction, EventProvider, ReadOptions, Snapshot,
    SnapshotProvider,
};
use crate::record::EventRecord;

/// A complete in-process backend.
#[derive(Default)]
pub struct MemoryBackend {
    events: RwLock<Vec<EventRecord>>,
    contexts: RwLock<Vec<ContextOp>>,
    snapshots: RwLock<HashMap<(String, String), Snapshot>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn conflict(events: &[EventRecord], record: &EventRecord) -> Option<StorageError> {
        if events.iter().any(|existing| existing.id == record.id) {
            return Some(StorageError::DuplicateId);
        }
        if events
            .iter()
            .any(|existing| existing.stream == record.stream && existing.created == record.created)
        {
            return Some(StorageError::DuplicateCreated);
        }
        None
    }

    fn select(
        events: &[EventRecord],
        streams: Option<&[String]>,
        opts: &ReadOptions,
    ) -> Vec<EventRecord> {
        let mut selected: Vec<EventRecord> = events
            .iter()
            .filter(|record| {
                streams.is_none_or(|streams| streams.contains(&record.stream))
            })
            .filter(|record| {
                opts.types
                    .as_ref()
                    .is_none_or(|types| types.contains(&record.event_type))
            })
            .filter(|record| match (opts.cursor, opts.direction) {
                (Some(cursor), Direction::Asc) => record.created > cursor,
                (Some(cursor), Direction::Desc) => record.created < cursor,
                (None, _) => true,
            })
            .cloned()
            .collect();
        selected.sort_by(|a, b| (a.created, a.id).cmp(&(b.created, b.id)));
        if opts.direction == Direction::Desc {
            selected.reverse();
        }
        selected
    }
}

#[async_trait]
impl EventProvider for MemoryBackend {
    async fn insert(&self, record: &EventRecord) -> Result<(), StorageError> {
        let mut events = self.events.write();
        if let Some(conflict) = Self::conflict(&events, record) {
            return Err(conflict);
        }
        events.push(record.clone());
        Ok(())
    }

    async fn insert_many(&self, records: &[EventRecord]) -> Result<(), StorageError> {
        let mut events = self.events.write();
        // All-or-nothing: probe the whole batch before touching the log.
        for (i, record) in records.iter().enumerate() {
            if let Some(conflict) = Self::conflict(&events, record) {
                return Err(conflict);
            }
            if let Some(conflict) = Self::conflict(&records[..i], record) {
                return Err(conflict);
            }
        }
        events.extend(records.iter().cloned());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<EventRecord>, StorageError> {
        Ok(self
            .events
            .read()
            .iter()
            .find(|record| record.id == id)
            .cloned())
    }

    async fn get(&self, opts: &ReadOptions) -> Result<Vec<EventRecord>, StorageError> {
        Ok(Self::select(&self.events.read(), None, opts))
    }

    async fn get_by_stream(
        &self,
        stream: &str,
        opts: &ReadOptions,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let streams = [stream.to_owned()];
        Ok(Self::select(&self.events.read(), Some(&streams), opts))
    }

    async fn get_by_streams(
        &self,
        streams: &[String],
        opts: &ReadOptions,
    ) -> Result<Vec<EventRecord>, StorageError> {
        Ok(Self::select(&self.events.read(), Some(streams), opts))
    }

    async fn check_outdated(
        &self,
        stream: &str,
        event_type: &str,
        created: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        Ok(self.events.read().iter().any(|record| {
            record.stream == stream
                && record.event_type == event_type
                && record.created > created
        }))
    }
}

#[async_trait]
impl ContextProvider for MemoryBackend {
    async fn handle(&self, op: &ContextOp) -> Result<(), StorageError> {
        self.contexts.write().push(op.clone());
        Ok(())
    }

    async fn get_by_key(&self, key: &str) -> Result<Vec<String>, StorageError> {
        let mut streams: Vec<String> = Vec::new();
        for op in self.contexts.read().iter().filter(|op| op.key == key) {
            match op.op {
                ContextOpKind::Insert => {
                    if !streams.contains(&op.stream) {
                        streams.push(op.stream.clone());
                    }
                }
                ContextOpKind::Remove => streams.retain(|stream| stream != &op.stream),
            }
        }
        Ok(streams)
    }
}

#[async_trait]
impl SnapshotProvider for MemoryBackend {
    async fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.snapshots.write().insert(
            (snapshot.name.clone(), snapshot.key.clone()),
            snapshot.clone(),
        );
        Ok(())
    }

    async fn load_snapshot(
        &self,
        name: &str,
        key: &str,
    ) -> Result<Option<Snapshot>, StorageError> {
        Ok(self
            .snapshots
            .read()
            .get(&(name.to_owned(), key.to_owned()))
            .cloned())
    }

    async fn remove_snapshot(&self, name: &str, key: &str) -> Result<(), StorageError> {
        self.snapshots
            .write()
            .remove(&(name.to_owned(), key.to_owned()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EventDraft, EventFactory};
    use assert2::let_assert;
    use serde_json::json;

    fn factory() -> EventFactory {
        EventFactory::new()
    }

    fn record(factory: &EventFactory, stream: &str, event_type: &str) -> EventRecord {
        factory.make(EventDraft::new(event_type).stream(stream))
    }

    #[tokio::test]
    async fn it_rejects_duplicate_ids() {
        let backend = MemoryBackend::new();
        let record = record(&factory(), "s1", "user:created");
        backend.insert(&record).await.unwrap();
        let mut duplicate = record.clone();
        duplicate.bump_created();
        let_assert!(Err(StorageError::DuplicateId) = backend.insert(&duplicate).await);
    }

    #[tokio::test]
    async fn it_rejects_duplicate_stream_created_pairs() {
        let backend = MemoryBackend::new();
        let factory = factory();
        let first = record(&factory, "s1", "user:created");
        backend.insert(&first).await.unwrap();
        let mut second = record(&factory, "s1", "user:created");
        second.created = first.created;
        let_assert!(Err(StorageError::DuplicateCreated) = backend.insert(&second).await);
    }

    #[tokio::test]
    async fn it_inserts_batches_atomically() {
        let backend = MemoryBackend::new();
        let factory = factory();
        let first = record(&factory, "s1", "user:created");
        let mut clash = record(&factory, "s1", "user:created");
        clash.created = first.created;
        let result = backend.insert_many(&[first, clash]).await;
        let_assert!(Err(StorageError::DuplicateCreated) = result);
        assert!(backend.get(&ReadOptions::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn it_orders_by_created_then_id() {
        let backend = MemoryBackend::new();
        let factory = factory();
        let records: Vec<_> = (0..5)
            .map(|_| record(&factory, "s1", "user:created"))
            .collect();
        // Insert out of order.
        for record in records.iter().rev() {
            backend.insert(record).await.unwrap();
        }
        let fetched = backend
            .get_by_stream("s1", &ReadOptions::new())
            .await
            .unwrap();
        assert_eq!(fetched, records);

        let descending = backend
            .get_by_stream("s1", &ReadOptions::new().direction(Direction::Desc))
            .await
            .unwrap();
        let reversed: Vec<_> = records.iter().rev().cloned().collect();
        assert_eq!(descending, reversed);
    }

    #[tokio::test]
    async fn it_applies_cursor_and_type_filters() {
        let backend = MemoryBackend::new();
        let factory = factory();
        let a = record(&factory, "s1", "user:created");
        let b = record(&factory, "s1", "user:email-set");
        let c = record(&factory, "s1", "user:email-set");
        for record in [&a, &b, &c] {
            backend.insert(record).await.unwrap();
        }

        let after_a = backend
            .get_by_stream("s1", &ReadOptions::new().cursor(a.created))
            .await
            .unwrap();
        assert_eq!(after_a, [b.clone(), c.clone()]);

        let only_email = backend
            .get_by_stream("s1", &ReadOptions::new().types(["user:email-set"]))
            .await
            .unwrap();
        assert_eq!(only_email, [b, c]);
    }

    #[tokio::test]
    async fn it_detects_outdated_records() {
        let backend = MemoryBackend::new();
        let factory = factory();
        let newest = record(&factory, "s1", "user:created");
        backend.insert(&newest).await.unwrap();

        let earlier = newest.created - chrono::TimeDelta::microseconds(1);
        assert!(backend
            .check_outdated("s1", "user:created", earlier)
            .await
            .unwrap());
        assert!(!backend
            .check_outdated("s1", "user:created", newest.created)
            .await
            .unwrap());
        assert!(!backend
            .check_outdated("s1", "user:email-set", earlier)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn it_replays_context_ops_into_the_current_set() {
        let backend = MemoryBackend::new();
        for op in [
            ContextOp::remove("t1", "u0"),
            ContextOp::insert("t1", "u1"),
            ContextOp::insert("t1", "u2"),
            ContextOp::insert("t1", "u1"),
            ContextOp::remove("t1", "u2"),
            ContextOp::insert("t2", "u3"),
        ] {
            backend.handle(&op).await.unwrap();
        }
        assert_eq!(backend.get_by_key("t1").await.unwrap(), ["u1"]);
        assert_eq!(backend.get_by_key("t2").await.unwrap(), ["u3"]);
        assert!(backend.get_by_key("t3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn it_upserts_snapshots() {
        let backend = MemoryBackend::new();
        let factory = factory();
        let cursor = record(&factory, "s1", "user:created").created;
        let snapshot = Snapshot {
            name: "counter".into(),
            key: "s1".into(),
            cursor,
            state: json!({"n": 1}),
        };
        backend.store_snapshot(&snapshot).await.unwrap();
        let replaced = Snapshot {
            state: json!({"n": 2}),
            ..snapshot.clone()
        };
        backend.store_snapshot(&replaced).await.unwrap();
        assert_eq!(
            backend.load_snapshot("counter", "s1").await.unwrap(),
            Some(replaced)
        );
        backend.remove_snapshot("counter", "s1").await.unwrap();
        assert_eq!(backend.load_snapshot("counter", "s1").await.unwrap(), None);
    }
}
