//! The event-store façade.
//!
//! Coordinates the factory, the validator registry, the storage providers,
//! the projector and the contextor: the append protocol with conflict
//! resolution and idempotent replay, sequence inserts, replay, and the
//! reducer engine with cursor-based snapshot resumption.
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::contextor::Contextor;
use crate::error::{BoxDynError, ConflictReason, Error, StorageError};
use crate::hooks::{Hooks, InsertInfo};
use crate::projector::{ProjectionInfo, Projector};
use crate::provider::{Backend, ReadOptions, Snapshot};
use crate::record::{truncate_to_micros, EventDraft, EventFactory, EventRecord};
use crate::reducer::{Reducer, ReducerScope};
use crate::schema::SchemaSet;
use crate::validator::{EventValidator, ValidatorRegistry};

/// When reducer snapshots are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SnapshotMode {
    /// Snapshots are written only through `create_snapshot`.
    #[default]
    Manual,
    /// Every `reduce` that folded at least one event upserts a snapshot.
    Auto,
}

/// Bound on `(stream, created)` conflict-resolution attempts per append.
const MAX_CREATED_BUMPS: usize = 16;

/// Assembles an [`EventStore`].
pub struct EventStoreBuilder<B> {
    backend: B,
    schemas: SchemaSet,
    projector: Projector,
    contextor: Contextor,
    snapshot_mode: SnapshotMode,
    hooks: Hooks,
}

impl<B: Backend> EventStoreBuilder<B> {
    /// Declares the closed event set.
    pub fn schemas(mut self, schemas: SchemaSet) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn projector(mut self, projector: Projector) -> Self {
        self.projector = projector;
        self
    }

    pub fn contextor(mut self, contextor: Contextor) -> Self {
        self.contextor = contextor;
        self
    }

    pub fn snapshot(mut self, mode: SnapshotMode) -> Self {
        self.snapshot_mode = mode;
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Compiles the validators and freezes the store.
    ///
    /// # Errors
    ///
    /// `Error::Config` when the event set is empty or a schema does not
    /// compile.
    pub fn build(self) -> Result<EventStore<B>, Error> {
        if self.schemas.event_types().next().is_none() {
            return Err(Error::Config("no event types declared".into()));
        }
        Ok(EventStore {
            backend: self.backend,
            registry: ValidatorRegistry::new(&self.schemas)?,
            projector: self.projector,
            contextor: self.contextor,
            factory: EventFactory::new(),
            snapshot_mode: self.snapshot_mode,
            hooks: self.hooks,
        })
    }
}

/// An append-oriented event store.
///
/// Generic over a [`Backend`] providing the events, contexts and snapshots
/// tables. Single calls are one logical thread each; parallel calls from
/// multiple writers are safe, with conflicts resolved per the append
/// protocol.
pub struct EventStore<B: Backend> {
    backend: B,
    registry: ValidatorRegistry,
    projector: Projector,
    contextor: Contextor,
    factory: EventFactory,
    snapshot_mode: SnapshotMode,
    hooks: Hooks,
}

impl<B: Backend> EventStore<B> {
    pub fn builder(backend: B) -> EventStoreBuilder<B> {
        EventStoreBuilder {
            backend,
            schemas: SchemaSet::default(),
            projector: Projector::default(),
            contextor: Contextor::default(),
            snapshot_mode: SnapshotMode::default(),
            hooks: Hooks::default(),
        }
    }

    /// Returns true if the event type is declared.
    pub fn has_event(&self, event_type: &str) -> bool {
        self.registry.has_event(event_type)
    }

    /// Returns the compiled validators of the event type.
    pub fn validator(&self, event_type: &str) -> Option<&EventValidator> {
        self.registry.get(event_type)
    }

    /// Builds a canonical record without persisting it.
    pub fn make_event(&self, draft: EventDraft) -> EventRecord {
        self.factory.make(draft)
    }

    /// Authors and appends one event.
    pub async fn add_event(&self, draft: EventDraft) -> Result<Uuid, Error> {
        self.push_event(self.factory.make(draft), false).await
    }

    /// Authors and appends a sequence of events atomically.
    pub async fn add_event_sequence(
        &self,
        drafts: impl IntoIterator<Item = EventDraft>,
    ) -> Result<Vec<Uuid>, Error> {
        let records = drafts
            .into_iter()
            .map(|draft| self.factory.make(draft))
            .collect();
        self.push_event_sequence(records).await
    }

    /// Appends one record.
    ///
    /// `hydrated` marks records arriving from replication or replay: they
    /// skip the outdatedness probe and never count as outdated. Appending a
    /// record whose id already exists is an idempotent no-op observable only
    /// through the `event_inserted` hook (`existing: true`).
    ///
    /// # Errors
    ///
    /// `Validation`/`UnknownEvent` before any write, `Conflict` after the
    /// retry budget, `Storage` on provider failure. Projection and context
    /// handler failures do not fail the append; they are routed to hooks.
    pub async fn push_event(&self, record: EventRecord, hydrated: bool) -> Result<Uuid, Error> {
        if let Some(existing) = self.find_existing(&record).await? {
            self.hooks.event_inserted(
                &existing,
                InsertInfo {
                    hydrated,
                    outdated: false,
                    existing: true,
                },
            );
            return Ok(existing.id);
        }

        if let Err(error) = self.registry.validate(&record) {
            self.hooks.event_error(&record, &error);
            return Err(error);
        }

        let outdated = if hydrated {
            false
        } else {
            self.backend
                .check_outdated(&record.stream, &record.event_type, record.created)
                .await?
        };

        let record = match self.insert_with_bumps(record).await? {
            Inserted::Fresh(record) => record,
            Inserted::Existing(existing) => {
                self.hooks.event_inserted(
                    &existing,
                    InsertInfo {
                        hydrated,
                        outdated: false,
                        existing: true,
                    },
                );
                return Ok(existing.id);
            }
        };

        let info = ProjectionInfo { hydrated, outdated };
        self.fan_out(&record, info).await;
        self.hooks.event_inserted(
            &record,
            InsertInfo {
                hydrated,
                outdated,
                existing: false,
            },
        );
        tracing::debug!(
            id = %record.id,
            stream = %record.stream,
            event_type = %record.event_type,
            outdated,
            "event inserted"
        );
        Ok(record.id)
    }

    /// Appends a sequence of records as one atomic unit.
    ///
    /// Every record is validated before anything is written or observed; one
    /// invalid record aborts the whole call with zero inserts and zero
    /// `event_inserted` hooks. Fan-out runs only after the atomic insert,
    /// per record in original order, followed by the per-record hooks
    /// (idempotent duplicates included, with `existing: true`).
    pub async fn push_event_sequence(
        &self,
        records: Vec<EventRecord>,
    ) -> Result<Vec<Uuid>, Error> {
        for record in &records {
            if let Err(error) = self.registry.validate(record) {
                self.hooks.event_error(record, &error);
                return Err(error);
            }
        }

        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            match self.find_existing(&record).await? {
                Some(stored) => entries.push(SequenceEntry {
                    record: stored,
                    existing: true,
                    outdated: false,
                }),
                None => {
                    let outdated = self
                        .backend
                        .check_outdated(&record.stream, &record.event_type, record.created)
                        .await?;
                    entries.push(SequenceEntry {
                        record,
                        existing: false,
                        outdated,
                    });
                }
            }
        }

        align_sequence(&mut entries);
        let recorded = truncate_to_micros(Utc::now());
        for entry in entries.iter_mut().filter(|entry| !entry.existing) {
            entry.record.recorded = recorded;
        }

        let mut attempts = 0;
        loop {
            let fresh: Vec<EventRecord> = entries
                .iter()
                .filter(|entry| !entry.existing)
                .map(|entry| entry.record.clone())
                .collect();
            if fresh.is_empty() {
                break;
            }
            match self.backend.insert_many(&fresh).await {
                Ok(()) => break,
                Err(StorageError::DuplicateCreated) if attempts < MAX_CREATED_BUMPS => {
                    attempts += 1;
                    // A concurrent writer took one of the slots; shift the
                    // whole sequence forward, preserving its internal order.
                    for entry in entries.iter_mut().filter(|entry| !entry.existing) {
                        entry.record.bump_created();
                    }
                }
                Err(StorageError::DuplicateCreated) => {
                    return Err(Error::Conflict(ConflictReason::StreamTimestampExhausted))
                }
                Err(StorageError::DuplicateId) if attempts < MAX_CREATED_BUMPS => {
                    attempts += 1;
                    // A concurrent writer inserted one of these ids after
                    // the existence check; reclassify and retry the rest.
                    for entry in entries.iter_mut().filter(|entry| !entry.existing) {
                        if let Some(stored) = self.find_existing(&entry.record).await? {
                            entry.record = stored;
                            entry.existing = true;
                            entry.outdated = false;
                        }
                    }
                }
                Err(error) => return Err(error.into()),
            }
        }

        for entry in &entries {
            if !entry.existing {
                let info = ProjectionInfo {
                    hydrated: false,
                    outdated: entry.outdated,
                };
                self.fan_out(&entry.record, info).await;
            }
            self.hooks.event_inserted(
                &entry.record,
                InsertInfo {
                    hydrated: false,
                    outdated: entry.outdated,
                    existing: entry.existing,
                },
            );
        }

        Ok(entries.iter().map(|entry| entry.record.id).collect())
    }

    /// Re-applies the given records to the projector and contextor, in
    /// order, without inserting anything.
    ///
    /// Replay is additive: the store never resets projection sinks; callers
    /// owning read models reset them before replaying.
    pub async fn replay(&self, records: &[EventRecord]) {
        for record in records {
            let info = ProjectionInfo {
                hydrated: true,
                outdated: false,
            };
            self.fan_out(record, info).await;
        }
    }

    /// Fetches a stream's records and replays them.
    pub async fn replay_stream(&self, stream: &str) -> Result<(), Error> {
        let records = self
            .backend
            .get_by_stream(stream, &ReadOptions::new())
            .await?;
        self.replay(&records).await;
        Ok(())
    }

    /// Fetches a record by id.
    pub async fn get_event(&self, id: Uuid) -> Result<Option<EventRecord>, Error> {
        Ok(self.backend.get_by_id(id).await?)
    }

    /// Fetches records across all streams.
    pub async fn get_events(&self, opts: &ReadOptions) -> Result<Vec<EventRecord>, Error> {
        Ok(self.backend.get(opts).await?)
    }

    /// Fetches the records of one stream in `(created, id)` order.
    pub async fn get_events_by_stream(
        &self,
        stream: &str,
        opts: &ReadOptions,
    ) -> Result<Vec<EventRecord>, Error> {
        Ok(self.backend.get_by_stream(stream, opts).await?)
    }

    /// Fetches the records of every stream associated with the context key,
    /// interleaved in `(created, id)` order.
    pub async fn get_events_by_context(
        &self,
        key: &str,
        opts: &ReadOptions,
    ) -> Result<Vec<EventRecord>, Error> {
        let streams = self.backend.get_by_key(key).await?;
        if streams.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.backend.get_by_streams(&streams, opts).await?)
    }

    /// Derives the reducer's state for the given stream or context key.
    ///
    /// Resumes from the `(reducer.name, key)` snapshot when one exists and
    /// folds only the events past its cursor. Returns `None` when there is
    /// neither a snapshot nor any matching event.
    pub async fn reduce<S>(&self, key: &str, reducer: &Reducer<S>) -> Result<Option<S>, Error>
    where
        S: Clone + Serialize + DeserializeOwned,
    {
        let snapshot = self.backend.load_snapshot(reducer.name(), key).await?;
        let (cursor, state) = match snapshot {
            Some(snapshot) => (
                Some(snapshot.cursor),
                Some(reducer.state_from_value(snapshot.state)?),
            ),
            None => (None, None),
        };

        let events = self.fetch_for(reducer, key, cursor).await?;
        if events.is_empty() {
            return Ok(state);
        }

        let folded = reducer.fold(&events, state)?;
        if self.snapshot_mode == SnapshotMode::Auto {
            self.write_snapshot(reducer, key, &events, &folded).await?;
        }
        Ok(Some(folded))
    }

    /// Recomputes the reducer's state from scratch and stores it as the
    /// snapshot for `(reducer.name, key)`, ignoring any existing snapshot.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` when no matching events exist.
    pub async fn create_snapshot<S>(&self, key: &str, reducer: &Reducer<S>) -> Result<S, Error>
    where
        S: Clone + Serialize + DeserializeOwned,
    {
        let events = self.fetch_for(reducer, key, None).await?;
        if events.is_empty() {
            return Err(Error::NotFound);
        }
        let state = reducer.fold(&events, None)?;
        self.write_snapshot(reducer, key, &events, &state).await?;
        Ok(state)
    }

    /// Removes the snapshot of `(name, key)` unconditionally.
    pub async fn delete_snapshot(&self, name: &str, key: &str) -> Result<(), Error> {
        Ok(self.backend.remove_snapshot(name, key).await?)
    }

    /// Step 1 of the append protocol: idempotent id handling.
    ///
    /// Returns the stored record when an identical one already exists, fails
    /// when the id is taken by a materially different record. Emits no
    /// hooks; callers report the idempotent outcome once they know the whole
    /// operation succeeds.
    async fn find_existing(&self, record: &EventRecord) -> Result<Option<EventRecord>, Error> {
        let Some(existing) = self.backend.get_by_id(record.id).await? else {
            return Ok(None);
        };
        if existing.stream != record.stream
            || existing.event_type != record.event_type
            || existing.data != record.data
            || existing.meta != record.meta
        {
            return Err(Error::Conflict(ConflictReason::IdCollisionDistinctPayload));
        }
        Ok(Some(existing))
    }

    /// Step 4 of the append protocol: insert with bounded `created` bumps.
    async fn insert_with_bumps(&self, mut record: EventRecord) -> Result<Inserted, Error> {
        record.recorded = truncate_to_micros(Utc::now());
        let mut attempts = 0;
        loop {
            match self.backend.insert(&record).await {
                Ok(()) => return Ok(Inserted::Fresh(record)),
                Err(StorageError::DuplicateCreated) if attempts < MAX_CREATED_BUMPS => {
                    attempts += 1;
                    record.bump_created();
                }
                Err(StorageError::DuplicateCreated) => {
                    return Err(Error::Conflict(ConflictReason::StreamTimestampExhausted))
                }
                Err(StorageError::DuplicateId) => {
                    // A concurrent writer inserted this id after the
                    // existence check; reclassify through step 1.
                    return match self.find_existing(&record).await? {
                        Some(existing) => Ok(Inserted::Existing(existing)),
                        None => {
                            Err(Error::Conflict(ConflictReason::IdCollisionDistinctPayload))
                        }
                    };
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Step 5: concurrent fan-out to contextor and projector.
    ///
    /// Both run to completion before the append returns. Handler failures
    /// are routed to hooks; the record is already durable.
    async fn fan_out(&self, record: &EventRecord, info: ProjectionInfo) {
        let mut guard = AbandonGuard {
            id: record.id,
            armed: true,
        };
        let contexts = async {
            for op in self.contextor.ops(record) {
                if let Err(error) = self.backend.handle(&op).await {
                    let error: BoxDynError = Box::new(error);
                    tracing::warn!(id = %record.id, key = %op.key, %error, "context op failed");
                    self.hooks.context_error(record, &error);
                }
            }
        };
        let projections = async {
            for error in self.projector.project(record, info).await {
                tracing::warn!(id = %record.id, %error, "projection handler failed");
                self.hooks.projector_error(record, &error);
            }
        };
        futures::join!(contexts, projections);
        guard.armed = false;
    }

    async fn fetch_for<S>(
        &self,
        reducer: &Reducer<S>,
        key: &str,
        cursor: Option<chrono::DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>, Error>
    where
        S: Clone + Serialize + DeserializeOwned,
    {
        let mut opts = ReadOptions::new();
        if let Some(types) = reducer.type_filter() {
            opts = opts.types(types.iter().cloned());
        }
        if let Some(cursor) = cursor {
            opts = opts.cursor(cursor);
        }
        match reducer.scope() {
            ReducerScope::Stream => Ok(self.backend.get_by_stream(key, &opts).await?),
            ReducerScope::Context => {
                let streams = self.backend.get_by_key(key).await?;
                if streams.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(self.backend.get_by_streams(&streams, &opts).await?)
            }
        }
    }

    async fn write_snapshot<S>(
        &self,
        reducer: &Reducer<S>,
        key: &str,
        events: &[EventRecord],
        state: &S,
    ) -> Result<(), Error>
    where
        S: Clone + Serialize + DeserializeOwned,
    {
        let last = events.last().ok_or(Error::NotFound)?;
        let snapshot = Snapshot {
            name: reducer.name().to_owned(),
            key: key.to_owned(),
            cursor: last.created,
            state: reducer.state_to_value(state)?,
        };
        Ok(self.backend.store_snapshot(&snapshot).await?)
    }
}

/// Outcome of the insert step of the append protocol.
enum Inserted {
    /// The record was written, possibly with a bumped `created`.
    Fresh(EventRecord),
    /// The id turned out to be taken by an identical record.
    Existing(EventRecord),
}

/// One record of a sequence insert, classified during step 1.
struct SequenceEntry {
    record: EventRecord,
    existing: bool,
    outdated: bool,
}

/// Orders a sequence so `(stream, created)` is strictly increasing among its
/// to-be-inserted records, bumping collisions by the minimal step.
fn align_sequence(entries: &mut [SequenceEntry]) {
    for i in 1..entries.len() {
        if entries[i].existing {
            continue;
        }
        let stream = entries[i].record.stream.clone();
        let max_prior = entries[..i]
            .iter()
            .filter(|prior| !prior.existing && prior.record.stream == stream)
            .map(|prior| prior.record.created)
            .max();
        if let Some(max_prior) = max_prior {
            if entries[i].record.created <= max_prior {
                entries[i].record.created = max_prior + chrono::TimeDelta::microseconds(1);
            }
        }
    }
}

/// Logs when a caller abandons the call between commit and fan-out
/// completion. The record is durable either way.
struct AbandonGuard {
    id: Uuid,
    armed: bool,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(id = %self.id, "post-commit abandon: fan-out interrupted");
        }
    }
}
