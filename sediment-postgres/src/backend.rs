//! PostgreSQL storage backend.
//!
//! Implements the event, context and snapshot provider contracts on a
//! `sqlx` connection pool. Unique violations are mapped onto the contract
//! outcomes by constraint name, batch inserts run inside a single
//! transaction, and all event queries are ordered by `(created, id)`.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};
use uuid::Uuid;

use sediment::{
    ContextOp, ContextOpKind, ContextProvider, Direction, EventProvider, EventRecord,
    ReadOptions, Snapshot, SnapshotProvider, StorageError,
};

use crate::error::map_storage_err;
use crate::{Error, Migrator};

/// Rows per INSERT statement within a batch transaction.
const INSERT_BATCH_SIZE: usize = 1000;

/// PostgreSQL implementation of the three storage provider contracts.
#[derive(Clone)]
pub struct PgBackend {
    pub(crate) pool: PgPool,
}

impl PgBackend {
    /// Initializes the database schema and returns a new `PgBackend`.
    pub async fn try_new(pool: PgPool) -> Result<Self, Error> {
        let backend = Self::new_uninitialized(pool);
        Migrator::new(backend.clone()).init().await?;
        Ok(backend)
    }

    /// Creates a new `PgBackend` without touching the database.
    ///
    /// The schema must already exist; see the SQL files in `src/sql` or run
    /// [`Migrator::init`].
    pub fn new_uninitialized(pool: PgPool) -> Self {
        Self { pool }
    }

    fn select_events<'a>(
        streams: Option<&'a [String]>,
        opts: &'a ReadOptions,
    ) -> QueryBuilder<'a, Postgres> {
        let mut builder = QueryBuilder::new(
            "SELECT id, stream, event_type, data, meta, created, recorded FROM event WHERE TRUE",
        );
        if let Some(streams) = streams {
            builder.push(" AND stream = ANY(");
            builder.push_bind(streams);
            builder.push(")");
        }
        if let Some(types) = &opts.types {
            builder.push(" AND event_type = ANY(");
            builder.push_bind(types.as_slice());
            builder.push(")");
        }
        if let Some(cursor) = opts.cursor {
            match opts.direction {
                Direction::Asc => builder.push(" AND created > "),
                Direction::Desc => builder.push(" AND created < "),
            };
            builder.push_bind(cursor);
        }
        builder.push(match opts.direction {
            Direction::Asc => " ORDER BY created ASC, id ASC",
            Direction::Desc => " ORDER BY created DESC, id DESC",
        });
        builder
    }

    async fn fetch_events(
        &self,
        streams: Option<&[String]>,
        opts: &ReadOptions,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let mut builder = Self::select_events(streams, opts);
        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(map_storage_err)?;
        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &PgRow) -> Result<EventRecord, StorageError> {
    Ok(EventRecord {
        id: row.try_get("id").map_err(map_storage_err)?,
        stream: row.try_get("stream").map_err(map_storage_err)?,
        event_type: row.try_get("event_type").map_err(map_storage_err)?,
        data: row.try_get("data").map_err(map_storage_err)?,
        meta: row.try_get("meta").map_err(map_storage_err)?,
        created: row.try_get("created").map_err(map_storage_err)?,
        recorded: row.try_get("recorded").map_err(map_storage_err)?,
    })
}

fn op_name(op: ContextOpKind) -> &'static str {
    match op {
        ContextOpKind::Insert => "insert",
        ContextOpKind::Remove => "remove",
    }
}

#[async_trait]
impl EventProvider for PgBackend {
    async fn insert(&self, record: &EventRecord) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO event (id, stream, event_type, data, meta, created, recorded)
            VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(record.id)
        .bind(&record.stream)
        .bind(&record.event_type)
        .bind(&record.data)
        .bind(&record.meta)
        .bind(record.created)
        .bind(record.recorded)
        .execute(&self.pool)
        .await
        .map_err(map_storage_err)?;
        Ok(())
    }

    async fn insert_many(&self, records: &[EventRecord]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(map_storage_err)?;
        for chunk in records.chunks(INSERT_BATCH_SIZE) {
            let mut builder = QueryBuilder::new(
                "INSERT INTO event (id, stream, event_type, data, meta, created, recorded) ",
            );
            builder.push_values(chunk, |mut b, record| {
                b.push_bind(record.id);
                b.push_bind(&record.stream);
                b.push_bind(&record.event_type);
                b.push_bind(&record.data);
                b.push_bind(&record.meta);
                b.push_bind(record.created);
                b.push_bind(record.recorded);
            });
            builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(map_storage_err)?;
        }
        tx.commit().await.map_err(map_storage_err)?;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<EventRecord>, StorageError> {
        let row = sqlx::query(
            "SELECT id, stream, event_type, data, meta, created, recorded
            FROM event WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_storage_err)?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn get(&self, opts: &ReadOptions) -> Result<Vec<EventRecord>, StorageError> {
        self.fetch_events(None, opts).await
    }

    async fn get_by_stream(
        &self,
        stream: &str,
        opts: &ReadOptions,
    ) -> Result<Vec<EventRecord>, StorageError> {
        let streams = [stream.to_owned()];
        self.fetch_events(Some(&streams), opts).await
    }

    async fn get_by_streams(
        &self,
        streams: &[String],
        opts: &ReadOptions,
    ) -> Result<Vec<EventRecord>, StorageError> {
        if streams.is_empty() {
            return Ok(Vec::new());
        }
        self.fetch_events(Some(streams), opts).await
    }

    async fn check_outdated(
        &self,
        stream: &str,
        event_type: &str,
        created: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        sqlx::query_scalar(
            "SELECT EXISTS (
                SELECT 1 FROM event
                WHERE stream = $1 AND event_type = $2 AND created > $3
            )",
        )
        .bind(stream)
        .bind(event_type)
        .bind(created)
        .fetch_one(&self.pool)
        .await
        .map_err(map_storage_err)
    }
}

#[async_trait]
impl ContextProvider for PgBackend {
    async fn handle(&self, op: &ContextOp) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO context (key, op, stream) VALUES ($1, $2, $3)")
            .bind(&op.key)
            .bind(op_name(op.op))
            .bind(&op.stream)
            .execute(&self.pool)
            .await
            .map_err(map_storage_err)?;
        Ok(())
    }

    async fn get_by_key(&self, key: &str) -> Result<Vec<String>, StorageError> {
        sqlx::query_scalar(
            "SELECT stream FROM (
                SELECT DISTINCT ON (stream) stream, op
                FROM context WHERE key = $1
                ORDER BY stream, seq DESC
            ) latest WHERE op = 'insert' ORDER BY stream",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(map_storage_err)
    }
}

#[async_trait]
impl SnapshotProvider for PgBackend {
    async fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO snapshot (name, key, cursor, state) VALUES ($1, $2, $3, $4)
            ON CONFLICT (name, key) DO UPDATE SET cursor = $3, state = $4",
        )
        .bind(&snapshot.name)
        .bind(&snapshot.key)
        .bind(snapshot.cursor)
        .bind(&snapshot.state)
        .execute(&self.pool)
        .await
        .map_err(map_storage_err)?;
        Ok(())
    }

    async fn load_snapshot(
        &self,
        name: &str,
        key: &str,
    ) -> Result<Option<Snapshot>, StorageError> {
        let row = sqlx::query("SELECT cursor, state FROM snapshot WHERE name = $1 AND key = $2")
            .bind(name)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_storage_err)?;
        row.map(|row| {
            Ok(Snapshot {
                name: name.to_owned(),
                key: key.to_owned(),
                cursor: row.try_get("cursor").map_err(map_storage_err)?,
                state: row.try_get::<Value, _>("state").map_err(map_storage_err)?,
            })
        })
        .transpose()
    }

    async fn remove_snapshot(&self, name: &str, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM snapshot WHERE name = $1 AND key = $2")
            .bind(name)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(map_storage_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::let_assert;
    use sediment::{EventDraft, EventFactory};
    use serde_json::json;

    fn factory() -> EventFactory {
        EventFactory::new()
    }

    fn record(factory: &EventFactory, stream: &str, event_type: &str) -> EventRecord {
        factory.make(
            EventDraft::new(event_type)
                .stream(stream)
                .data(json!({"n": 1}))
                .meta(json!({"actor": "test"})),
        )
    }

    #[sqlx::test]
    async fn it_round_trips_records(pool: PgPool) {
        let backend = PgBackend::try_new(pool).await.unwrap();
        let record = record(&factory(), "s1", "user:created");
        backend.insert(&record).await.unwrap();

        let fetched = backend.get_by_id(record.id).await.unwrap();
        assert_eq!(fetched, Some(record.clone()));

        let fetched = backend
            .get_by_stream("s1", &ReadOptions::new())
            .await
            .unwrap();
        assert_eq!(fetched, [record]);
    }

    #[sqlx::test]
    async fn it_maps_unique_violations(pool: PgPool) {
        let backend = PgBackend::try_new(pool).await.unwrap();
        let factory = factory();
        let first = record(&factory, "s1", "user:created");
        backend.insert(&first).await.unwrap();

        let_assert!(Err(StorageError::DuplicateId) = backend.insert(&first).await);

        let mut clash = record(&factory, "s1", "user:created");
        clash.created = first.created;
        let_assert!(Err(StorageError::DuplicateCreated) = backend.insert(&clash).await);
    }

    #[sqlx::test]
    async fn it_inserts_batches_atomically(pool: PgPool) {
        let backend = PgBackend::try_new(pool).await.unwrap();
        let factory = factory();
        let first = record(&factory, "s1", "user:created");
        let mut clash = record(&factory, "s1", "user:created");
        clash.created = first.created;

        let result = backend.insert_many(&[first, clash]).await;
        let_assert!(Err(StorageError::DuplicateCreated) = result);
        assert!(backend.get(&ReadOptions::new()).await.unwrap().is_empty());
    }

    #[sqlx::test]
    async fn it_orders_and_filters_queries(pool: PgPool) {
        let backend = PgBackend::try_new(pool).await.unwrap();
        let factory = factory();
        let a = record(&factory, "s1", "user:created");
        let b = record(&factory, "s2", "user:email-set");
        let c = record(&factory, "s1", "user:email-set");
        backend.insert_many(&[a.clone(), b.clone(), c.clone()]).await.unwrap();

        let all = backend.get(&ReadOptions::new()).await.unwrap();
        assert_eq!(all, [a.clone(), b.clone(), c.clone()]);

        let by_streams = backend
            .get_by_streams(&["s1".into(), "s2".into()], &ReadOptions::new().cursor(a.created))
            .await
            .unwrap();
        assert_eq!(by_streams, [b.clone(), c.clone()]);

        let descending = backend
            .get(
                &ReadOptions::new()
                    .types(["user:email-set"])
                    .direction(Direction::Desc),
            )
            .await
            .unwrap();
        assert_eq!(descending, [c, b]);
    }

    #[sqlx::test]
    async fn it_checks_outdatedness(pool: PgPool) {
        let backend = PgBackend::try_new(pool).await.unwrap();
        let newest = record(&factory(), "s1", "user:created");
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
            .check_outdated("s2", "user:created", earlier)
            .await
            .unwrap());
    }

    #[sqlx::test]
    async fn it_derives_context_membership(pool: PgPool) {
        let backend = PgBackend::try_new(pool).await.unwrap();
        for op in [
            ContextOp::remove("t1", "u0"),
            ContextOp::insert("t1", "u1"),
            ContextOp::insert("t1", "u2"),
            ContextOp::remove("t1", "u2"),
            ContextOp::insert("t2", "u3"),
        ] {
            backend.handle(&op).await.unwrap();
        }
        assert_eq!(backend.get_by_key("t1").await.unwrap(), ["u1"]);
        assert_eq!(backend.get_by_key("t2").await.unwrap(), ["u3"]);
        assert!(backend.get_by_key("t3").await.unwrap().is_empty());
    }

    #[sqlx::test]
    async fn it_upserts_and_removes_snapshots(pool: PgPool) {
        let backend = PgBackend::try_new(pool).await.unwrap();
        let cursor = record(&factory(), "s1", "user:created").created;
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
