//! Database initialization for the PostgreSQL backend.
//!
//! Creates the three tables the store persists (events, contexts and
//! snapshots) together with the unique and probe indexes the append
//! protocol relies on. Intended to run during application startup or from
//! dedicated administrative tooling.
use crate::{Error, PgBackend};

/// Helper for initializing the database schema.
pub struct Migrator {
    backend: PgBackend,
}

impl Migrator {
    pub fn new(backend: PgBackend) -> Self {
        Self { backend }
    }

    /// Creates all tables and indexes if they do not exist.
    pub async fn init(&self) -> Result<(), Error> {
        for statement in [
            include_str!("sql/table_event.sql"),
            include_str!("sql/uq_event_stream_created.sql"),
            include_str!("sql/idx_event_stream_type_created.sql"),
            include_str!("sql/table_context.sql"),
            include_str!("sql/idx_context_key.sql"),
            include_str!("sql/table_snapshot.sql"),
        ] {
            sqlx::query(statement).execute(&self.backend.pool).await?;
        }
        Ok(())
    }
}
