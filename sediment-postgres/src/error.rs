use sediment::StorageError;
use thiserror::Error;

/// Represents all the ways a method can fail within Sediment Postgres.
#[derive(Error, Debug)]
pub enum Error {
    /// Error returned from the database.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Maps a database failure onto the provider contract.
///
/// SQLSTATE 23505 unique violations are distinguished by constraint name:
/// the id primary key and the `(stream, created)` index are contract-level
/// outcomes, everything else is a backend fault.
pub(crate) fn map_storage_err(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(ref description) = err {
        if description.code().as_deref() == Some("23505") {
            match description.constraint() {
                Some("event_pkey") => return StorageError::DuplicateId,
                Some("uq_event_stream_created") => return StorageError::DuplicateCreated,
                _ => {}
            }
        }
    }
    StorageError::Backend(Box::new(err))
}
