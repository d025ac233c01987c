//! Error types reported by the store and its storage providers.
use thiserror::Error;

/// A type-erased error, used where handler and backend failures cross the
/// library boundary.
pub type BoxDynError = Box<dyn std::error::Error + 'static + Send + Sync>;

/// Represents all the ways a store operation can fail.
#[derive(Error, Debug)]
pub enum Error {
    /// The record's `data` or `meta` payload does not conform to the schema
    /// registered for its event type.
    #[error("validation failed at `{path}`: {message}")]
    Validation {
        /// JSON pointer into the offending payload.
        path: String,
        /// Human-readable description of the violation.
        message: String,
    },
    /// The record names an event type outside the declared set.
    #[error("unknown event type `{0}`")]
    UnknownEvent(String),
    /// The append gave up after exhausting its conflict-resolution budget.
    #[error("append conflict: {0}")]
    Conflict(ConflictReason),
    /// A lookup that was required to succeed returned nothing.
    #[error("not found")]
    NotFound,
    /// A caller-owned reducer function failed.
    #[error("reducer failed")]
    Handler(#[source] BoxDynError),
    /// A storage provider failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// The store was assembled from inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

/// The reason an append was rejected as a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// A record with the same id but a different payload already exists.
    IdCollisionDistinctPayload,
    /// The `(stream, created)` slot stayed occupied for every candidate
    /// timestamp within the retry budget.
    StreamTimestampExhausted,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictReason::IdCollisionDistinctPayload => f.write_str("id-collision-distinct-payload"),
            ConflictReason::StreamTimestampExhausted => f.write_str("stream-timestamp-exhausted"),
        }
    }
}

/// Represents all the ways a storage provider can fail.
///
/// `DuplicateId` and `DuplicateCreated` are contract-level outcomes the store
/// reacts to (idempotent replay and timestamp bumping respectively); only
/// `Backend` is an actual fault.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A record with the same `id` already exists.
    #[error("duplicate event id")]
    DuplicateId,
    /// A record with the same `(stream, created)` already exists.
    #[error("duplicate (stream, created)")]
    DuplicateCreated,
    /// Error returned from the underlying storage engine.
    #[error(transparent)]
    Backend(#[from] BoxDynError),
}
