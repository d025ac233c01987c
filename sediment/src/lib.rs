#![doc = include_str!("../README.md")]

mod contextor;
mod error;
mod hooks;
pub mod memory;
mod projector;
mod provider;
mod record;
mod reducer;
mod schema;
mod store;
mod validator;

#[doc(inline)]
pub use crate::contextor::{ContextFn, Contextor, ContextorBuilder};
#[doc(inline)]
pub use crate::error::{BoxDynError, ConflictReason, Error, StorageError};
#[doc(inline)]
pub use crate::hooks::{Hooks, InsertInfo};
#[doc(inline)]
pub use crate::projector::{
    ProjectionHandler, ProjectionInfo, Projector, ProjectorBuilder, ProjectorOpts,
};
#[doc(inline)]
pub use crate::provider::{
    Backend, ContextOp, ContextOpKind, ContextProvider, Direction, EventProvider, ReadOptions,
    Snapshot, SnapshotProvider,
};
#[doc(inline)]
pub use crate::record::{EventDraft, EventFactory, EventRecord};
#[doc(inline)]
pub use crate::reducer::{ReduceFn, Reducer, ReducerScope};
#[doc(inline)]
pub use crate::schema::{is_valid_event_type, SchemaSet};
#[doc(inline)]
pub use crate::store::{EventStore, EventStoreBuilder, SnapshotMode};
#[doc(inline)]
pub use crate::validator::{EventValidator, ValidatorRegistry};
