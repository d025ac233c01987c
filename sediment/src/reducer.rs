//! Left-fold state derivation.
//!
//! A reducer is an immutable descriptor: a name, a scope (fold over one
//! stream or over a context), an optional type filter, an initial state and
//! a pure fold function. The store runs the fold, optionally resuming from a
//! snapshot cursor.
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{BoxDynError, Error, StorageError};
use crate::record::EventRecord;

/// What the reducer's key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducerScope {
    /// Fold the events of one stream.
    Stream,
    /// Fold the events of every stream associated with a context key.
    Context,
}

/// The caller-owned fold function.
pub type ReduceFn<S> = Arc<dyn Fn(&[EventRecord], S) -> Result<S, BoxDynError> + Send + Sync>;

/// An immutable left-fold descriptor producing state of type `S`.
#[derive(Clone)]
pub struct Reducer<S> {
    name: &'static str,
    scope: ReducerScope,
    types: Option<Vec<String>>,
    initial_state: S,
    reduce: ReduceFn<S>,
}

impl<S> Reducer<S>
where
    S: Clone + Serialize + DeserializeOwned,
{
    /// A reducer folding the events of one stream.
    pub fn stream<F>(name: &'static str, initial_state: S, reduce: F) -> Self
    where
        F: Fn(&[EventRecord], S) -> Result<S, BoxDynError> + Send + Sync + 'static,
    {
        Self::new(name, ReducerScope::Stream, initial_state, reduce)
    }

    /// A reducer folding the events of a context.
    pub fn context<F>(name: &'static str, initial_state: S, reduce: F) -> Self
    where
        F: Fn(&[EventRecord], S) -> Result<S, BoxDynError> + Send + Sync + 'static,
    {
        Self::new(name, ReducerScope::Context, initial_state, reduce)
    }

    fn new<F>(name: &'static str, scope: ReducerScope, initial_state: S, reduce: F) -> Self
    where
        F: Fn(&[EventRecord], S) -> Result<S, BoxDynError> + Send + Sync + 'static,
    {
        Self {
            name,
            scope,
            types: None,
            initial_state,
            reduce: Arc::new(reduce),
        }
    }

    /// Restricts the fold to the given event types.
    pub fn types(mut self, types: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn scope(&self) -> ReducerScope {
        self.scope
    }

    pub fn type_filter(&self) -> Option<&[String]> {
        self.types.as_deref()
    }

    pub fn initial_state(&self) -> S {
        self.initial_state.clone()
    }

    /// Runs the fold over `events`, starting from `state` or from the
    /// initial state.
    ///
    /// # Errors
    ///
    /// A failure of the caller-owned fold function surfaces as
    /// `Error::Handler`.
    pub fn fold(&self, events: &[EventRecord], state: Option<S>) -> Result<S, Error> {
        let state = state.unwrap_or_else(|| self.initial_state.clone());
        (self.reduce)(events, state).map_err(Error::Handler)
    }

    pub(crate) fn state_from_value(&self, value: Value) -> Result<S, Error> {
        serde_json::from_value(value)
            .map_err(|e| Error::Storage(StorageError::Backend(Box::new(e))))
    }

    pub(crate) fn state_to_value(&self, state: &S) -> Result<Value, Error> {
        serde_json::to_value(state)
            .map_err(|e| Error::Storage(StorageError::Backend(Box::new(e))))
    }
}
