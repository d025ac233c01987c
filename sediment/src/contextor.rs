//! Derivation of stream-to-context index entries from events.
//!
//! Users register reducers of shape `(record) -> [ContextOp]` keyed by event
//! type. On push, the contextor collects all ops from all applicable
//! reducers, in registration order, for the store to apply through the
//! context provider. Ops live downstream of the event commit: their failures
//! never roll back the event.
use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::ContextOp;
use crate::record::EventRecord;

/// A registered context reducer.
pub type ContextFn = Arc<dyn Fn(&EventRecord) -> Vec<ContextOp> + Send + Sync>;

/// Collects context reducers into an immutable [`Contextor`].
#[derive(Default)]
pub struct ContextorBuilder {
    reducers: HashMap<String, Vec<ContextFn>>,
}

impl ContextorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reducer for one event type. Multiple reducers per type
    /// are allowed and run in registration order.
    pub fn add<F>(mut self, event_type: impl Into<String>, reducer: F) -> Self
    where
        F: Fn(&EventRecord) -> Vec<ContextOp> + Send + Sync + 'static,
    {
        self.reducers
            .entry(event_type.into())
            .or_default()
            .push(Arc::new(reducer));
        self
    }

    pub fn build(self) -> Contextor {
        Contextor {
            reducers: Arc::new(self.reducers),
        }
    }
}

/// Immutable registry mapping each record to zero or more context ops.
#[derive(Clone, Default)]
pub struct Contextor {
    reducers: Arc<HashMap<String, Vec<ContextFn>>>,
}

impl Contextor {
    pub fn builder() -> ContextorBuilder {
        ContextorBuilder::new()
    }

    /// Collects the ops of all reducers registered for the record's type,
    /// in the order produced.
    pub fn ops(&self, record: &EventRecord) -> Vec<ContextOp> {
        self.reducers
            .get(&record.event_type)
            .into_iter()
            .flatten()
            .flat_map(|reducer| reducer(record))
            .collect()
    }
}
