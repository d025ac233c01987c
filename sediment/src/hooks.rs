//! Store hooks.
//!
//! A single struct of optional callbacks, invoked synchronously on the
//! append path. Handler failures are routed here instead of failing the
//! append, since the record is already durable by the time they run.
use crate::error::{BoxDynError, Error};
use crate::record::EventRecord;

/// How a record was accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertInfo {
    /// The record was re-applied rather than newly authored.
    pub hydrated: bool,
    /// The record's `created` precedes an existing record of the same
    /// stream and type.
    pub outdated: bool,
    /// A record with this id already existed; nothing was written.
    pub existing: bool,
}

type InsertedHook = Box<dyn Fn(&EventRecord, InsertInfo) + Send + Sync>;
type ErrorHook = Box<dyn Fn(&EventRecord, &Error) + Send + Sync>;
type HandlerErrorHook = Box<dyn Fn(&EventRecord, &BoxDynError) + Send + Sync>;

/// Optional callbacks surfaced by the store.
#[derive(Default)]
pub struct Hooks {
    event_inserted: Option<InsertedHook>,
    event_error: Option<ErrorHook>,
    projector_error: Option<HandlerErrorHook>,
    context_error: Option<HandlerErrorHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called after a record is accepted, and for idempotent re-inserts
    /// (with `existing: true`).
    pub fn on_event_inserted<F>(mut self, hook: F) -> Self
    where
        F: Fn(&EventRecord, InsertInfo) + Send + Sync + 'static,
    {
        self.event_inserted = Some(Box::new(hook));
        self
    }

    /// Called when a record fails validation on the append path.
    pub fn on_event_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&EventRecord, &Error) + Send + Sync + 'static,
    {
        self.event_error = Some(Box::new(hook));
        self
    }

    /// Called for each projection handler failure.
    pub fn on_projector_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&EventRecord, &BoxDynError) + Send + Sync + 'static,
    {
        self.projector_error = Some(Box::new(hook));
        self
    }

    /// Called for each context op that failed to apply.
    pub fn on_context_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&EventRecord, &BoxDynError) + Send + Sync + 'static,
    {
        self.context_error = Some(Box::new(hook));
        self
    }

    pub(crate) fn event_inserted(&self, record: &EventRecord, info: InsertInfo) {
        if let Some(hook) = &self.event_inserted {
            hook(record, info);
        }
    }

    pub(crate) fn event_error(&self, record: &EventRecord, error: &Error) {
        if let Some(hook) = &self.event_error {
            hook(record, error);
        }
    }

    pub(crate) fn projector_error(&self, record: &EventRecord, error: &BoxDynError) {
        if let Some(hook) = &self.projector_error {
            hook(record, error);
        }
    }

    pub(crate) fn context_error(&self, record: &EventRecord, error: &BoxDynError) {
        if let Some(hook) = &self.context_error {
            hook(record, error);
        }
    }
}
