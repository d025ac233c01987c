//! Typed event-to-handler dispatch.
//!
//! The projector holds an immutable dispatch table assembled by a builder
//! before the store goes live. Handlers for a single record run sequentially
//! in registration order, so read models observe a deterministic write
//! order; cross-record order follows the caller's loop.
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{BoxDynError, Error};
use crate::record::EventRecord;

/// How a record reached the projector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProjectionInfo {
    /// The record is being re-applied rather than newly authored.
    pub hydrated: bool,
    /// A newly authored record whose `created` precedes an existing record
    /// of the same stream and type.
    pub outdated: bool,
}

/// A registered projection handler.
pub type ProjectionHandler =
    Arc<dyn Fn(EventRecord, ProjectionInfo) -> BoxFuture<'static, Result<(), BoxDynError>> + Send + Sync>;

/// Per-registration options.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectorOpts {
    /// Deliver outdated records to this handler. Off by default: most read
    /// models only want the newest state of a stream.
    pub include_outdated: bool,
}

#[derive(Clone, PartialEq, Eq)]
enum Subscription {
    Type(String),
    All,
}

#[derive(Clone)]
struct HandlerEntry {
    subscription: Subscription,
    once: bool,
    opts: ProjectorOpts,
    handler: ProjectionHandler,
}

/// Collects handler registrations into an immutable [`Projector`].
#[derive(Default)]
pub struct ProjectorBuilder {
    entries: Vec<HandlerEntry>,
}

impl ProjectorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler for one event type.
    ///
    /// Exclusive: a second `on` registration for the same type is a
    /// configuration fault surfaced by [`build`](Self::build).
    pub fn on<F, Fut>(self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(EventRecord, ProjectionInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxDynError>> + Send + 'static,
    {
        self.on_opts(event_type, ProjectorOpts::default(), handler)
    }

    /// Registers the handler for one event type with explicit options.
    pub fn on_opts<F, Fut>(
        mut self,
        event_type: impl Into<String>,
        opts: ProjectorOpts,
        handler: F,
    ) -> Self
    where
        F: Fn(EventRecord, ProjectionInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxDynError>> + Send + 'static,
    {
        self.entries.push(HandlerEntry {
            subscription: Subscription::Type(event_type.into()),
            once: false,
            opts,
            handler: wrap(handler),
        });
        self
    }

    /// Registers a handler that fires only for genuinely new records, never
    /// on replay and never for outdated records.
    pub fn once<F, Fut>(mut self, event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(EventRecord, ProjectionInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxDynError>> + Send + 'static,
    {
        self.entries.push(HandlerEntry {
            subscription: Subscription::Type(event_type.into()),
            once: true,
            opts: ProjectorOpts::default(),
            handler: wrap(handler),
        });
        self
    }

    /// Registers a handler for every event type.
    pub fn all<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(EventRecord, ProjectionInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxDynError>> + Send + 'static,
    {
        self.all_opts(ProjectorOpts::default(), handler)
    }

    /// Registers a handler for every event type with explicit options.
    pub fn all_opts<F, Fut>(mut self, opts: ProjectorOpts, handler: F) -> Self
    where
        F: Fn(EventRecord, ProjectionInfo) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxDynError>> + Send + 'static,
    {
        self.entries.push(HandlerEntry {
            subscription: Subscription::All,
            once: false,
            opts,
            handler: wrap(handler),
        });
        self
    }

    /// Freezes the dispatch table.
    ///
    /// # Errors
    ///
    /// `Error::Config` when the same event type carries more than one `on`
    /// registration, or more than one `once` registration.
    pub fn build(self) -> Result<Projector, Error> {
        for (i, entry) in self.entries.iter().enumerate() {
            let Subscription::Type(event_type) = &entry.subscription else {
                continue;
            };
            let duplicate = self.entries[..i].iter().any(|prior| {
                prior.once == entry.once && prior.subscription == entry.subscription
            });
            if duplicate {
                let mode = if entry.once { "once" } else { "on" };
                return Err(Error::Config(format!(
                    "duplicate `{mode}` registration for `{event_type}`"
                )));
            }
        }
        Ok(Projector {
            entries: Arc::new(self.entries),
        })
    }
}

fn wrap<F, Fut>(handler: F) -> ProjectionHandler
where
    F: Fn(EventRecord, ProjectionInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxDynError>> + Send + 'static,
{
    Arc::new(move |record, info| handler(record, info).boxed())
}

/// Immutable dispatch table of projection handlers.
#[derive(Clone, Default)]
pub struct Projector {
    entries: Arc<Vec<HandlerEntry>>,
}

impl Projector {
    pub fn builder() -> ProjectorBuilder {
        ProjectorBuilder::new()
    }

    /// Dispatches one record to the applicable handlers.
    ///
    /// Handlers run sequentially in registration order and each returned
    /// future is awaited. A faulting handler does not prevent subsequent
    /// handlers from running; all failures are collected and returned for
    /// the caller to route to its error hook.
    pub async fn project(&self, record: &EventRecord, info: ProjectionInfo) -> Vec<BoxDynError> {
        let mut failures = Vec::new();
        for entry in self.entries.iter() {
            if !entry.applies(record, info) {
                continue;
            }
            if let Err(error) = (entry.handler)(record.clone(), info).await {
                failures.push(error);
            }
        }
        failures
    }
}

impl HandlerEntry {
    fn applies(&self, record: &EventRecord, info: ProjectionInfo) -> bool {
        if let Subscription::Type(event_type) = &self.subscription {
            if event_type != &record.event_type {
                return false;
            }
        }
        if self.once && (info.hydrated || info.outdated) {
            return false;
        }
        if info.outdated && !self.opts.include_outdated {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{EventDraft, EventFactory};
    use assert2::let_assert;
    use parking_lot::Mutex;

    fn record(event_type: &str) -> EventRecord {
        EventFactory::new().make(EventDraft::new(event_type).stream("s1"))
    }

    fn recording(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> impl Fn(EventRecord, ProjectionInfo) -> futures::future::Ready<Result<(), BoxDynError>> + Send + Sync + 'static
    {
        let log = Arc::clone(log);
        move |record, _| {
            log.lock().push(format!("{tag}:{}", record.event_type));
            futures::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn it_dispatches_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let projector = Projector::builder()
            .all(recording(&log, "all"))
            .on("user:created", recording(&log, "on"))
            .build()
            .unwrap();

        let failures = projector
            .project(&record("user:created"), ProjectionInfo::default())
            .await;
        assert!(failures.is_empty());
        assert_eq!(*log.lock(), ["all:user:created", "on:user:created"]);
    }

    #[tokio::test]
    async fn it_skips_unrelated_types() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let projector = Projector::builder()
            .on("user:created", recording(&log, "on"))
            .build()
            .unwrap();

        projector
            .project(&record("user:removed"), ProjectionInfo::default())
            .await;
        assert!(log.lock().is_empty());
    }

    #[tokio::test]
    async fn it_skips_once_handlers_on_replay() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let projector = Projector::builder()
            .once("user:created", recording(&log, "once"))
            .on("user:created", recording(&log, "on"))
            .build()
            .unwrap();

        let hydrated = ProjectionInfo {
            hydrated: true,
            outdated: false,
        };
        projector.project(&record("user:created"), hydrated).await;
        assert_eq!(*log.lock(), ["on:user:created"]);
    }

    #[tokio::test]
    async fn it_delivers_outdated_records_only_to_opted_in_handlers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let projector = Projector::builder()
            .once("user:created", recording(&log, "once"))
            .on("user:created", recording(&log, "on"))
            .all_opts(
                ProjectorOpts {
                    include_outdated: true,
                },
                recording(&log, "all"),
            )
            .build()
            .unwrap();
        let outdated = ProjectionInfo {
            hydrated: false,
            outdated: true,
        };
        projector.project(&record("user:created"), outdated).await;
        assert_eq!(*log.lock(), ["all:user:created"]);
    }

    #[tokio::test]
    async fn it_keeps_dispatching_after_a_faulting_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let projector = Projector::builder()
            .once("user:created", |_, _| {
                futures::future::ready(Err::<(), BoxDynError>("boom".into()))
            })
            .on("user:created", recording(&log, "on"))
            .build()
            .unwrap();

        let failures = projector
            .project(&record("user:created"), ProjectionInfo::default())
            .await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].to_string(), "boom");
        assert_eq!(*log.lock(), ["on:user:created"]);
    }

    #[test]
    fn it_rejects_duplicate_exclusive_registrations() {
        let result = Projector::builder()
            .on("user:created", |_, _| futures::future::ready(Ok(())))
            .on("user:created", |_, _| futures::future::ready(Ok(())))
            .build();
        let_assert!(Err(Error::Config(message)) = result);
        assert!(message.contains("user:created"));
    }

    #[test]
    fn it_allows_on_and_once_for_the_same_type() {
        Projector::builder()
            .on("user:created", |_, _| futures::future::ready(Ok(())))
            .once("user:created", |_, _| futures::future::ready(Ok(())))
            .build()
            .unwrap();
    }
}
