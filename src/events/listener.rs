use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use tokio::sync::mpsc;

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    event_stream::EventStream,
    events::{manager::ManagerInner, Scope},
    types::Event,
};

/// Callback invoked for every matching event.
pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;

static NEXT_TARGET_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
enum Sink {
    /// Invoked on its own task for every event; no ordering between events.
    Callback(EventHandler),
    /// Fed inline by the dispatch loop, so arrival order is preserved.
    Queue(mpsc::UnboundedSender<Event>),
    /// Never registered anywhere.
    Detached,
}

/// A registered callback together with its event-type filter.
///
/// Targets compare equal only to clones of themselves.
#[derive(Clone)]
pub struct EventTarget {
    id: u64,
    types: Vec<String>,
    sink: Sink,
}

impl EventTarget {
    fn new(types: Vec<String>, sink: Sink) -> Self {
        Self {
            id: NEXT_TARGET_ID.fetch_add(1, Ordering::Relaxed),
            types,
            sink,
        }
    }

    /// A target that is not attached to any listener.
    pub(crate) fn detached<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(types.into_iter().map(Into::into).collect(), Sink::Detached)
    }

    /// Event types this target accepts; empty means all.
    #[must_use]
    pub fn types(&self) -> &[String] {
        &self.types
    }

    /// Whether an event of `event_type` is delivered to this target.
    #[must_use]
    pub fn matches(&self, event_type: &str) -> bool {
        self.types.is_empty() || self.types.iter().any(|t| t == event_type)
    }

    fn deliver(&self, event: &Event) {
        match &self.sink {
            Sink::Callback(handler) => {
                let handler = Arc::clone(handler);
                let event = event.clone();
                tokio::spawn(async move { handler(event) });
            }
            Sink::Queue(tx) => {
                let _ = tx.send(event.clone());
            }
            Sink::Detached => {}
        }
    }
}

impl PartialEq for EventTarget {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for EventTarget {}

impl fmt::Debug for EventTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTarget")
            .field("id", &self.id)
            .field("types", &self.types)
            .finish()
    }
}

/// A subscription to one scope's event stream.
///
/// Cloning yields another handle to the same subscription.
#[derive(Clone)]
pub struct EventListener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    id: u64,
    scope: Scope,
    token: CancelToken,
    err: Mutex<Option<Error>>,
    targets: Mutex<Vec<EventTarget>>,
    manager: Weak<ManagerInner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventListener {
    pub(crate) fn new(id: u64, scope: Scope, token: CancelToken, manager: Weak<ManagerInner>) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                id,
                scope,
                token,
                err: Mutex::new(None),
                targets: Mutex::new(Vec::new()),
                manager,
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    /// Scope this listener is bound to.
    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.inner.scope
    }

    /// Register `handler` for events whose type is in `types` (all events if empty).
    ///
    /// Each matching event is handed to the handler on a fresh task, so two
    /// events delivered in quick succession may be handled out of order. Use
    /// [`EventListener::stream`] when ordering matters.
    pub fn add_handler<I, S, F>(&self, types: I, handler: F) -> EventTarget
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Event) + Send + Sync + 'static,
    {
        let types = types.into_iter().map(Into::into).collect();
        self.push(EventTarget::new(types, Sink::Callback(Arc::new(handler))))
    }

    /// Register an ordered queue for events whose type is in `types`.
    ///
    /// The receiver ends once the listener terminates.
    pub(crate) fn add_queue<I, S>(&self, types: I) -> (EventTarget, mpsc::UnboundedReceiver<Event>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let types = types.into_iter().map(Into::into).collect();
        (self.push(EventTarget::new(types, Sink::Queue(tx))), rx)
    }

    fn push(&self, target: EventTarget) -> EventTarget {
        let mut targets = lock(&self.inner.targets);
        // A terminated listener keeps no sinks, so queue receivers end right away.
        if !self.inner.token.is_cancelled() {
            targets.push(target.clone());
        }
        target
    }

    /// Remove a target previously returned by this listener.
    pub fn remove_handler(&self, target: &EventTarget) -> Result<()> {
        let mut targets = lock(&self.inner.targets);
        match targets.iter().position(|t| t == target) {
            Some(idx) => {
                targets.remove(idx);
                Ok(())
            }
            None => Err(Error::not_found(
                "couldn't find this function and event types combination",
            )),
        }
    }

    /// Number of registered targets.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        lock(&self.inner.targets).len()
    }

    /// Subscribe to events of the given types as an ordered stream.
    #[must_use]
    pub fn stream<I, S>(&self, types: I) -> EventStream
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (target, rx) = self.add_queue(types);
        EventStream::new(self.clone(), target, rx)
    }

    /// Stop receiving events. Calling this more than once is a no-op.
    pub fn disconnect(&self) {
        if self.inner.token.is_cancelled() {
            return;
        }

        if let Some(manager) = self.inner.manager.upgrade() {
            manager.remove_listener(self);
        }

        self.terminate(None);
    }

    /// Wait until the listener stops.
    ///
    /// Returns `Ok(())` after [`EventListener::disconnect`], or the error that
    /// broke the underlying connection.
    pub async fn wait(&self) -> Result<()> {
        self.inner.token.cancelled().await;
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Whether the listener still receives events.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.inner.token.is_cancelled()
    }

    /// The error that terminated this listener, if any.
    #[must_use]
    pub fn error(&self) -> Option<Error> {
        lock(&self.inner.err).as_ref().map(Error::clone_for_task)
    }

    pub(crate) fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        self.inner.token.cancelled()
    }

    /// Record `err`, fire the token and drop every sink.
    pub(crate) fn terminate(&self, err: Option<Error>) {
        if let Some(err) = err {
            let mut slot = lock(&self.inner.err);
            if slot.is_none() {
                *slot = Some(err);
            }
        }

        self.inner.token.cancel();
        lock(&self.inner.targets).clear();
    }

    pub(crate) fn deliver(&self, event: &Event) {
        let targets = lock(&self.inner.targets);
        for target in targets.iter().filter(|t| t.matches(&event.event_type)) {
            target.deliver(event);
        }
    }
}

impl fmt::Debug for EventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListener")
            .field("id", &self.inner.id)
            .field("scope", &self.inner.scope)
            .field("active", &self.is_active())
            .finish()
    }
}
