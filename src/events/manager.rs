use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    events::EventListener,
    transport::{Frame, SharedSocket},
    types::Event,
};

/// Upper bound on a single [`EventListenerManager::publish`] write.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval between idle checks of an event connection.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_secs(60);

/// Which event stream a listener is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Events from every project.
    AllProjects,
    /// Events from a single project.
    Project(String),
}

impl Scope {
    /// Path of the event stream for this scope.
    #[must_use]
    pub fn events_path(&self) -> String {
        match self {
            Self::AllProjects => "/events?all-projects=true".to_string(),
            Self::Project(project) => {
                format!("/events?project={}", urlencoding::encode(project))
            }
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllProjects => f.write_str("all projects"),
            Self::Project(project) => write!(f, "project {project}"),
        }
    }
}

/// Shares one event connection per [`Scope`] among any number of listeners.
#[derive(Clone)]
pub struct EventListenerManager {
    inner: Arc<ManagerInner>,
}

struct ScopeConn {
    id: u64,
    socket: SharedSocket,
    token: CancelToken,
}

pub(crate) struct ManagerInner {
    // Lock order: `listeners` before `conns`.
    listeners: Mutex<HashMap<Scope, Vec<EventListener>>>,
    conns: Mutex<HashMap<Scope, ScopeConn>>,
    connect_lock: tokio::sync::Mutex<()>,
    shutdown: CancelToken,
    idle_interval: Duration,
    next_id: AtomicU64,
}

#[derive(Debug, PartialEq, Eq)]
enum Release {
    Done,
    Busy,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl EventListenerManager {
    /// Create a manager that checks idle connections every `idle_interval`.
    #[must_use]
    pub fn new(idle_interval: Duration) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                listeners: Mutex::new(HashMap::new()),
                conns: Mutex::new(HashMap::new()),
                connect_lock: tokio::sync::Mutex::new(()),
                shutdown: CancelToken::new(),
                idle_interval,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Return a new listener for `scope`, opening the scope's connection with
    /// `connect` if none is open yet.
    ///
    /// Concurrent callers for the same scope share a single connection.
    pub async fn subscribe<F, Fut>(&self, scope: Scope, connect: F) -> Result<EventListener>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SharedSocket>>,
    {
        let inner = &self.inner;
        if let Some(listener) = inner.attach(&scope)? {
            return Ok(listener);
        }

        // Only dials are serialized; the check is repeated once the lock is held.
        let _connecting = inner.connect_lock.lock().await;
        if let Some(listener) = inner.attach(&scope)? {
            return Ok(listener);
        }

        let socket = connect().await?;
        let conn_id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = inner.shutdown.child();
        let listener = inner.new_listener(&scope, &token);
        {
            let mut listeners = lock(&inner.listeners);
            let mut conns = lock(&inner.conns);
            conns.insert(
                scope.clone(),
                ScopeConn {
                    id: conn_id,
                    socket: Arc::clone(&socket),
                    token: token.clone(),
                },
            );
            listeners.insert(scope.clone(), vec![listener.clone()]);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(scope = %scope, conn = conn_id, "opened event connection");

        let manager = Arc::downgrade(inner);
        tokio::spawn(dispatch_loop(
            manager.clone(),
            scope.clone(),
            conn_id,
            Arc::clone(&socket),
            token.clone(),
        ));
        tokio::spawn(idle_watcher(
            manager,
            scope,
            conn_id,
            socket,
            token,
            inner.idle_interval,
        ));

        Ok(listener)
    }

    /// Detach `listener` from its scope. Unknown listeners are ignored.
    pub fn unsubscribe(&self, listener: &EventListener) {
        self.inner.remove_listener(listener);
    }

    /// Write `event` on one of the open event connections.
    pub async fn publish(&self, event: &Event) -> Result<()> {
        let socket = lock(&self.inner.conns)
            .values()
            .next()
            .map(|conn| Arc::clone(&conn.socket))
            .ok_or(Error::NoConnection)?;

        let payload = serde_json::to_string(event)?;
        match tokio::time::timeout(PUBLISH_TIMEOUT, socket.send(Frame::Text(payload))).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout {
                timeout: PUBLISH_TIMEOUT,
            }),
        }
    }

    /// Close every connection and terminate every listener.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Number of open scope connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        lock(&self.inner.conns).len()
    }

    /// Number of listeners attached to `scope`.
    #[must_use]
    pub fn listener_count(&self, scope: &Scope) -> usize {
        lock(&self.inner.listeners).get(scope).map_or(0, Vec::len)
    }
}

impl Default for EventListenerManager {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_INTERVAL)
    }
}

impl fmt::Debug for EventListenerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventListenerManager")
            .field("connections", &self.connection_count())
            .field("idle_interval", &self.inner.idle_interval)
            .finish()
    }
}

impl ManagerInner {
    fn new_listener(self: &Arc<Self>, scope: &Scope, conn_token: &CancelToken) -> EventListener {
        EventListener::new(
            self.next_id.fetch_add(1, Ordering::Relaxed),
            scope.clone(),
            conn_token.child(),
            Arc::downgrade(self),
        )
    }

    /// Join the open connection of `scope`, if any.
    fn attach(self: &Arc<Self>, scope: &Scope) -> Result<Option<EventListener>> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Disconnected);
        }

        let mut listeners = lock(&self.listeners);
        let conns = lock(&self.conns);
        let Some(conn) = conns.get(scope) else {
            return Ok(None);
        };
        let listener = self.new_listener(scope, &conn.token);
        listeners.entry(scope.clone()).or_default().push(listener.clone());
        Ok(Some(listener))
    }

    pub(crate) fn remove_listener(&self, listener: &EventListener) {
        let mut listeners = lock(&self.listeners);
        if let Some(set) = listeners.get_mut(listener.scope()) {
            set.retain(|l| l.id() != listener.id());
        }
    }

    fn dispatch(&self, scope: &Scope, frame: &Frame) {
        let event: Event = match serde_json::from_slice(frame.as_bytes()) {
            Ok(event) => event,
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(error = %_err, "dropping undecodable event frame");
                return;
            }
        };
        if event.event_type.is_empty() {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(event = %event.event_type, scope = %scope, "received event");

        let listeners = lock(&self.listeners);
        if let Some(set) = listeners.get(scope) {
            for listener in set {
                listener.deliver(&event);
            }
        }
    }

    /// Drop the scope's connection entry and its listeners if the entry still
    /// belongs to `conn_id`.
    fn release(&self, scope: &Scope, conn_id: u64, err: Option<&Error>, only_if_idle: bool) -> Release {
        let mut listeners = lock(&self.listeners);
        let mut conns = lock(&self.conns);
        if conns.get(scope).map(|conn| conn.id) != Some(conn_id) {
            return Release::Done;
        }
        if only_if_idle && listeners.get(scope).is_some_and(|set| !set.is_empty()) {
            return Release::Busy;
        }

        conns.remove(scope);
        drop(conns);
        for listener in listeners.remove(scope).unwrap_or_default() {
            listener.terminate(err.map(Error::clone_for_task));
        }

        Release::Done
    }
}

async fn dispatch_loop(
    manager: Weak<ManagerInner>,
    scope: Scope,
    conn_id: u64,
    socket: SharedSocket,
    token: CancelToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            () = token.cancelled() => return,
            frame = socket.recv() => frame,
        };

        let Some(inner) = manager.upgrade() else {
            token.cancel();
            return;
        };

        let err = match frame {
            Ok(Some(frame)) => {
                inner.dispatch(&scope, &frame);
                continue;
            }
            Ok(None) => Error::Disconnected,
            Err(err) => err,
        };

        #[cfg(feature = "tracing")]
        tracing::warn!(scope = %scope, error = %err, "event connection failed");

        inner.release(&scope, conn_id, Some(&err), false);
        token.cancel();
        return;
    }
}

async fn idle_watcher(
    manager: Weak<ManagerInner>,
    scope: Scope,
    conn_id: u64,
    socket: SharedSocket,
    token: CancelToken,
    interval: Duration,
) {
    loop {
        let cancelled = tokio::select! {
            () = tokio::time::sleep(interval) => false,
            () = token.cancelled() => true,
        };

        let Some(inner) = manager.upgrade() else {
            break;
        };
        if inner.release(&scope, conn_id, None, !cancelled) == Release::Done {
            break;
        }
    }

    token.cancel();
    let _ = socket.close().await;

    #[cfg(feature = "tracing")]
    tracing::debug!(scope = %scope, conn = conn_id, "closed event connection");
}
