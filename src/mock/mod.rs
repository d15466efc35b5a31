//! In-memory daemon for tests.
//!
//! [`MockDaemon`] implements [`Transport`] without any network: requests are
//! answered from a [`MockScript`] and an operation table, event streams and
//! operation websockets are [`MemorySocket`] pairs whose daemon ends the test
//! can drive.
//!
//! It is gated behind `cfg(test)` or the `mock` Cargo feature.

mod socket;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use serde_json::Value;
use tokio::sync::Notify;

pub use socket::MemorySocket;
use socket::CloseLog;

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    events::Scope,
    transport::{BoxFuture, Frame, Method, SharedSocket, Socket, Transport},
    types::{Event, OperationState, Response, StatusCode, EVENT_TYPE_OPERATION},
};

/// How a scripted request should be answered.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum MockReply {
    /// Sync response with this payload.
    Sync(Value),

    /// Async response; the operation is added to the daemon's table.
    Operation(OperationState),

    /// Error response.
    Error {
        /// Status code.
        code: u16,
        /// Message.
        message: String,
    },

    /// The request never reaches the daemon.
    ConnectionFailure(String),
}

/// Scripted replies, keyed by method and path (without query string).
#[derive(Debug, Clone, Default)]
pub struct MockScript {
    /// Map from `"METHOD /path"` to reply.
    pub replies: HashMap<String, MockReply>,
}

fn route_key(method: Method, path: &str) -> String {
    format!("{method} {path}")
}

impl MockScript {
    /// An empty script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a reply.
    #[must_use]
    pub fn reply(mut self, method: Method, path: &str, reply: MockReply) -> Self {
        self.replies.insert(route_key(method, path), reply);
        self
    }

    /// Add a sync reply.
    #[must_use]
    pub fn reply_sync(self, method: Method, path: &str, value: Value) -> Self {
        self.reply(method, path, MockReply::Sync(value))
    }

    /// Add a reply that starts `op`.
    #[must_use]
    pub fn reply_operation(self, method: Method, path: &str, op: OperationState) -> Self {
        self.reply(method, path, MockReply::Operation(op))
    }

    /// Add an error reply.
    #[must_use]
    pub fn reply_error(self, method: Method, path: &str, code: u16, message: impl Into<String>) -> Self {
        self.reply(
            method,
            path,
            MockReply::Error {
                code,
                message: message.into(),
            },
        )
    }
}

/// An in-memory daemon.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct MockDaemon {
    inner: Arc<Inner>,
}

struct Inner {
    replies: Mutex<HashMap<String, MockReply>>,
    operations: Mutex<HashMap<String, OperationState>>,
    changed: Notify,
    event_sockets: Mutex<Vec<(Scope, Arc<MemorySocket>)>>,
    peers: Mutex<HashMap<String, Arc<MemorySocket>>>,
    received: Mutex<Vec<Event>>,
    requests: Mutex<Vec<String>>,
    event_connects: AtomicUsize,
    refuse_events: Mutex<Option<String>>,
    refused_secrets: Mutex<HashSet<String>>,
    refresh_gate: Mutex<Option<CancelToken>>,
    refresh_held: Notify,
    close_log: CloseLog,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find_map(|(k, v)| (k == key).then_some(v))
}

fn decode(part: &str) -> String {
    urlencoding::decode(part).map_or_else(|_| part.to_string(), |s| s.into_owned())
}

impl MockDaemon {
    /// A daemon answering from `script`.
    #[must_use]
    pub fn new(script: MockScript) -> Self {
        Self {
            inner: Arc::new(Inner {
                replies: Mutex::new(script.replies),
                operations: Mutex::new(HashMap::new()),
                changed: Notify::new(),
                event_sockets: Mutex::new(Vec::new()),
                peers: Mutex::new(HashMap::new()),
                received: Mutex::new(Vec::new()),
                requests: Mutex::new(Vec::new()),
                event_connects: AtomicUsize::new(0),
                refuse_events: Mutex::new(None),
                refused_secrets: Mutex::new(HashSet::new()),
                refresh_gate: Mutex::new(None),
                refresh_held: Notify::new(),
                close_log: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    /// Replace or add a scripted reply.
    pub fn set_reply(&self, method: Method, path: &str, reply: MockReply) {
        lock(&self.inner.replies).insert(route_key(method, path), reply);
    }

    /// Add `op` to the operation table without emitting an event.
    pub fn create_operation(&self, op: OperationState) -> OperationState {
        lock(&self.inner.operations).insert(op.id.clone(), op.clone());
        op
    }

    /// Store `op` and emit it as an `operation` event.
    pub fn update_operation(&self, op: OperationState) {
        lock(&self.inner.operations).insert(op.id.clone(), op.clone());
        self.inner.changed.notify_waiters();

        if let Ok(metadata) = serde_json::to_value(&op) {
            self.emit(&Event::new(EVENT_TYPE_OPERATION, metadata));
        }
    }

    /// Move an operation to `code`, setting `err`, and emit the update.
    pub fn transition(&self, id: &str, code: StatusCode, err: &str) {
        let mut op = self
            .operation(id)
            .unwrap_or_else(|| OperationState::new(id, code));
        op.status_code = code;
        op.status = code.as_str().to_string();
        op.err = err.to_string();
        self.update_operation(op);
    }

    /// Finish an operation successfully.
    pub fn complete_operation(&self, id: &str) {
        self.transition(id, StatusCode::Success, "");
    }

    /// Finish an operation with `err`.
    pub fn fail_operation(&self, id: &str, err: &str) {
        self.transition(id, StatusCode::Failure, err);
    }

    /// Current state of an operation.
    #[must_use]
    pub fn operation(&self, id: &str) -> Option<OperationState> {
        lock(&self.inner.operations).get(id).cloned()
    }

    /// Push `event` to every open event stream whose scope covers it.
    pub fn emit(&self, event: &Event) {
        let Ok(payload) = serde_json::to_string(event) else {
            return;
        };
        self.emit_raw(event, &payload);
    }

    /// Push a raw frame to every open event stream.
    pub fn emit_frame(&self, payload: &str) {
        for (_, socket) in lock(&self.inner.event_sockets).iter() {
            let _ = socket.push(Frame::Text(payload.to_string()));
        }
    }

    fn emit_raw(&self, event: &Event, payload: &str) {
        for (scope, socket) in lock(&self.inner.event_sockets).iter() {
            let covered = match scope {
                Scope::AllProjects => true,
                Scope::Project(p) => event.project.is_empty() || &event.project == p,
            };
            if covered {
                let _ = socket.push(Frame::Text(payload.to_string()));
            }
        }
    }

    /// Break every open event stream with a connection error.
    pub fn fail_event_streams(&self, message: &str) {
        for (_, socket) in lock(&self.inner.event_sockets).iter() {
            socket.send_error(message);
        }
    }

    /// Refuse new event streams with `message`, or accept them again with `None`.
    pub fn refuse_event_streams(&self, message: Option<&str>) {
        *lock(&self.inner.refuse_events) = message.map(str::to_string);
    }

    /// Refuse operation websockets opened with `secret`.
    pub fn refuse_websocket(&self, secret: &str) {
        lock(&self.inner.refused_secrets).insert(secret.to_string());
    }

    /// Number of event streams opened so far.
    #[must_use]
    pub fn event_connections(&self) -> usize {
        self.inner.event_connects.load(Ordering::SeqCst)
    }

    /// Number of event streams still open on both ends.
    #[must_use]
    pub fn open_event_streams(&self) -> usize {
        lock(&self.inner.event_sockets)
            .iter()
            .filter(|(_, socket)| socket.is_open())
            .count()
    }

    /// Events clients published through an event stream.
    #[must_use]
    pub fn received_events(&self) -> Vec<Event> {
        lock(&self.inner.received).clone()
    }

    /// Requests seen so far, as `"METHOD /path?query"`.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        lock(&self.inner.requests).clone()
    }

    /// Block `GET /operations/{id}` until [`MockDaemon::release_refreshes`].
    ///
    /// Held requests answer with the state read when they arrived.
    pub fn hold_refreshes(&self) {
        *lock(&self.inner.refresh_gate) = Some(CancelToken::new());
    }

    /// Resolve once a refresh is blocked by [`MockDaemon::hold_refreshes`].
    pub async fn refresh_held(&self) {
        self.inner.refresh_held.notified().await;
    }

    /// Let held refreshes through.
    pub fn release_refreshes(&self) {
        if let Some(gate) = lock(&self.inner.refresh_gate).take() {
            gate.cancel();
        }
    }

    /// Daemon end of the websocket opened with `secret` on operation `id`.
    #[must_use]
    pub fn peer(&self, id: &str, secret: &str) -> Option<Arc<MemorySocket>> {
        lock(&self.inner.peers)
            .get(&format!("/operations/{id}/websocket?secret={secret}"))
            .cloned()
    }

    /// Labels of closed sockets, in close order.
    ///
    /// Client ends are labelled `client:{path}`, daemon ends `daemon:{path}`.
    #[must_use]
    pub fn close_log(&self) -> Vec<String> {
        lock(&self.inner.close_log).clone()
    }

    async fn handle(&self, method: Method, path: &str) -> Result<Response> {
        lock(&self.inner.requests).push(format!("{method} {path}"));

        let (route, query) = path.split_once('?').unwrap_or((path, ""));
        let segments: Vec<&str> = route.trim_start_matches('/').split('/').collect();

        match (method, segments.as_slice()) {
            (Method::Get, ["operations", id]) => {
                // A held refresh answers with the state from before the hold.
                let snapshot = self.operation(&decode(id));
                self.pass_refresh_gate().await;
                match snapshot {
                    Some(op) => Ok(Response::sync(serde_json::to_value(op)?)),
                    None => Err(Error::server(404, "Operation not found")),
                }
            }
            (Method::Get, ["operations", id, "wait"]) => {
                let timeout = query_param(query, "timeout")
                    .and_then(|t| t.parse::<i64>().ok())
                    .and_then(|t| u64::try_from(t).ok())
                    .map(Duration::from_secs);
                let op = self.wait_operation(&decode(id), timeout).await?;
                Ok(Response::sync(serde_json::to_value(op)?))
            }
            (Method::Delete, ["operations", id]) => {
                let id = decode(id);
                if self.operation(&id).is_none() {
                    return Err(Error::server(404, "Operation not found"));
                }
                self.transition(&id, StatusCode::Cancelled, "operation cancelled");
                Ok(Response::sync(Value::Null))
            }
            _ => self.scripted(method, route),
        }
    }

    fn scripted(&self, method: Method, route: &str) -> Result<Response> {
        let reply = lock(&self.inner.replies).get(&route_key(method, route)).cloned();
        match reply {
            Some(MockReply::Sync(value)) => Ok(Response::sync(value)),
            Some(MockReply::Operation(op)) => {
                let op = self.create_operation(op);
                Response::async_operation(&op)
            }
            Some(MockReply::Error { code, message }) => Err(Error::server(code, message)),
            Some(MockReply::ConnectionFailure(message)) => Err(Error::connection(message)),
            None => Err(Error::server(404, "not found")),
        }
    }

    async fn pass_refresh_gate(&self) {
        let gate = lock(&self.inner.refresh_gate).clone();
        if let Some(gate) = gate {
            self.inner.refresh_held.notify_one();
            gate.cancelled().await;
        }
    }

    async fn wait_operation(&self, id: &str, timeout: Option<Duration>) -> Result<OperationState> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let op = self
                .operation(id)
                .ok_or_else(|| Error::server(404, "Operation not found"))?;
            if op.is_final() {
                return Ok(op);
            }

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(deadline) => return Ok(op),
                        () = &mut changed => {}
                    }
                }
                None => changed.await,
            }
        }
    }

    fn connect(&self, path: &str) -> Result<SharedSocket> {
        let (route, query) = path.split_once('?').unwrap_or((path, ""));

        if route == "/events" {
            if let Some(message) = lock(&self.inner.refuse_events).clone() {
                return Err(Error::connection(message));
            }

            let scope = if query_param(query, "all-projects") == Some("true") {
                Scope::AllProjects
            } else {
                Scope::Project(query_param(query, "project").map_or_else(|| "default".to_string(), decode))
            };

            let (client, daemon) = MemorySocket::pair(
                format!("client:{path}"),
                format!("daemon:{path}"),
                Arc::clone(&self.inner.close_log),
            );
            self.inner.event_connects.fetch_add(1, Ordering::SeqCst);
            lock(&self.inner.event_sockets).push((scope, Arc::clone(&daemon)));

            let received = self.clone();
            tokio::spawn(async move {
                while let Ok(Some(frame)) = daemon.recv().await {
                    if let Ok(event) = serde_json::from_slice::<Event>(frame.as_bytes()) {
                        lock(&received.inner.received).push(event);
                    }
                }
            });

            return Ok(client);
        }

        if route.ends_with("/websocket") {
            let secret = query_param(query, "secret").map(decode).unwrap_or_default();
            if lock(&self.inner.refused_secrets).contains(&secret) {
                return Err(Error::server(403, "websocket secret rejected"));
            }

            let (client, daemon) = MemorySocket::pair(
                format!("client:{path}"),
                format!("daemon:{path}"),
                Arc::clone(&self.inner.close_log),
            );
            lock(&self.inner.peers).insert(path.to_string(), daemon);
            return Ok(client);
        }

        Err(Error::server(404, "not found"))
    }
}

impl Default for MockDaemon {
    fn default() -> Self {
        Self::new(MockScript::new())
    }
}

impl fmt::Debug for MockDaemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockDaemon")
            .field("operations", &lock(&self.inner.operations).len())
            .field("event_connections", &self.event_connections())
            .finish_non_exhaustive()
    }
}

impl Transport for MockDaemon {
    fn query<'a>(
        &'a self,
        method: Method,
        path: &'a str,
        _body: Option<&'a Value>,
        _etag: &'a str,
    ) -> BoxFuture<'a, Result<(Response, String)>> {
        Box::pin(async move {
            let resp = self.handle(method, path).await?;
            Ok((resp, String::new()))
        })
    }

    fn open_socket<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<SharedSocket>> {
        Box::pin(async move { self.connect(path) })
    }
}
