//! Daemon client.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    events::{EventListener, EventListenerManager, Scope, DEFAULT_IDLE_INTERVAL},
    operation::Operation,
    transport::{Method, SharedSocket, Transport},
    types::{Event, OperationState, Response},
};

/// Project used when none is configured.
pub const DEFAULT_PROJECT: &str = "default";

/// Options fixed when the client is built.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Project that requests and operation tracking are scoped to.
    pub project: String,

    /// Track operations on the all-projects event stream instead of the
    /// project stream.
    pub all_projects_events: bool,

    /// Never open event connections; operations are tracked by long-polling.
    pub skip_event_listener: bool,

    /// How often idle event connections are checked and dropped.
    pub event_idle_timeout: Duration,

    /// Default timeout for requests and waits.
    ///
    /// Individual calls can override this via [`CallOptions`].
    pub default_timeout: Option<Duration>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            project: DEFAULT_PROJECT.to_string(),
            all_projects_events: false,
            skip_event_listener: false,
            event_idle_timeout: DEFAULT_IDLE_INTERVAL,
            default_timeout: None,
        }
    }
}

/// Options for a single call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Override the default timeout.
    pub timeout: Option<Duration>,

    /// A cancellation token.
    pub cancel: Option<CancelToken>,
}

impl CallOptions {
    /// Options with only a timeout set.
    #[must_use]
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: None,
        }
    }

    /// Options with only a cancellation token set.
    #[must_use]
    pub fn cancel(token: CancelToken) -> Self {
        Self {
            timeout: None,
            cancel: Some(token),
        }
    }
}

/// Client builder.
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    options: ConnectOptions,
}

impl ClientBuilder {
    /// Set the project.
    #[must_use]
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.options.project = project.into();
        self
    }

    /// Track operations on the all-projects event stream.
    #[must_use]
    pub fn all_projects_events(mut self, enabled: bool) -> Self {
        self.options.all_projects_events = enabled;
        self
    }

    /// Disable event listeners; operations fall back to long-polling.
    #[must_use]
    pub fn skip_event_listener(mut self, skip: bool) -> Self {
        self.options.skip_event_listener = skip;
        self
    }

    /// Set how often idle event connections are checked.
    #[must_use]
    pub fn event_idle_timeout(mut self, interval: Duration) -> Self {
        self.options.event_idle_timeout = interval;
        self
    }

    /// Set the default timeout.
    #[must_use]
    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.default_timeout = timeout;
        self
    }

    /// Build the client.
    #[must_use]
    pub fn build(self) -> Client {
        Client::with_options(self.transport, self.options)
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Client for the daemon's REST API, operations and event streams.
///
/// Cheap to clone; clones share the transport and event connections.
#[derive(Clone, Debug)]
pub struct Client {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    events: EventListenerManager,
    options: ConnectOptions,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inner")
            .field("events", &self.events)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a builder for the given transport.
    #[must_use]
    pub fn builder<T: Transport + 'static>(transport: T) -> ClientBuilder {
        ClientBuilder {
            transport: Arc::new(transport),
            options: ConnectOptions::default(),
        }
    }

    /// Create a client with default options.
    #[must_use]
    pub fn new<T: Transport + 'static>(transport: T) -> Self {
        Self::builder(transport).build()
    }

    /// Create a client for an already shared transport.
    #[must_use]
    pub fn with_options(transport: Arc<dyn Transport>, mut options: ConnectOptions) -> Self {
        if options.project.is_empty() {
            options.project = DEFAULT_PROJECT.to_string();
        }

        Self {
            inner: Arc::new(Inner {
                transport,
                events: EventListenerManager::new(options.event_idle_timeout),
                options,
            }),
        }
    }

    /// Options this client was built with.
    #[must_use]
    pub fn options(&self) -> &ConnectOptions {
        &self.inner.options
    }

    /// The shared event connection manager.
    #[must_use]
    pub fn events_manager(&self) -> &EventListenerManager {
        &self.inner.events
    }

    /// Raw request; returns the envelope and the `ETag`.
    pub async fn query(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        etag: &str,
    ) -> Result<(Response, String)> {
        self.query_with(method, path, body, etag, CallOptions::default())
            .await
    }

    /// Raw request with per-call options.
    pub async fn query_with(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        etag: &str,
        options: CallOptions,
    ) -> Result<(Response, String)> {
        #[cfg(feature = "tracing")]
        tracing::trace!(method = %method, path = path, "sending request");

        let options = CallOptions {
            timeout: options.timeout.or(self.inner.options.default_timeout),
            cancel: options.cancel,
        };
        let resp = race(
            self.inner.transport.query(method, path, body, etag),
            &options,
        )
        .await??;

        #[cfg(feature = "tracing")]
        tracing::trace!(method = %method, path = path, kind = ?resp.0.response_type, "received response");

        Ok(resp)
    }

    /// Request whose sync payload decodes into `T`.
    pub async fn query_struct<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        etag: &str,
    ) -> Result<(T, String)> {
        let (resp, etag) = self.query(method, path, body, etag).await?;
        Ok((resp.metadata_as()?, etag))
    }

    /// Request that starts a background operation.
    ///
    /// Unless event listeners are disabled, the event connection is opened
    /// before the request is sent so no update of the new operation is missed.
    pub async fn query_operation(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        etag: &str,
    ) -> Result<(Operation, String)> {
        let listener = if self.inner.options.skip_event_listener {
            None
        } else {
            match self.subscribe(self.operation_scope()).await {
                Ok(listener) => Some(listener),
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(error = %_err, "no early event listener, operation will subscribe later");
                    None
                }
            }
        };

        let created = async {
            let (resp, etag) = self.query(method, path, body, etag).await?;
            Ok::<_, Error>((resp.metadata_as_operation()?, etag))
        }
        .await;

        match created {
            Ok((state, etag)) => Ok((Operation::new(self.clone(), state, listener), etag)),
            Err(err) => {
                if let Some(listener) = listener {
                    listener.disconnect();
                }
                Err(err)
            }
        }
    }

    /// Listen to events of the configured project.
    pub async fn get_events(&self) -> Result<EventListener> {
        self.subscribe(Scope::Project(self.inner.options.project.clone()))
            .await
    }

    /// Listen to events of every project.
    pub async fn get_events_all_projects(&self) -> Result<EventListener> {
        self.subscribe(Scope::AllProjects).await
    }

    /// Publish an event through an open event connection.
    pub async fn send_event(&self, event: &Event) -> Result<()> {
        self.inner.events.publish(event).await
    }

    /// Current state of an operation.
    pub async fn get_operation(&self, id: &str) -> Result<(OperationState, String)> {
        self.query_struct(Method::Get, &operation_path(id), None, "")
            .await
    }

    /// Block server-side until the operation is final or `timeout` elapses.
    pub async fn get_operation_wait(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<OperationState> {
        let path = format!("{}/wait?timeout={}", operation_path(id), wait_seconds(timeout));
        let (state, _) = self.query_struct(Method::Get, &path, None, "").await?;
        Ok(state)
    }

    /// Like [`Client::get_operation_wait`], authenticated by an operation secret.
    pub async fn get_operation_wait_secret(
        &self,
        id: &str,
        secret: &str,
        timeout: Option<Duration>,
    ) -> Result<OperationState> {
        let path = format!(
            "{}/wait?secret={}&timeout={}",
            operation_path(id),
            urlencoding::encode(secret),
            wait_seconds(timeout)
        );
        let (state, _) = self.query_struct(Method::Get, &path, None, "").await?;
        Ok(state)
    }

    /// Cancel an operation.
    pub async fn delete_operation(&self, id: &str) -> Result<()> {
        self.query(Method::Delete, &operation_path(id), None, "")
            .await?;
        Ok(())
    }

    /// Open one of an operation's websockets.
    pub async fn get_operation_websocket(&self, id: &str, secret: &str) -> Result<SharedSocket> {
        let path = format!(
            "{}/websocket?secret={}",
            operation_path(id),
            urlencoding::encode(secret)
        );
        self.inner.transport.open_socket(&path).await
    }

    /// Track an operation obtained elsewhere, e.g. from a listing.
    #[must_use]
    pub fn operation(&self, state: OperationState) -> Operation {
        Operation::new(self.clone(), state, None)
    }

    /// An operation that is already complete.
    #[must_use]
    pub fn completed_operation(&self) -> Operation {
        Operation::completed(self.clone())
    }

    /// Close every event connection.
    pub fn disconnect(&self) {
        self.inner.events.shutdown();
    }

    pub(crate) fn operation_scope(&self) -> Scope {
        if self.inner.options.all_projects_events {
            Scope::AllProjects
        } else {
            Scope::Project(self.inner.options.project.clone())
        }
    }

    pub(crate) async fn subscribe(&self, scope: Scope) -> Result<EventListener> {
        if self.inner.options.skip_event_listener {
            return Err(Error::unsupported("event listeners are disabled for this client"));
        }

        let transport = Arc::clone(&self.inner.transport);
        let path = scope.events_path();
        self.inner
            .events
            .subscribe(scope, || async move { transport.open_socket(&path).await })
            .await
    }
}

fn operation_path(id: &str) -> String {
    format!("/operations/{}", urlencoding::encode(id))
}

fn wait_seconds(timeout: Option<Duration>) -> i64 {
    timeout.map_or(-1, |t| i64::try_from(t.as_secs()).unwrap_or(i64::MAX))
}

/// Run `fut` bounded by the timeout and cancellation token of `options`.
pub(crate) async fn race<F, T>(fut: F, options: &CallOptions) -> Result<T>
where
    F: Future<Output = T>,
{
    match (options.timeout, options.cancel.clone()) {
        (Some(t), Some(cancel)) => {
            tokio::select! {
                biased;
                r = fut => Ok(r),
                () = tokio::time::sleep(t) => Err(Error::Timeout { timeout: t }),
                () = cancel.cancelled() => Err(Error::Cancelled),
            }
        }
        (Some(t), None) => {
            tokio::select! {
                biased;
                r = fut => Ok(r),
                () = tokio::time::sleep(t) => Err(Error::Timeout { timeout: t }),
            }
        }
        (None, Some(cancel)) => {
            tokio::select! {
                biased;
                r = fut => Ok(r),
                () = cancel.cancelled() => Err(Error::Cancelled),
            }
        }
        (None, None) => Ok(fut.await),
    }
}
