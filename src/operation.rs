//! Tracking of background operations.
//!
//! An [`Operation`] follows one daemon task until it reaches a final state.
//! Event-driven operations consume `operation` events from a shared listener;
//! long-poll operations ask the daemon to block instead.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    cancel::CancelToken,
    client::{race, CallOptions, Client},
    error::{Error, Result},
    events::{EventListener, EventTarget, Scope},
    transport::SharedSocket,
    types::{Event, OperationState, StatusCode, EVENT_TYPE_OPERATION},
};

/// Slack added on top of the server-side wait so the daemon answers first.
const LONG_POLL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum Tracking {
    Events { scope: Scope },
    LongPoll,
    Completed,
}

/// Handle to a background operation.
///
/// Clones share the same tracking state.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<Inner>,
}

struct Inner {
    client: Client,
    id: String,
    tracking: Tracking,
    state: Mutex<State>,
    // `true` once the listener is bound and the monitor runs.
    setup: tokio::sync::Mutex<bool>,
    done: CancelToken,
}

struct State {
    current: OperationState,
    listener: Option<EventListener>,
    completed: bool,
    failure: Option<Error>,
}

impl Operation {
    pub(crate) fn new(client: Client, current: OperationState, listener: Option<EventListener>) -> Self {
        let tracking = if client.options().skip_event_listener {
            Tracking::LongPoll
        } else {
            Tracking::Events {
                scope: client.operation_scope(),
            }
        };

        let listener = match tracking {
            Tracking::Events { .. } => listener,
            _ => {
                if let Some(listener) = listener {
                    listener.disconnect();
                }
                None
            }
        };

        Self::with_tracking(client, current, listener, tracking)
    }

    pub(crate) fn completed(client: Client) -> Self {
        let state = OperationState::new("", StatusCode::Success);
        Self::with_tracking(client, state, None, Tracking::Completed)
    }

    fn with_tracking(
        client: Client,
        current: OperationState,
        listener: Option<EventListener>,
        tracking: Tracking,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                id: current.id.clone(),
                tracking,
                state: Mutex::new(State {
                    current,
                    listener,
                    completed: false,
                    failure: None,
                }),
                setup: tokio::sync::Mutex::new(false),
                done: CancelToken::new(),
            }),
        }
    }

    /// Operation id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Last known state.
    #[must_use]
    pub fn current_state(&self) -> OperationState {
        self.lock_state().current.clone()
    }

    /// Whether updates arrive through an event listener.
    #[must_use]
    pub fn is_event_driven(&self) -> bool {
        matches!(self.inner.tracking, Tracking::Events { .. })
    }

    /// Call `handler` with every update of this operation.
    ///
    /// Returns `Ok(None)` when the operation is already final. Fails with
    /// [`Error::Unsupported`] when the operation is not event driven.
    pub async fn add_handler<F>(&self, handler: F) -> Result<Option<EventTarget>>
    where
        F: Fn(OperationState) + Send + Sync + 'static,
    {
        if !self.is_event_driven() {
            return Err(Error::unsupported(
                "cannot add handler, client operation does not support event listeners",
            ));
        }

        self.setup().await?;

        let listener = {
            let state = self.lock_state();
            if state.completed || state.current.is_final() {
                return Ok(None);
            }
            match &state.listener {
                Some(listener) => listener.clone(),
                None => return Ok(None),
            }
        };

        let id = self.inner.id.clone();
        let target = listener.add_handler([EVENT_TYPE_OPERATION], move |event: Event| {
            if let Ok(update) = event.metadata_as::<OperationState>() {
                if update.id == id {
                    handler(update);
                }
            }
        });

        Ok(Some(target))
    }

    /// Remove a handler returned by [`Operation::add_handler`].
    ///
    /// A no-op once the operation stopped listening.
    pub fn remove_handler(&self, target: &EventTarget) -> Result<()> {
        if !self.is_event_driven() {
            return Err(Error::unsupported(
                "cannot remove handler, client operation does not support event listeners",
            ));
        }

        let listener = self.lock_state().listener.clone();
        match listener {
            Some(listener) => listener.remove_handler(target),
            None => Ok(()),
        }
    }

    /// Fetch the current state from the daemon.
    pub async fn refresh(&self) -> Result<()> {
        if matches!(self.inner.tracking, Tracking::Completed) {
            return Ok(());
        }

        let (update, _) = self.inner.client.get_operation(&self.inner.id).await?;

        let mut state = self.lock_state();
        if state.completed || state.current.is_final() {
            return Ok(());
        }
        state.current = update;
        if state.current.is_final() {
            self.finish(&mut state);
        }

        Ok(())
    }

    /// Ask the daemon to cancel the operation.
    pub async fn cancel(&self) -> Result<()> {
        if matches!(self.inner.tracking, Tracking::Completed) {
            return Ok(());
        }

        self.inner.client.delete_operation(&self.inner.id).await
    }

    /// Open the websocket identified by `secret`.
    pub async fn websocket(&self, secret: &str) -> Result<SharedSocket> {
        if matches!(self.inner.tracking, Tracking::Completed) {
            return Err(Error::unsupported("completed operation has no websockets"));
        }

        self.inner
            .client
            .get_operation_websocket(&self.inner.id, secret)
            .await
    }

    /// Wait for the operation to finish, bounded by the client's default timeout.
    pub async fn wait(&self) -> Result<()> {
        self.wait_with(CallOptions {
            timeout: self.inner.client.options().default_timeout,
            cancel: None,
        })
        .await
    }

    /// Wait for the operation to finish.
    ///
    /// A failed operation yields [`Error::OperationFailed`] carrying the
    /// daemon's error text; a broken listener yields the listener's error.
    pub async fn wait_with(&self, options: CallOptions) -> Result<()> {
        if let Some(outcome) = self.settled() {
            return outcome;
        }

        match &self.inner.tracking {
            Tracking::Completed => Ok(()),
            Tracking::LongPoll => self.wait_long_poll(options).await,
            Tracking::Events { .. } => {
                let tracked = async {
                    self.setup().await?;
                    self.inner.done.cancelled().await;
                    Ok::<_, Error>(())
                };
                race(tracked, &options).await??;
                self.outcome()
            }
        }
    }

    async fn wait_long_poll(&self, options: CallOptions) -> Result<()> {
        let local = CallOptions {
            timeout: options.timeout.map(|t| t + LONG_POLL_GRACE),
            cancel: options.cancel.clone(),
        };
        let update = race(
            self.inner
                .client
                .get_operation_wait(&self.inner.id, options.timeout),
            &local,
        )
        .await??;

        let mut state = self.lock_state();
        if !state.completed {
            state.current = update;
            if state.current.is_final() {
                self.finish(&mut state);
            }
        }

        if !state.current.is_final() {
            return Err(match options.timeout {
                Some(timeout) => Error::Timeout { timeout },
                None => Error::protocol(format!(
                    "wait on operation {} returned before it finished",
                    self.inner.id
                )),
            });
        }

        outcome_of(&state)
    }

    /// Bind the listener and start the monitor, once.
    ///
    /// Dropping the future part way leaves setup to be retried: the monitor
    /// only starts once the initial refresh has been applied.
    async fn setup(&self) -> Result<()> {
        let Tracking::Events { scope } = &self.inner.tracking else {
            return Err(Error::unsupported(
                "cannot set up event listener, client operation does not support event listeners",
            ));
        };

        let mut ready = self.inner.setup.lock().await;
        if *ready {
            return Ok(());
        }

        let early = {
            let mut state = self.lock_state();
            if state.current.is_final() {
                self.finish(&mut state);
            }
            if state.completed {
                *ready = true;
                return Ok(());
            }
            state.listener.clone()
        };

        let listener = match early {
            Some(listener) if listener.is_active() => listener,
            _ => self.inner.client.subscribe(scope.clone()).await?,
        };

        {
            let mut state = self.lock_state();
            if state.completed {
                listener.disconnect();
                *ready = true;
                return Ok(());
            }
            state.listener = Some(listener.clone());
        }

        let (target, events) = listener.add_queue([EVENT_TYPE_OPERATION]);
        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(self.clone().monitor(listener, target, events, ready_rx));

        if let Err(err) = self.refresh().await {
            let mut state = self.lock_state();
            if !state.completed {
                state.failure = Some(err.clone_for_task());
                self.finish(&mut state);
            }
            return Err(err);
        }

        let _ = ready_tx.send(());
        *ready = true;

        #[cfg(feature = "tracing")]
        tracing::debug!(operation = %self.inner.id, "tracking operation through events");

        Ok(())
    }

    async fn monitor(
        self,
        listener: EventListener,
        target: EventTarget,
        mut events: mpsc::UnboundedReceiver<Event>,
        ready: oneshot::Receiver<()>,
    ) {
        if ready.await.is_err() {
            let _ = listener.remove_handler(&target);
            return;
        }

        let closed = listener.closed();
        tokio::pin!(closed);
        let done = self.inner.done.cancelled();
        tokio::pin!(done);

        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => {
                        if self.apply_event(&event) {
                            return;
                        }
                    }
                    None => {
                        self.listener_lost(&listener);
                        return;
                    }
                },
                () = &mut done => return,
                () = &mut closed => {
                    self.listener_lost(&listener);
                    return;
                }
            }
        }
    }

    /// Apply one event; `true` once the operation is complete.
    fn apply_event(&self, event: &Event) -> bool {
        let Ok(update) = event.metadata_as::<OperationState>() else {
            return false;
        };
        if update.id != self.inner.id {
            return false;
        }

        let mut state = self.lock_state();
        if state.completed {
            return true;
        }
        state.current = update;
        if state.current.is_final() {
            self.finish(&mut state);
            return true;
        }

        false
    }

    fn listener_lost(&self, listener: &EventListener) {
        let mut state = self.lock_state();
        if state.completed {
            return;
        }

        let err = listener.error().unwrap_or(Error::Disconnected);

        #[cfg(feature = "tracing")]
        tracing::warn!(operation = %self.inner.id, error = %err, "operation listener lost");

        state.current.err = err.to_string();
        state.failure = Some(err);
        self.finish(&mut state);
    }

    /// Complete exactly once: drop the listener and wake every waiter.
    fn finish(&self, state: &mut State) {
        if state.completed {
            return;
        }
        state.completed = true;

        if let Some(listener) = state.listener.take() {
            listener.disconnect();
        }
        self.inner.done.cancel();

        #[cfg(feature = "tracing")]
        tracing::debug!(operation = %self.inner.id, status = %state.current.status, "operation finished");
    }

    fn settled(&self) -> Option<Result<()>> {
        let mut state = self.lock_state();
        if state.current.is_final() {
            self.finish(&mut state);
        }
        state.completed.then(|| outcome_of(&state))
    }

    fn outcome(&self) -> Result<()> {
        outcome_of(&self.lock_state())
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(listener) = state.listener.take() {
            listener.disconnect();
        }
    }
}

fn outcome_of(state: &State) -> Result<()> {
    if let Some(failure) = &state.failure {
        return Err(failure.clone_for_task());
    }
    if state.current.err.is_empty() {
        Ok(())
    } else {
        Err(Error::operation_failed(state.current.err.clone()))
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Operation")
            .field("id", &self.inner.id)
            .field("tracking", &self.inner.tracking)
            .field("status", &state.current.status_code)
            .field("completed", &state.completed)
            .finish()
    }
}
