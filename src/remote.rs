//! Operations that run on another server.
//!
//! A [`RemoteOperation`] wraps the operation currently doing the work, which
//! may be swapped while it tries the source server's addresses one by one.

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    cancel::CancelToken,
    client::{race, CallOptions},
    error::{Error, Result},
    events::EventTarget,
    operation::Operation,
    types::{OperationState, EVENT_TYPE_OPERATION},
};

type OperationHandler = Arc<dyn Fn(OperationState) + Send + Sync>;

/// A composite operation, possibly retried across several addresses.
#[derive(Clone)]
pub struct RemoteOperation {
    inner: Arc<Inner>,
}

struct Inner {
    state: Mutex<State>,
    done: CancelToken,
    post: Mutex<Option<CancelToken>>,
}

#[derive(Default)]
struct State {
    target: Option<Operation>,
    handlers: Vec<OperationHandler>,
    err: Option<Error>,
}

impl RemoteOperation {
    fn empty() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                done: CancelToken::new(),
                post: Mutex::new(None),
            }),
        }
    }

    /// Wrap a single operation.
    #[must_use]
    pub fn track(op: Operation) -> Self {
        let remote = Self::empty();
        remote.lock_state().target = Some(op.clone());

        let task = remote.clone();
        tokio::spawn(async move {
            let res = op.wait().await;
            task.complete(res.err());
        });

        remote
    }

    /// Try `create` against each of `urls` in order until one operation
    /// succeeds.
    ///
    /// Connection-class failures move on to the next address; anything else
    /// stops the attempt. If every attempt fails, `source` is cancelled and
    /// the remote operation fails with an error aggregating every attempt
    /// under `context`.
    pub fn try_create<F, Fut>(
        context: impl Into<String>,
        urls: Vec<String>,
        source: Option<Operation>,
        create: F,
    ) -> Result<Self>
    where
        F: FnMut(String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Operation>> + Send + 'static,
    {
        if urls.is_empty() {
            return Err(Error::invalid_input(
                "the source server isn't listening on the network",
            ));
        }

        let context = context.into();
        let remote = Self::empty();
        let task = remote.clone();
        tokio::spawn(async move {
            let mut create = create;
            let mut failures: Vec<(String, Error)> = Vec::new();

            for url in urls {
                let outcome = match create(url.clone()).await {
                    Ok(op) => {
                        task.bind(op.clone()).await;
                        op.wait().await
                    }
                    Err(err) => Err(err),
                };

                let err = match outcome {
                    Ok(()) => {
                        task.complete(None);
                        return;
                    }
                    Err(err) => err,
                };

                #[cfg(feature = "tracing")]
                tracing::warn!(url = %url, error = %err, "remote operation attempt failed");

                let retry = err.is_connection();
                failures.push((url, err));
                if !retry {
                    break;
                }
            }

            if let Some(source) = &source {
                if let Err(_err) = source.cancel().await {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(operation = source.id(), error = %_err, "failed to cancel source operation");
                }
            }

            let err = remote_operation_error(&context, &failures)
                .unwrap_or_else(|| Error::Remote { message: context });
            task.complete(Some(err));
        });

        Ok(remote)
    }

    /// Replay registered handlers onto the new target.
    async fn bind(&self, op: Operation) {
        let handlers = {
            let mut state = self.lock_state();
            state.target = Some(op.clone());
            state.handlers.clone()
        };

        for handler in handlers {
            if let Err(_err) = op.add_handler(move |update| handler(update)).await {
                #[cfg(feature = "tracing")]
                tracing::debug!(operation = op.id(), error = %_err, "failed to replay handler");
            }
        }
    }

    fn complete(&self, err: Option<Error>) {
        self.lock_state().err = err;
        self.inner.done.cancel();
    }

    /// Call `handler` with every update of the current target.
    ///
    /// Handlers added before a target exists are replayed onto every target
    /// bound later; a detached placeholder is returned in that case. A
    /// handler the current target rejects is not kept.
    pub async fn add_handler<F>(&self, handler: F) -> Result<Option<EventTarget>>
    where
        F: Fn(OperationState) + Send + Sync + 'static,
    {
        let handler: OperationHandler = Arc::new(handler);
        let target = {
            let mut state = self.lock_state();
            match state.target.clone() {
                Some(op) => op,
                None => {
                    state.handlers.push(handler);
                    return Ok(Some(EventTarget::detached([EVENT_TYPE_OPERATION])));
                }
            }
        };

        let replay = Arc::clone(&handler);
        let added = target.add_handler(move |update| replay(update)).await?;
        self.lock_state().handlers.push(handler);
        Ok(added)
    }

    /// Cancel the current target.
    pub async fn cancel_target(&self) -> Result<()> {
        self.target()?.cancel().await
    }

    /// State of the current target.
    pub fn get_target(&self) -> Result<OperationState> {
        Ok(self.target()?.current_state())
    }

    /// Run `fut` once the remote operation has succeeded; its error, if any,
    /// becomes the result of [`RemoteOperation::wait`].
    pub fn post_process<Fut>(&self, fut: Fut)
    where
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let signal = CancelToken::new();
        *self
            .inner
            .post
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(signal.clone());

        let remote = self.clone();
        tokio::spawn(async move {
            remote.inner.done.cancelled().await;
            let succeeded = remote.lock_state().err.is_none();
            if succeeded {
                if let Err(err) = fut.await {
                    remote.lock_state().err = Some(err);
                }
            }
            signal.cancel();
        });
    }

    /// Wait for the remote operation and any post-processing.
    pub async fn wait(&self) -> Result<()> {
        self.wait_with(CallOptions::default()).await
    }

    /// Like [`RemoteOperation::wait`], bounded by `options`.
    pub async fn wait_with(&self, options: CallOptions) -> Result<()> {
        race(self.inner.done.cancelled(), &options).await?;

        let post = self
            .inner
            .post
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(post) = post {
            race(post.cancelled(), &options).await?;
        }

        match &self.lock_state().err {
            Some(err) => Err(err.clone_for_task()),
            None => Ok(()),
        }
    }

    fn target(&self) -> Result<Operation> {
        self.lock_state().target.clone().ok_or(Error::NoTarget)
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for RemoteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("RemoteOperation")
            .field("target", &state.target.as_ref().map(Operation::id))
            .field("handlers", &state.handlers.len())
            .field("done", &self.inner.done.is_cancelled())
            .finish()
    }
}

/// Fold per-address failures into one error.
///
/// Identical messages collapse into `"{context}: {message}"`; otherwise each
/// address gets its own line.
pub(crate) fn remote_operation_error(context: &str, failures: &[(String, Error)]) -> Option<Error> {
    let (_, first) = failures.first()?;
    let first = first.to_string();

    let message = if failures.iter().all(|(_, err)| err.to_string() == first) {
        format!("{context}: {first}")
    } else {
        let lines: Vec<String> = failures
            .iter()
            .map(|(url, err)| format!("{url}: {err}"))
            .collect();
        format!("{context}:\n - {}", lines.join("\n - "))
    };

    Some(Error::Remote { message })
}
