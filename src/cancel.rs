//! Cooperative cancellation.
//!
//! This crate avoids exposing a Tokio-specific cancellation token in the public API.
//! The implementation is currently backed by `tokio::sync::Notify`.
//!
//! Tokens form a tree: cancelling a token cancels every child created from it,
//! while cancelling a child leaves its parent and siblings untouched. The event
//! manager uses this to tie listener lifetimes to their scope connection.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError, Weak,
};

use tokio::sync::Notify;

/// A clonable cancellation token.
///
/// Clones share the same cancellation state.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
    children: Mutex<Vec<Weak<Inner>>>,
}

impl CancelToken {
    /// Create a new, non-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that is cancelled whenever `self` is.
    ///
    /// If `self` is already cancelled the child starts out cancelled.
    #[must_use]
    pub fn child(&self) -> Self {
        let child = Self::new();
        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_cancelled() {
            drop(children);
            child.cancel();
        } else {
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(&child.inner));
        }
        child
    }

    /// Cancel this token and all of its descendants.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.notify.notify_waiters();

        let children = std::mem::take(
            &mut *self
                .inner
                .children
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for child in children.iter().filter_map(Weak::upgrade) {
            Self { inner: child }.cancel();
        }
    }

    /// Returns `true` if the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// A future that resolves when the token is cancelled.
    ///
    /// The returned future is `Send` and does **not** expose Tokio types.
    pub fn cancelled(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let token = self.clone();
        async move {
            loop {
                let notified = token.inner.notify.notified();
                tokio::pin!(notified);
                // Register before checking so a concurrent `cancel()` cannot slip between.
                notified.as_mut().enable();
                if token.is_cancelled() {
                    return;
                }
                notified.await;
            }
        }
    }
}
