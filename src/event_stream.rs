//! Ordered event stream.

use futures_core::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll},
};

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    error::{Error, Result},
    events::{EventListener, EventTarget},
    types::Event,
};

/// Events of one listener, in arrival order.
///
/// The stream ends when the listener terminates. Dropping it unregisters it
/// from the listener.
#[derive(Debug)]
pub struct EventStream {
    inner: UnboundedReceiverStream<Event>,
    listener: EventListener,
    target: EventTarget,
}

impl EventStream {
    pub(crate) fn new(
        listener: EventListener,
        target: EventTarget,
        rx: mpsc::UnboundedReceiver<Event>,
    ) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
            listener,
            target,
        }
    }

    /// Receive the next event.
    ///
    /// Once the listener is gone this returns the error that terminated it, or
    /// [`Error::Disconnected`] after a plain disconnect.
    pub async fn recv(&mut self) -> Result<Event> {
        use tokio_stream::StreamExt;

        match self.inner.next().await {
            Some(ev) => Ok(ev),
            None => Err(self.listener.error().unwrap_or(Error::Disconnected)),
        }
    }

    /// The listener feeding this stream.
    #[must_use]
    pub fn listener(&self) -> &EventListener {
        &self.listener
    }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        let _ = self.listener.remove_handler(&self.target);
    }
}
