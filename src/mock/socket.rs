use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::mpsc;

use crate::{
    cancel::CancelToken,
    error::{Error, Result},
    transport::{BoxFuture, Frame, Socket},
};

/// Shared record of socket closes, in order.
pub(crate) type CloseLog = Arc<Mutex<Vec<String>>>;

/// One end of an in-memory socket pair.
///
/// Whatever one end sends, the other receives. Closing either end makes the
/// other end's `recv` return `Ok(None)` once its queue is drained.
pub struct MemorySocket {
    label: String,
    tx: mpsc::UnboundedSender<Result<Frame>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Frame>>>,
    closed: CancelToken,
    peer_closed: CancelToken,
    log: CloseLog,
}

impl MemorySocket {
    /// Create a connected pair.
    pub(crate) fn pair(
        label_a: impl Into<String>,
        label_b: impl Into<String>,
        log: CloseLog,
    ) -> (Arc<Self>, Arc<Self>) {
        let (tx_a, rx_b) = mpsc::unbounded_channel();
        let (tx_b, rx_a) = mpsc::unbounded_channel();
        let (closed_a, closed_b) = (CancelToken::new(), CancelToken::new());

        let a = Self {
            label: label_a.into(),
            tx: tx_a,
            rx: tokio::sync::Mutex::new(rx_a),
            closed: closed_a.clone(),
            peer_closed: closed_b.clone(),
            log: Arc::clone(&log),
        };
        let b = Self {
            label: label_b.into(),
            tx: tx_b,
            rx: tokio::sync::Mutex::new(rx_b),
            closed: closed_b,
            peer_closed: closed_a,
            log,
        };

        (Arc::new(a), Arc::new(b))
    }

    /// Label recorded in the close log.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether this end was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Whether neither end was closed.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.peer_closed.is_cancelled()
    }

    /// Make the peer's next `recv` fail with a connection error.
    pub fn send_error(&self, message: impl Into<String>) {
        let _ = self.tx.send(Err(Error::connection(message)));
    }

    async fn next_frame(&self) -> Result<Option<Frame>> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Ok(None),
            msg = rx.recv() => match msg {
                Some(msg) => msg.map(Some),
                None => Ok(None),
            },
            () = self.peer_closed.cancelled() => Ok(None),
        }
    }

    /// Queue `frame` for the peer.
    pub fn push(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Disconnected);
        }
        self.tx.send(Ok(frame)).map_err(|_| Error::Disconnected)
    }

    fn shut(&self) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.closed.is_cancelled() {
            log.push(self.label.clone());
            self.closed.cancel();
        }
    }
}

impl Socket for MemorySocket {
    fn recv(&self) -> BoxFuture<'_, Result<Option<Frame>>> {
        Box::pin(self.next_frame())
    }

    fn send(&self, frame: Frame) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.push(frame) })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.shut();
            Ok(())
        })
    }
}

impl fmt::Debug for MemorySocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySocket")
            .field("label", &self.label)
            .field("open", &self.is_open())
            .finish()
    }
}
