//! Transport contract.
//!
//! The core never builds URLs or dials sockets itself. Everything goes through a
//! [`Transport`]: one request/response call and one socket upgrade. Both are
//! expected to be authenticated already.

use std::{fmt, future::Future, pin::Pin, sync::Arc};

use serde_json::Value;

use crate::{error::Result, types::Response};

/// Boxed future returned by the transport traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// HTTP method of a [`Transport::query`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
}

impl Method {
    /// Upper-case method name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on a duplex socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 payload (event frames).
    Text(String),
    /// Binary payload (migration and exec data).
    Binary(Vec<u8>),
}

impl Frame {
    /// Payload bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(data) => data,
        }
    }
}

/// A message-framed duplex connection.
///
/// Methods take `&self` so one task can read while others write or close.
/// `close` must make a pending `recv` on the same socket return.
pub trait Socket: Send + Sync {
    /// Next frame; `Ok(None)` once the peer closed cleanly.
    fn recv(&self) -> BoxFuture<'_, Result<Option<Frame>>>;

    /// Send one frame.
    fn send(&self, frame: Frame) -> BoxFuture<'_, Result<()>>;

    /// Close the connection. Closing twice is a no-op.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Shared handle to an open socket.
pub type SharedSocket = Arc<dyn Socket>;

/// Connection provider consumed by the core.
pub trait Transport: Send + Sync {
    /// One request/response round trip against `/1.0{path}`.
    ///
    /// Returns the decoded envelope and the response `ETag`. Error envelopes are
    /// turned into [`crate::Error::Server`].
    fn query<'a>(
        &'a self,
        method: Method,
        path: &'a str,
        body: Option<&'a Value>,
        etag: &'a str,
    ) -> BoxFuture<'a, Result<(Response, String)>>;

    /// Upgrade `/1.0{path}` to a duplex socket.
    fn open_socket<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<SharedSocket>>;
}
