//! `lxd_ops` - async client core for LXD daemons.
//!
//! This crate covers the parts of a daemon client that are about *time*:
//! - shared event streams, one connection per project scope, fanned out to any
//!   number of listeners
//! - background operations tracked through those events, or by long-polling
//!   when event listeners are disabled
//! - operations that run on another server and are retried across its
//!   addresses
//! - migration relays pairing the websockets of two operations
//!
//! Requests and socket upgrades go through a [`Transport`]. The `http` feature
//! provides one over HTTPS and websockets; tests use [`mock::MockDaemon`].
//!
//! ## Quick start
//!
//! ```no_run
//! use lxd_ops::{Client, HttpTransport, Method};
//! # async fn demo() -> lxd_ops::Result<()> {
//! let client = Client::new(HttpTransport::new("https://127.0.0.1:8443")?);
//!
//! let body = serde_json::json!({"name": "c1", "source": {"type": "none"}});
//! let (op, _) = client
//!     .query_operation(Method::Post, "/instances", Some(&body), "")
//!     .await?;
//! op.wait().await?;
//!
//! let listener = client.get_events().await?;
//! let mut events = listener.stream(["lifecycle"]);
//! if let Ok(ev) = events.recv().await {
//!     println!("event: {}", ev.event_type);
//! }
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod client;
mod event_stream;
mod operation;
mod relay;
mod remote;

pub mod error;
pub mod events;
pub mod transport;
pub mod types;

#[cfg(feature = "http")]
mod http;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use cancel::CancelToken;
pub use client::{CallOptions, Client, ClientBuilder, ConnectOptions, DEFAULT_PROJECT};
pub use error::{Error, Result};
pub use event_stream::EventStream;
pub use events::{EventListener, EventListenerManager, EventTarget, Scope};
pub use operation::Operation;
pub use relay::RelaySession;
pub use remote::RemoteOperation;
pub use transport::{Frame, Method, SharedSocket, Socket, Transport};

#[cfg(feature = "http")]
pub use http::HttpTransport;
