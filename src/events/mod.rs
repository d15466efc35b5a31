//! Shared event connections.
//!
//! One socket per [`Scope`] fans out to every [`EventListener`] bound to that
//! scope. The connection is dropped when the read loop fails or when an idle
//! check finds no listener left.

mod listener;
mod manager;

pub use listener::{EventHandler, EventListener, EventTarget};
pub use manager::{EventListenerManager, Scope, DEFAULT_IDLE_INTERVAL, PUBLISH_TIMEOUT};
