//! Public data types.

mod event;
mod operation;
mod response;

pub use event::{Event, EVENT_TYPE_LIFECYCLE, EVENT_TYPE_LOGGING, EVENT_TYPE_OPERATION};
pub use operation::{OperationClass, OperationState, StatusCode, SECRET_NAME_CONTROL};
pub use response::{Response, ResponseType};
