use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{Error, Result},
    types::OperationState,
};

/// Kind of response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseType {
    /// Immediate result.
    Sync,
    /// Background operation; `metadata` holds the operation.
    Async,
    /// Error; `error_code` and `error` are set.
    Error,
}

/// Response envelope returned by every daemon endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Envelope kind.
    #[serde(rename = "type")]
    pub response_type: ResponseType,

    /// Status string (`Success`, `Operation created`, ...).
    #[serde(default)]
    pub status: String,

    /// Status code.
    #[serde(default)]
    pub status_code: u16,

    /// URL of the background operation (async responses).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operation: String,

    /// Error code (error responses).
    #[serde(default)]
    pub error_code: u16,

    /// Error message (error responses).
    #[serde(default)]
    pub error: String,

    /// Payload.
    #[serde(default)]
    pub metadata: Value,
}

impl Response {
    /// A sync response wrapping `metadata`.
    #[must_use]
    pub fn sync(metadata: Value) -> Self {
        Self {
            response_type: ResponseType::Sync,
            status: "Success".to_string(),
            status_code: 200,
            operation: String::new(),
            error_code: 0,
            error: String::new(),
            metadata,
        }
    }

    /// An async response announcing `op`.
    pub fn async_operation(op: &OperationState) -> Result<Self> {
        Ok(Self {
            response_type: ResponseType::Async,
            status: "Operation created".to_string(),
            status_code: 100,
            operation: format!("/1.0/operations/{}", op.id),
            error_code: 0,
            error: String::new(),
            metadata: serde_json::to_value(op)?,
        })
    }

    /// An error response.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::Error,
            status: String::new(),
            status_code: 0,
            operation: String::new(),
            error_code: code,
            error: message.into(),
            metadata: Value::Null,
        }
    }

    /// Turn an error envelope into [`Error::Server`].
    pub fn check(self) -> Result<Self> {
        if self.response_type == ResponseType::Error {
            return Err(Error::server(self.error_code, self.error));
        }

        Ok(self)
    }

    /// Decode the payload.
    pub fn metadata_as<T: DeserializeOwned>(&self) -> Result<T> {
        let line = self.metadata.to_string();
        let mut deserializer = serde_json::Deserializer::from_str(&line);
        serde_path_to_error::deserialize(&mut deserializer)
            .map_err(|e| Error::protocol(format!("failed to decode response metadata: {e}")))
    }

    /// Decode the payload of an async response as an operation.
    pub fn metadata_as_operation(&self) -> Result<OperationState> {
        if self.response_type != ResponseType::Async {
            return Err(Error::protocol(format!(
                "expected an async response, got {:?}",
                self.response_type
            )));
        }

        self.metadata_as()
    }
}
