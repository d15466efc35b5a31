use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Name of the migration control channel.
pub const SECRET_NAME_CONTROL: &str = "control";

/// Operation status code.
///
/// Codes unknown to this crate are kept as [`StatusCode::Other`]. Anything at or
/// above 200 is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "u16", into = "u16")]
pub enum StatusCode {
    /// 100
    Created,
    /// 103
    Running,
    /// 104
    Cancelling,
    /// 105
    #[default]
    Pending,
    /// 200
    Success,
    /// 400
    Failure,
    /// 401
    Cancelled,
    /// Any other code.
    Other(u16),
}

impl StatusCode {
    /// Numeric value.
    #[must_use]
    pub fn code(self) -> u16 {
        match self {
            Self::Created => 100,
            Self::Running => 103,
            Self::Cancelling => 104,
            Self::Pending => 105,
            Self::Success => 200,
            Self::Failure => 400,
            Self::Cancelled => 401,
            Self::Other(code) => code,
        }
    }

    /// Whether no further transitions can happen.
    #[must_use]
    pub fn is_final(self) -> bool {
        self.code() >= 200
    }

    /// Status string as rendered by the daemon.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "Operation created",
            Self::Running => "Running",
            Self::Cancelling => "Cancelling",
            Self::Pending => "Pending",
            Self::Success => "Success",
            Self::Failure => "Failure",
            Self::Cancelled => "Cancelled",
            Self::Other(_) => "Unknown",
        }
    }
}

impl From<u16> for StatusCode {
    fn from(code: u16) -> Self {
        match code {
            100 => Self::Created,
            103 => Self::Running,
            104 => Self::Cancelling,
            105 => Self::Pending,
            200 => Self::Success,
            400 => Self::Failure,
            401 => Self::Cancelled,
            other => Self::Other(other),
        }
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> Self {
        code.code()
    }
}

/// Operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    /// Background task.
    #[default]
    Task,
    /// Task exposing websockets.
    Websocket,
    /// Authorization token.
    Token,
}

/// The daemon's view of one operation.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OperationState {
    /// Operation id.
    pub id: String,

    /// Operation class.
    #[serde(default)]
    pub class: OperationClass,

    /// Human readable description.
    #[serde(default)]
    pub description: String,

    /// Creation timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,

    /// Last update timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,

    /// Status string.
    #[serde(default)]
    pub status: String,

    /// Status code.
    #[serde(default)]
    pub status_code: StatusCode,

    /// Affected resources, by kind.
    #[serde(default)]
    pub resources: HashMap<String, Vec<String>>,

    /// Operation specific payload.
    #[serde(default)]
    pub metadata: Value,

    /// Whether the operation can be cancelled.
    #[serde(default)]
    pub may_cancel: bool,

    /// Error message, set on failure.
    #[serde(default)]
    pub err: String,

    /// Cluster member running the operation.
    #[serde(default)]
    pub location: String,
}

impl OperationState {
    /// A fresh operation in the given state.
    #[must_use]
    pub fn new(id: impl Into<String>, status_code: StatusCode) -> Self {
        Self {
            id: id.into(),
            status: status_code.as_str().to_string(),
            status_code,
            ..Self::default()
        }
    }

    /// Whether the operation reached a final state.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.status_code.is_final()
    }

    /// Websocket secrets exposed by a websocket-class operation, by channel name.
    ///
    /// Exec-style operations nest them under `fds`; migration operations put
    /// them at the top level of `metadata`.
    pub fn websocket_secrets(&self) -> Result<HashMap<String, String>> {
        let source = self.metadata.get("fds").unwrap_or(&self.metadata);
        let Some(map) = source.as_object() else {
            return Err(Error::protocol(format!(
                "operation {} does not expose websocket secrets",
                self.id
            )));
        };

        Ok(map
            .iter()
            .filter_map(|(name, secret)| Some((name.clone(), secret.as_str()?.to_string())))
            .collect())
    }
}
