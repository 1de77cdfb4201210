use rmpv::Value;
use serde::{Deserialize, Serialize};

use crate::error::{RpcError, RpcErrorKind};

/// Error half of a `Response`, as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: RpcErrorKind,
    pub message: String,
}

/// The answer to exactly one `Request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// The invoked method's return value.
    Payload(Value),
    /// The call failed before or during invocation.
    Error(ErrorDescriptor),
}

impl Response {
    #[must_use]
    pub fn payload(value: impl Into<Value>) -> Self {
        Self::Payload(value.into())
    }

    #[must_use]
    pub fn error(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self::Error(ErrorDescriptor {
            kind,
            message: message.into(),
        })
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    #[must_use]
    pub fn as_payload(&self) -> Option<&Value> {
        match self {
            Self::Payload(value) => Some(value),
            Self::Error(_) => None,
        }
    }

    #[must_use]
    pub fn as_error(&self) -> Option<&ErrorDescriptor> {
        match self {
            Self::Payload(_) => None,
            Self::Error(desc) => Some(desc),
        }
    }
}

impl From<&RpcError> for Response {
    fn from(err: &RpcError) -> Self {
        Self::error(err.kind, err.message.clone())
    }
}
