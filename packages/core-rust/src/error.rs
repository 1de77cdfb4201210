use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of failures the dispatch pipeline can report to a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcErrorKind {
    /// The server is not accepting work (not started, draining, or stopped).
    ServerUnavailable,
    /// The worker pool selected for the request could not take more work.
    ServerBusy,
    /// The target service or method is not registered.
    NotFound,
    /// The client already gave up waiting for this request or its response.
    ClientTimeout,
    /// Any uncaught failure raised while invoking business or framework code.
    UndeclaredServerError,
}

impl RpcErrorKind {
    /// Stable lowercase identifier, suitable for log fields and metric labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ServerUnavailable => "server_unavailable",
            Self::ServerBusy => "server_busy",
            Self::NotFound => "not_found",
            Self::ClientTimeout => "client_timeout",
            Self::UndeclaredServerError => "undeclared_server_error",
        }
    }
}

impl fmt::Display for RpcErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A structured dispatch failure: a kind plus a human-readable message.
///
/// Constructed by the pipeline for logging, telemetry and error responses.
/// It never escapes the pipeline as a panic.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{kind}] {message}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcError {
    #[must_use]
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn server_unavailable(address: &str) -> Self {
        Self::new(
            RpcErrorKind::ServerUnavailable,
            format!("server at {address} is not accepting requests"),
        )
    }

    #[must_use]
    pub fn server_busy(executor: &str) -> Self {
        Self::new(
            RpcErrorKind::ServerBusy,
            format!("worker pool [{executor}] is saturated"),
        )
    }

    #[must_use]
    pub fn service_not_found(service: &str) -> Self {
        Self::new(
            RpcErrorKind::NotFound,
            format!("cannot find service [{service}]"),
        )
    }

    #[must_use]
    pub fn method_not_found(service: &str, method: &str) -> Self {
        Self::new(
            RpcErrorKind::NotFound,
            format!("cannot find method [{method}] of service [{service}]"),
        )
    }

    /// The client expired before the request reached business logic.
    #[must_use]
    pub fn discarded_request(service: &str, remote: &str) -> Self {
        Self::new(
            RpcErrorKind::ClientTimeout,
            format!("discard timeout request of service [{service}] from [{remote}]"),
        )
    }

    /// The client expired while business logic was running.
    #[must_use]
    pub fn discarded_response(service: &str, remote: &str) -> Self {
        Self::new(
            RpcErrorKind::ClientTimeout,
            format!("client of service [{service}] at [{remote}] timed out before the response was ready"),
        )
    }

    #[must_use]
    pub fn undeclared(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::UndeclaredServerError, message)
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(err: anyhow::Error) -> Self {
        // `{:#}` keeps the context chain on one line.
        Self::undeclared(format!("{err:#}"))
    }
}
