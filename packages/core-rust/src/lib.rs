//! Quiver Core: request/response model, error taxonomy, and header decoding
//! shared by the dispatch pipeline and its transports.

pub mod error;
pub mod header;
pub mod request;
pub mod response;

pub use error::{RpcError, RpcErrorKind};
pub use header::{HeaderError, RequestHeader};
pub use request::{MethodDescriptor, Request};
pub use response::{ErrorDescriptor, Response};

/// Re-exported so dependents build payloads without naming `rmpv` directly.
pub use rmpv::Value;
