//! Quiver Server. Server-side RPC dispatch with service lookup, isolated
//! invocation, single-fire responses and graceful drain.

pub mod network;
pub mod server;
pub mod service;
pub mod traits;

pub use server::RpcServer;
pub use traits::{Invoke, ResponseSink, ServiceHandler, TransportContext};
