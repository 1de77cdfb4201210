use std::net::SocketAddr;

use quiver_core::{MethodDescriptor, Request, Response, RpcError, Value};

use crate::network::TimingMarks;
use crate::service::InvocationContext;

/// Per-request view of the transport that decoded the request.
/// Implementations: `BizContext` (bundled), transport-specific adapters.
pub trait TransportContext: Send + Sync {
    /// Address of the remote peer, if the transport knows it.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Whether the client has already given up waiting for this request.
    fn is_request_timeout(&self) -> bool;

    /// Timing marks recorded by the transport so far.
    fn timing(&self) -> TimingMarks;

    /// Whether the server counted this request in-flight when it was
    /// accepted. Admitted requests are served while the server drains.
    fn is_admitted(&self) -> bool {
        false
    }
}

/// Write side of a single client exchange, owned by the transport.
///
/// Wrapped in a `CompletionHandle`, which guarantees it is called at most once.
pub trait ResponseSink: Send + Sync {
    /// Hand a finished response back to the transport.
    fn send_response(&self, response: Response) -> anyhow::Result<()>;
}

/// Business logic behind a registered provider.
///
/// Runs on a pool worker with the service's own `ServiceLoader` installed.
/// Returning `Err` or panicking yields an undeclared-server-error response.
/// To complete asynchronously, call `ctx.defer_completion()` and fire the
/// returned handle later; the returned value is then discarded.
pub trait ServiceHandler: Send + Sync {
    fn handle(
        &self,
        method: &MethodDescriptor,
        args: &[Value],
        ctx: &mut InvocationContext,
    ) -> anyhow::Result<Value>;
}

/// Raw invocation capability for invokers that are not plain providers
/// (e.g., filters, proxies, generic services).
pub trait Invoke: Send + Sync {
    fn invoke(&self, request: &Request, ctx: &mut InvocationContext) -> Result<Response, RpcError>;
}
