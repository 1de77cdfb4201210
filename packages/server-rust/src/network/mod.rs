//! Transport-facing types: lifecycle control and per-request transport context.

pub mod lifecycle;
pub mod transport;

pub use lifecycle::*;
pub use transport::*;
