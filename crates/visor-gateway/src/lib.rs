//! Correlation transport for the gateway link: one persistent WebSocket,
//! request/response matching by id, run-lifecycle matching for turns that
//! have no direct response, and indefinite reconnection with backoff.

mod backoff;
mod client;
mod runs;

pub use backoff::{Backoff, BackoffConfig};
pub use client::{ConnectionState, GatewayClient, GatewayConfig, TransportStatus};
pub use runs::{RunRegistry, RunTimeouts};
