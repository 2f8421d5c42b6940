// Client-side core of a multiplexed transport: many logical
// request/response exchanges share a few long-lived connections, each
// exchange identified by a stream id assigned at submit time.
//
// DESIGN INTENT
// -------------
// Per-connection state (stream registry, response assembly, interceptor
// chain) is owned by exactly one driver task and fed through one queue,
// so events for a connection are processed strictly one at a time and the
// hot path takes no locks. Callers on other tasks get their results
// through oneshot futures resolved exactly once by the driver.
//
// Cross-connection state is only the pool's membership map, guarded by a
// mutex that is never held across an await. We scale by adding pooled
// connections per destination, never by sharing mutable per-connection
// state between tasks.
//
// The wire codec is an external collaborator: it decodes frames and
// delivers semantic per-stream events (`ConnectionEvent`) via
// `ConnectionHandle::deliver`. Outbound request writing, transport setup,
// and flow-control accounting live on the codec's side of that seam.
#[macro_use]
mod macros;

mod assembler;
pub mod config;
pub mod connection;
pub mod exchange;
pub mod interceptor;
pub mod pool;
mod registry;

pub use config::PoolConfig;
pub use connection::{ConnectionHandle, Lifecycle, OutboundRequest};
pub use exchange::{MessageExchange, PushPromise, PushPromises, ResponseFuture};
pub use interceptor::EventInterceptor;
pub use pool::{ConnectionPool, Connector, spawn_sweeper};
pub use strand_types as types;

#[cfg(test)]
mod tests;
