//! Client-side connection pooling for RPC clients
//!
//! A [`Client`] owns one bounded pool of connections to a single endpoint and
//! exposes a set of remote methods over it. Each call leases a connection,
//! races the reply against failures reported by the transport, and returns the
//! connection once the call has settled. Connections that closed, errored,
//! timed out or outlived their TTL are never handed out again.

pub mod client;
pub mod common;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod factory;
pub mod lease;
pub mod policy;
pub mod pool;
pub mod protocol;
pub mod tcp;
pub mod transport;

pub use client::{Client, ClientBuilder, Service};
pub use config::{Endpoint, PoolConfig, PoolOptions, TransportOptions};
pub use dispatch::Method;
pub use error::{CallError, ConfigError, ConnectionError};
pub use lease::Connection;
pub use policy::{ConnectionPool, create_pool};
pub use pool::{Pool, PoolError, PoolStatus};
pub use protocol::Protocol;
pub use tcp::{TcpConnection, TcpTransport};
pub use transport::{ConnectOptions, ConnectionEvent, ConnectionEvents, Transport};
