//! Pool policy for transport connections

use std::future::Future;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::{PoolConfig, TransportOptions};
use crate::error::ConnectionError;
use crate::factory::ConnectionFactory;
use crate::lease::Connection;
use crate::pool::{Lease, Manage, Pool};
use crate::transport::Transport;

pub type ConnectionPool<T> = Pool<PoolPolicy<T>>;
pub type ConnectionLease<T> = Lease<PoolPolicy<T>>;

/// Creates connections through the factory, ends them through the
/// transport, and only lets live, unexpired connections out of the pool
pub struct PoolPolicy<T: Transport> {
    factory: ConnectionFactory<T>,
}

impl<T: Transport> PoolPolicy<T> {
    pub fn new(factory: ConnectionFactory<T>) -> Self {
        Self { factory }
    }

    pub fn factory(&self) -> &ConnectionFactory<T> {
        &self.factory
    }
}

impl<T: Transport> Manage for PoolPolicy<T> {
    type Resource = Connection<T::Handle>;
    type Error = ConnectionError;

    fn create(&self) -> impl Future<Output = Result<Self::Resource, Self::Error>> + Send {
        self.factory.create()
    }

    fn destroy(&self, connection: Connection<T::Handle>) {
        debug!(connection = connection.id(), "destroying connection");
        connection.record().retire();
        self.factory.transport().end(connection.handle());
    }

    fn validate(&self, connection: &Connection<T::Handle>) -> bool {
        let valid = connection.record().is_valid_at(Instant::now());
        trace!(connection = connection.id(), valid, "validated connection");
        valid
    }
}

/// Build the connection pool for one endpoint
pub fn create_pool<T: Transport>(
    transport: Arc<T>,
    config: &PoolConfig,
    options: &TransportOptions,
) -> ConnectionPool<T> {
    let factory = ConnectionFactory::new(
        transport,
        config.endpoint.clone(),
        config.ttl,
        options.timeout,
    );
    Pool::new(PoolPolicy::new(factory), config.settings())
}
