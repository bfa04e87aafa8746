//! Connection factory

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::Endpoint;
use crate::error::ConnectionError;
use crate::lease::{Connection, LeaseRecord, expiry_from};
use crate::transport::{ConnectOptions, ConnectionEvents, Transport};

pub struct ConnectionFactory<T: Transport> {
    transport: Arc<T>,
    endpoint: Endpoint,
    ttl: Option<Duration>,
    timeout: Option<Duration>,
    next_id: AtomicU64,
}

impl<T: Transport> ConnectionFactory<T> {
    pub fn new(
        transport: Arc<T>,
        endpoint: Endpoint,
        ttl: Option<Duration>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            endpoint,
            ttl,
            timeout,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Open one connection and wait for the first outcome the transport
    /// reports. Later events keep updating the connection's lease record.
    pub async fn create(&self) -> Result<Connection<T::Handle>, ConnectionError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(LeaseRecord::new(id, self.timeout.is_some()));
        let ready = record.on_ready();

        debug!(
            connection = id,
            host = %self.endpoint.host,
            port = self.endpoint.port,
            ssl = self.endpoint.ssl,
            "opening connection"
        );
        let handle = self.transport.open(
            ConnectOptions {
                endpoint: &self.endpoint,
                secure: self.endpoint.ssl,
                keep_alive: true,
                timeout: self.timeout,
            },
            ConnectionEvents::new(Arc::clone(&record)),
        );
        let connection = Connection::new(handle, record);

        let outcome = ready.await.unwrap_or(Err(ConnectionError::Closed));
        match outcome {
            Ok(()) => {
                if let Some(ttl) = self.ttl {
                    connection
                        .record()
                        .set_expires_at(expiry_from(Instant::now(), ttl));
                }
                Ok(connection)
            }
            Err(fault) => {
                debug!(connection = id, %fault, "connection failed to open");
                connection.record().retire();
                self.transport.end(connection.handle());
                Err(fault)
            }
        }
    }
}
