//! Pooled RPC client

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::{PoolConfig, PoolOptions, TransportOptions};
use crate::dispatch::Method;
use crate::error::{CallError, ConfigError};
use crate::policy::{ConnectionPool, create_pool};
use crate::protocol::Protocol;
use crate::transport::Transport;

/// A remote service definition: the names of the methods it exposes
pub trait Service {
    const METHODS: &'static [&'static str];
}

/// Set of remote methods sharing one connection pool
pub struct Client<T: Transport, P: Protocol<T::Handle>> {
    pool: ConnectionPool<T>,
    methods: BTreeMap<String, Method<T, P>>,
}

impl<T: Transport, P: Protocol<T::Handle>> Clone for Client<T, P> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            methods: self.methods.clone(),
        }
    }
}

impl<T: Transport, P: Protocol<T::Handle>> Client<T, P> {
    pub fn builder(transport: T, protocol: P) -> ClientBuilder<T, P> {
        ClientBuilder {
            transport: Arc::new(transport),
            protocol: Arc::new(protocol),
            methods: Vec::new(),
            pool_options: PoolOptions::default(),
            transport_options: TransportOptions::default(),
        }
    }

    pub fn method(&self, name: &str) -> Option<&Method<T, P>> {
        self.methods.get(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    /// Call `name` and resolve with its first result value
    pub async fn call(
        &self,
        name: &str,
        args: Vec<P::Value>,
    ) -> Result<Option<P::Value>, CallError<P::Error>> {
        self.lookup(name)?.call(args).await
    }

    /// Call `name` in the background, handing every result value to `callback`.
    /// An unknown method is reported through the callback as well.
    pub fn call_with<F>(&self, name: &str, args: Vec<P::Value>, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Vec<P::Value>, CallError<P::Error>>) + Send + 'static,
    {
        match self.lookup(name) {
            Ok(method) => method.call_with(args, callback),
            Err(err) => tokio::spawn(async move { callback(Err(err)) }),
        }
    }

    pub fn pool(&self) -> &ConnectionPool<T> {
        &self.pool
    }

    /// Stop handing out connections and close the idle ones
    pub fn close(&self) {
        self.pool.close();
    }

    /// Close, then wait for every leased connection to come back
    pub async fn drain(&self) {
        self.pool.drain().await;
    }

    fn lookup(&self, name: &str) -> Result<&Method<T, P>, CallError<P::Error>> {
        self.methods
            .get(name)
            .ok_or_else(|| CallError::UnknownMethod(name.to_owned()))
    }
}

pub struct ClientBuilder<T: Transport, P: Protocol<T::Handle>> {
    transport: Arc<T>,
    protocol: Arc<P>,
    methods: Vec<String>,
    pool_options: PoolOptions,
    transport_options: TransportOptions,
}

impl<T: Transport, P: Protocol<T::Handle>> ClientBuilder<T, P> {
    pub fn method(mut self, name: impl Into<String>) -> Self {
        self.methods.push(name.into());
        self
    }

    pub fn methods<I>(mut self, names: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.methods.extend(names.into_iter().map(Into::into));
        self
    }

    /// Expose every method of `S`
    pub fn service<S: Service>(self) -> Self {
        self.methods(S::METHODS.iter().copied())
    }

    pub fn pool_options(mut self, options: PoolOptions) -> Self {
        self.pool_options = options;
        self
    }

    pub fn transport_options(mut self, options: TransportOptions) -> Self {
        self.transport_options = options;
        self
    }

    /// Validate the configuration and set up the pool. No connection is
    /// opened here unless `min_connections` asks for warm ones.
    pub fn build(self) -> Result<Client<T, P>, ConfigError> {
        let config = PoolConfig::try_from(self.pool_options)?;
        let pool = create_pool(self.transport, &config, &self.transport_options);

        let methods: BTreeMap<_, _> = self
            .methods
            .into_iter()
            .map(|name| {
                let method = Method::new(name.as_str(), pool.clone(), Arc::clone(&self.protocol));
                (name, method)
            })
            .collect();
        debug!(
            host = %config.endpoint.host,
            port = config.endpoint.port,
            methods = methods.len(),
            "client ready"
        );

        Ok(Client { pool, methods })
    }
}
