//! Pool and transport configuration

use std::time::Duration;

use crate::error::ConfigError;
use crate::pool::PoolSettings;

pub const DEFAULT_MAX_CONNECTIONS: usize = 1;
pub const DEFAULT_MIN_CONNECTIONS: usize = 0;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_millis(1_000);

/// Remote endpoint every pooled connection is made to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Use TLS instead of plain TCP
    pub ssl: bool,
}

/// User-facing pool options. Everything except `host` and `port` has a default.
#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ssl: bool,
    pub max_connections: Option<usize>,
    pub min_connections: Option<usize>,
    pub idle_timeout: Option<Duration>,
    pub reap_interval: Option<Duration>,
    /// Connection time-to-live. Each connection gets a randomized lifetime
    /// between half and one and a half times this value.
    pub ttl: Option<Duration>,
    /// Emit pool bookkeeping events
    pub log: bool,
}

impl PoolOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn min_connections(mut self, min: usize) -> Self {
        self.min_connections = Some(min);
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = Some(interval);
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn log(mut self, log: bool) -> Self {
        self.log = log;
        self
    }
}

/// Validated pool configuration, fixed for the lifetime of a client
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub endpoint: Endpoint,
    pub max_connections: usize,
    pub min_connections: usize,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub ttl: Option<Duration>,
    pub log: bool,
}

impl PoolConfig {
    pub fn settings(&self) -> PoolSettings {
        PoolSettings {
            name: format!("{}:{}", self.endpoint.host, self.endpoint.port),
            max_size: self.max_connections,
            min_size: self.min_connections,
            idle_timeout: self.idle_timeout,
            reap_interval: self.reap_interval,
            log: self.log,
        }
    }
}

impl TryFrom<PoolOptions> for PoolConfig {
    type Error = ConfigError;

    fn try_from(options: PoolOptions) -> Result<Self, Self::Error> {
        let host = options
            .host
            .filter(|host| !host.is_empty())
            .ok_or(ConfigError::Missing("host"))?;
        let port = options
            .port
            .filter(|port| *port != 0)
            .ok_or(ConfigError::Missing("port"))?;

        Ok(PoolConfig {
            endpoint: Endpoint {
                host,
                port,
                ssl: options.ssl,
            },
            max_connections: options.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            min_connections: options.min_connections.unwrap_or(DEFAULT_MIN_CONNECTIONS),
            idle_timeout: options.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
            reap_interval: options.reap_interval.unwrap_or(DEFAULT_REAP_INTERVAL),
            ttl: options.ttl,
            log: options.log,
        })
    }
}

/// Options handed through to the transport for every connection
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Response timeout. When set, timeout notifications from the transport
    /// are treated as fatal for the connection.
    pub timeout: Option<Duration>,
}

impl TransportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
