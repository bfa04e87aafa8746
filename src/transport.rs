//! Transport abstraction

use std::io;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Endpoint;
use crate::lease::LeaseRecord;

/// Lifecycle notification raised by a transport connection
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connect,
    Error(Arc<io::Error>),
    Close,
    Timeout,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions<'a> {
    pub endpoint: &'a Endpoint,
    /// Wrap the connection in TLS
    pub secure: bool,
    pub keep_alive: bool,
    /// Response timeout. Transports should raise [`ConnectionEvent::Timeout`]
    /// when an exchange (or the connect itself) takes longer.
    pub timeout: Option<Duration>,
}

/// Where a transport connection reports its lifecycle events. Events are
/// applied synchronously, before `emit` returns.
///
/// Dropping every clone before the connection reported an outcome counts as
/// the connection being closed.
#[derive(Clone)]
pub struct ConnectionEvents {
    sink: Arc<EventSink>,
}

struct EventSink {
    record: Arc<LeaseRecord>,
}

impl Drop for EventSink {
    fn drop(&mut self) {
        self.record.abandon_ready();
    }
}

impl ConnectionEvents {
    pub(crate) fn new(record: Arc<LeaseRecord>) -> Self {
        Self {
            sink: Arc::new(EventSink { record }),
        }
    }

    pub fn emit(&self, event: ConnectionEvent) {
        self.sink.record.observe(event);
    }

    pub fn connection_id(&self) -> u64 {
        self.sink.record.id()
    }
}

/// Opens connections to an endpoint
pub trait Transport: Send + Sync + 'static {
    type Handle: Send + Sync + 'static;

    /// Begin connecting and return immediately. The outcome is reported
    /// through `events`: [`ConnectionEvent::Connect`] once usable, or an
    /// error, close or timeout. Later failures are reported the same way for
    /// as long as the handle lives.
    fn open(&self, options: ConnectOptions<'_>, events: ConnectionEvents) -> Self::Handle;

    /// Close the connection. Best effort.
    fn end(&self, handle: &Self::Handle);
}
