//! Error types

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::pool::PoolError;

/// Reason reported when a connection stops responding within the configured timeout
pub const TIMEOUT_MESSAGE: &str = "connection timeout";
/// Reason reported when the remote end closes a connection
pub const CLOSE_MESSAGE: &str = "connection closed";

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Invalid client configuration, reported before any connection is attempted
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("you must specify {0}")]
    Missing(&'static str),
}

/// Connection-level failure. Any of these permanently invalidates the connection.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transport(Arc<io::Error>),
    #[error("{}", CLOSE_MESSAGE)]
    Closed,
    #[error("{}", TIMEOUT_MESSAGE)]
    Timeout,
}

/// Failure of a single remote call
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error("unknown method {0:?}")]
    UnknownMethod(String),
    /// No connection could be leased for the call
    #[error(transparent)]
    Acquire(PoolError<ConnectionError>),
    /// The leased connection failed before the reply arrived
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// The call could not be issued at all
    #[error("failed to dispatch call: {0}")]
    Dispatch(#[source] BoxError),
    /// The remote side answered with an error
    #[error(transparent)]
    Application(E),
}

impl<E> CallError<E> {
    /// Connection failure behind this error, whether it happened while
    /// connecting or while the call was in flight
    pub fn connection_error(&self) -> Option<&ConnectionError> {
        match self {
            CallError::Acquire(PoolError::Create(err)) | CallError::Connection(err) => Some(err),
            _ => None,
        }
    }
}
