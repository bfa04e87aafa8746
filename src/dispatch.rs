//! Per-method call dispatch
//!
//! Each call leases a connection, parks a failure listener on it, issues the
//! request through the protocol and waits for whichever comes first: the
//! reply or a failure of the connection. The connection goes back to the
//! pool once the call has settled, unless it died along the way.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CallError;
use crate::lease::Connection;
use crate::policy::{ConnectionLease, ConnectionPool};
use crate::protocol::Protocol;
use crate::transport::Transport;

type CallResult<T, P> = Result<
    Vec<<P as Protocol<<T as Transport>::Handle>>::Value>,
    CallError<<P as Protocol<<T as Transport>::Handle>>::Error>,
>;

/// A remote method bound to a connection pool
pub struct Method<T: Transport, P: Protocol<T::Handle>> {
    name: Arc<str>,
    pool: ConnectionPool<T>,
    protocol: Arc<P>,
}

impl<T: Transport, P: Protocol<T::Handle>> Clone for Method<T, P> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            pool: self.pool.clone(),
            protocol: Arc::clone(&self.protocol),
        }
    }
}

impl<T: Transport, P: Protocol<T::Handle>> Method<T, P> {
    pub fn new(name: impl Into<Arc<str>>, pool: ConnectionPool<T>, protocol: Arc<P>) -> Self {
        Self {
            name: name.into(),
            pool,
            protocol,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the call and resolve with the first result value
    pub async fn call(&self, args: Vec<P::Value>) -> Result<Option<P::Value>, CallError<P::Error>> {
        let values = self.invoke(args).await?;
        Ok(values.into_iter().next())
    }

    /// Run the call in the background and hand the outcome, with every
    /// result value, to `callback`
    pub fn call_with<F>(&self, args: Vec<P::Value>, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(CallResult<T, P>) + Send + 'static,
    {
        let method = self.clone();
        tokio::spawn(async move { callback(method.invoke(args).await) })
    }

    /// Run the call and resolve with every result value. The outcome is
    /// settled exactly once, whichever of reply and connection failure wins.
    ///
    /// Dropping the future while the request is in flight retires the
    /// connection, since its stream may still carry the unread reply.
    #[tracing::instrument(level = "debug", skip_all, fields(method = %self.name))]
    pub async fn invoke(&self, args: Vec<P::Value>) -> CallResult<T, P> {
        let mut call = PendingCall::new();
        let outcome = match self.pool.acquire().await {
            Ok(lease) => {
                let connection = call.attach(lease);
                self.exchange(connection, args).await
            }
            Err(err) => {
                debug!(%err, "no connection for call");
                Err(CallError::Acquire(err))
            }
        };
        call.complete(outcome)
    }

    async fn exchange(
        &self,
        connection: &Connection<T::Handle>,
        args: Vec<P::Value>,
    ) -> CallResult<T, P> {
        let mut listener = connection.record().attach()?;
        let reply = self
            .protocol
            .invoke(connection.handle(), &self.name, args)
            .map_err(|err| {
                warn!(connection = connection.id(), %err, "failed to dispatch call");
                CallError::Dispatch(err)
            })?;

        tokio::select! {
            biased;
            fault = listener.recv() => Err(fault.into()),
            reply = reply => match listener.try_recv() {
                // failure was reported while the reply was being produced
                Some(fault) => Err(fault.into()),
                None => reply.map_err(CallError::Application),
            },
        }
    }
}

/// A call from acquisition until its outcome is delivered. Without a lease
/// it is still waiting for a connection. `complete` consumes the call, so
/// the outcome is delivered once.
struct PendingCall<T: Transport> {
    lease: Option<ConnectionLease<T>>,
}

impl<T: Transport> PendingCall<T> {
    fn new() -> Self {
        Self { lease: None }
    }

    fn attach(&mut self, lease: ConnectionLease<T>) -> &Connection<T::Handle> {
        self.lease.insert(lease)
    }

    /// Detach from the connection and hand it back: to the idle set if it is
    /// still healthy, otherwise to be destroyed
    fn complete<V, E>(mut self, outcome: Result<V, CallError<E>>) -> Result<V, CallError<E>> {
        if let Some(lease) = self.lease.take() {
            lease.record().detach();
            if lease.record().is_ended() {
                debug!(connection = lease.id(), "connection ended during call");
                lease.discard();
            } else {
                lease.release();
            }
        }
        outcome
    }
}

impl<T: Transport> Drop for PendingCall<T> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            debug!(connection = lease.id(), "call abandoned in flight, retiring connection");
            lease.record().retire();
            lease.discard();
        }
    }
}
