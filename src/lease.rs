//! Per-connection lease bookkeeping
//!
//! A [`LeaseRecord`] lives next to every transport handle. The transport
//! reports lifecycle events into it, the pool consults it before handing the
//! connection out, and an in-flight call parks a failure listener in it.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::ConnectionError;
use crate::transport::ConnectionEvent;

/// Pick an expiry between `ttl / 2` and `ttl * 3 / 2` from `now`, so that
/// connections opened together do not all expire together
pub fn expiry_from(now: Instant, ttl: Duration) -> Instant {
    let low = ttl / 2;
    let high = ttl + ttl / 2;
    now + rand::thread_rng().gen_range(low..=high)
}

#[derive(Default)]
struct RecordState {
    ended: bool,
    fault: Option<ConnectionError>,
    expires_at: Option<Instant>,
    listener: Option<oneshot::Sender<ConnectionError>>,
    ready: Option<oneshot::Sender<Result<(), ConnectionError>>>,
}

pub struct LeaseRecord {
    id: u64,
    /// Only treat timeout notifications as fatal when a response timeout is configured
    watch_timeouts: bool,
    state: Mutex<RecordState>,
}

impl LeaseRecord {
    pub fn new(id: u64, watch_timeouts: bool) -> Self {
        Self {
            id,
            watch_timeouts,
            state: Mutex::new(RecordState::default()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().ended
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.state.lock().expires_at
    }

    /// First failure reported for this connection
    pub fn fault(&self) -> Option<ConnectionError> {
        self.state.lock().fault.clone()
    }

    pub fn is_valid_at(&self, now: Instant) -> bool {
        let state = self.state.lock();
        if state.ended {
            return false;
        }
        state.expires_at.is_none_or(|expires_at| now < expires_at)
    }

    pub(crate) fn set_expires_at(&self, expires_at: Instant) {
        self.state.lock().expires_at = Some(expires_at);
    }

    /// Resolves once with the outcome of connection establishment
    pub(crate) fn on_ready(&self) -> oneshot::Receiver<Result<(), ConnectionError>> {
        let (send, recv) = oneshot::channel();
        self.state.lock().ready = Some(send);
        recv
    }

    pub(crate) fn observe(&self, event: ConnectionEvent) {
        let fault = match event {
            ConnectionEvent::Connect => {
                debug!(connection = self.id, "connected");
                if let Some(ready) = self.state.lock().ready.take() {
                    let _ = ready.send(Ok(()));
                }
                return;
            }
            ConnectionEvent::Error(err) => ConnectionError::Transport(err),
            ConnectionEvent::Close => ConnectionError::Closed,
            ConnectionEvent::Timeout if self.watch_timeouts => ConnectionError::Timeout,
            ConnectionEvent::Timeout => {
                trace!(connection = self.id, "ignoring timeout, no response timeout configured");
                return;
            }
        };
        self.fail(fault);
    }

    /// Mark the connection dead. Whoever is waiting on it (the factory or an
    /// in-flight call) is told. Returns true if an in-flight call was interrupted.
    pub fn fail(&self, fault: ConnectionError) -> bool {
        debug!(connection = self.id, %fault, "connection ended");
        let (ready, listener) = {
            let mut state = self.state.lock();
            state.ended = true;
            if state.fault.is_none() {
                state.fault = Some(fault.clone());
            }
            (state.ready.take(), state.listener.take())
        };
        if let Some(ready) = ready {
            let _ = ready.send(Err(fault.clone()));
        }
        listener.is_some_and(|listener| listener.send(fault).is_ok())
    }

    /// The transport stopped reporting before the connection became ready
    pub(crate) fn abandon_ready(&self) {
        let Some(ready) = self.state.lock().ready.take() else {
            return;
        };
        self.fail(ConnectionError::Closed);
        let _ = ready.send(Err(ConnectionError::Closed));
    }

    /// Mark the connection dead without a fault, e.g. when its call was
    /// abandoned mid-flight and the stream state is unknown
    pub fn retire(&self) {
        let mut state = self.state.lock();
        state.ended = true;
        state.listener = None;
    }

    /// Park a failure listener for the duration of one call. Fails right away
    /// if the connection is already dead.
    pub fn attach(&self) -> Result<FaultListener, ConnectionError> {
        let mut state = self.state.lock();
        if state.ended {
            return Err(state.fault.clone().unwrap_or(ConnectionError::Closed));
        }
        let (send, recv) = oneshot::channel();
        state.listener = Some(send);
        Ok(FaultListener { recv })
    }

    pub fn detach(&self) {
        self.state.lock().listener = None;
    }
}

/// Receives the first failure reported while a call is in flight
pub struct FaultListener {
    recv: oneshot::Receiver<ConnectionError>,
}

impl FaultListener {
    /// Wait for a failure. Never resolves if the listener is detached first.
    pub async fn recv(&mut self) -> ConnectionError {
        match (&mut self.recv).await {
            Ok(fault) => fault,
            Err(_) => future::pending().await,
        }
    }

    /// A failure that has already been reported, if any
    pub fn try_recv(&mut self) -> Option<ConnectionError> {
        self.recv.try_recv().ok()
    }
}

/// A transport handle together with its lease record
pub struct Connection<H> {
    handle: H,
    record: Arc<LeaseRecord>,
}

impl<H> Connection<H> {
    pub(crate) fn new(handle: H, record: Arc<LeaseRecord>) -> Self {
        Self { handle, record }
    }

    pub fn id(&self) -> u64 {
        self.record.id
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }
}
