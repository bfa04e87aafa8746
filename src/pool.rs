//! Bounded resource pool
//!
//! Resources are created on demand up to `max_size`, validated before every
//! handout, and reaped when idle for longer than `idle_timeout` (but never
//! below `min_size`). Callers that find the pool exhausted queue up and are
//! served in arrival order as resources come back or slots free up.

use std::collections::VecDeque;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{Notify, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

macro_rules! pool_event {
    ($shared:expr, $($arg:tt)+) => {
        if $shared.settings.log {
            debug!(pool = %$shared.settings.name, $($arg)+);
        }
    };
}

/// Shortest period the reaper runs at
const MIN_REAP_INTERVAL: Duration = Duration::from_millis(1);

/// Lifecycle hooks for the resources held by a [`Pool`]
pub trait Manage: Send + Sync + 'static {
    type Resource: Send + 'static;
    type Error: std::error::Error + Send + Sync + 'static;

    fn create(&self) -> impl Future<Output = Result<Self::Resource, Self::Error>> + Send;

    /// Tear down a resource. Best effort.
    fn destroy(&self, resource: Self::Resource);

    /// Whether a resource may be handed out. Called with the pool locked, so
    /// this must be cheap and must not touch the pool.
    fn validate(&self, resource: &Self::Resource) -> bool;
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// Name used in log events
    pub name: String,
    pub max_size: usize,
    pub min_size: usize,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    /// Emit bookkeeping events at debug level
    pub log: bool,
}

#[derive(Debug, Error)]
pub enum PoolError<E> {
    #[error("pool is closed")]
    Closed,
    #[error(transparent)]
    Create(E),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Open resources, leased or idle, including ones being created
    pub size: usize,
    pub idle: usize,
    pub waiting: usize,
    pub max_size: usize,
    pub min_size: usize,
}

enum Grant<R> {
    Ready(R),
    /// A slot was reserved; the receiver must create the resource itself
    Create,
}

struct Idle<R> {
    resource: R,
    since: Instant,
}

struct Inner<R> {
    idle: VecDeque<Idle<R>>,
    size: usize,
    waiters: VecDeque<oneshot::Sender<Grant<R>>>,
    closed: bool,
}

struct Shared<M: Manage> {
    manager: M,
    settings: PoolSettings,
    inner: Mutex<Inner<M::Resource>>,
    started: AtomicBool,
    emptied: Notify,
}

enum Dispense<M: Manage> {
    Now(Grant<M::Resource>),
    Queued(Waiter<M>),
}

pub struct Pool<M: Manage> {
    shared: Arc<Shared<M>>,
}

impl<M: Manage> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: Manage> Pool<M> {
    /// Create a pool. Background upkeep (reaping, warming up to `min_size`)
    /// starts immediately when called inside a tokio runtime, otherwise on the
    /// first [`acquire`](Self::acquire).
    pub fn new(manager: M, mut settings: PoolSettings) -> Self {
        if settings.max_size == 0 {
            warn!(pool = %settings.name, "max_size of 0 raised to 1");
            settings.max_size = 1;
        }
        if settings.min_size > settings.max_size {
            warn!(
                pool = %settings.name,
                min_size = settings.min_size,
                max_size = settings.max_size,
                "min_size lowered to max_size"
            );
            settings.min_size = settings.max_size;
        }
        if settings.reap_interval < MIN_REAP_INTERVAL {
            warn!(
                pool = %settings.name,
                reap_interval = ?settings.reap_interval,
                "reap_interval raised to {MIN_REAP_INTERVAL:?}"
            );
            settings.reap_interval = MIN_REAP_INTERVAL;
        }

        let shared = Arc::new(Shared {
            manager,
            settings,
            inner: Mutex::new(Inner {
                idle: VecDeque::new(),
                size: 0,
                waiters: VecDeque::new(),
                closed: false,
            }),
            started: AtomicBool::new(false),
            emptied: Notify::new(),
        });
        if Handle::try_current().is_ok() {
            shared.start();
        }
        Pool { shared }
    }

    pub async fn acquire(&self) -> Result<Lease<M>, PoolError<M::Error>> {
        self.shared.start();
        let grant = match self.shared.dispense()? {
            Dispense::Now(grant) => grant,
            Dispense::Queued(waiter) => waiter.wait().await?,
        };

        match grant {
            Grant::Ready(resource) => Ok(Lease::new(Arc::clone(&self.shared), resource)),
            Grant::Create => {
                let reservation = Reservation::new(Arc::clone(&self.shared));
                let resource = self
                    .shared
                    .manager
                    .create()
                    .await
                    .map_err(PoolError::Create)?;
                reservation.fulfil();
                pool_event!(self.shared, "created resource");
                Ok(Lease::new(Arc::clone(&self.shared), resource))
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let inner = self.shared.inner.lock();
        PoolStatus {
            size: inner.size,
            idle: inner.idle.len(),
            waiting: inner.waiters.iter().filter(|waiter| !waiter.is_closed()).count(),
            max_size: self.shared.settings.max_size,
            min_size: self.shared.settings.min_size,
        }
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// Stop handing out resources. Idle resources are destroyed now, leased
    /// ones when they are returned. Queued callers fail with [`PoolError::Closed`].
    pub fn close(&self) {
        let doomed = {
            let mut inner = self.shared.inner.lock();
            inner.closed = true;
            inner.waiters.clear();
            let doomed: Vec<_> = inner.idle.drain(..).map(|idle| idle.resource).collect();
            inner.size -= doomed.len();
            doomed
        };
        pool_event!(self.shared, destroyed = doomed.len(), "pool closed");
        self.shared.settle(doomed);
    }

    /// Close the pool and wait until every resource has been destroyed
    pub async fn drain(&self) {
        self.close();
        loop {
            let notified = self.shared.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.inner.lock().size == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl<M: Manage> Shared<M> {
    fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(reap_idle(
            Arc::downgrade(self),
            self.settings.reap_interval,
        ));
        self.ensure_minimum();
    }

    /// Hand out an idle resource, reserve a slot, or queue the caller
    fn dispense(self: &Arc<Self>) -> Result<Dispense<M>, PoolError<M::Error>> {
        let mut doomed = Vec::new();
        let dispense = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(PoolError::Closed);
            }

            let mut found = None;
            while let Some(idle) = inner.idle.pop_front() {
                if self.manager.validate(&idle.resource) {
                    found = Some(idle.resource);
                    break;
                }
                inner.size -= 1;
                doomed.push(idle.resource);
            }

            match found {
                Some(resource) => Dispense::Now(Grant::Ready(resource)),
                None if inner.size < self.settings.max_size => {
                    inner.size += 1;
                    Dispense::Now(Grant::Create)
                }
                None => {
                    let (send, recv) = oneshot::channel();
                    inner.waiters.push_back(send);
                    pool_event!(self, waiting = inner.waiters.len(), "pool exhausted, queueing");
                    Dispense::Queued(Waiter {
                        shared: Arc::clone(self),
                        recv,
                        settled: false,
                    })
                }
            }
        };
        if !doomed.is_empty() {
            pool_event!(self, destroyed = doomed.len(), "discarding invalid idle resources");
        }
        self.settle(doomed);
        Ok(dispense)
    }

    fn release(self: &Arc<Self>, resource: M::Resource) {
        let mut doomed = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                inner.size -= 1;
                doomed.push(resource);
            } else {
                self.hand_off(&mut inner, resource, &mut doomed);
            }
        }
        self.settle(doomed);
    }

    fn discard(self: &Arc<Self>, resource: M::Resource) {
        {
            let mut inner = self.inner.lock();
            inner.size -= 1;
            self.grant_slots(&mut inner);
        }
        pool_event!(self, "discarding resource");
        self.settle(vec![resource]);
    }

    /// Give up a reserved slot whose resource never materialized
    fn forfeit(&self) {
        let empty = {
            let mut inner = self.inner.lock();
            inner.size -= 1;
            self.grant_slots(&mut inner);
            inner.size == 0
        };
        if empty {
            self.emptied.notify_waiters();
        }
    }

    /// Serve the oldest live waiter, or park the resource as idle
    fn hand_off(
        &self,
        inner: &mut Inner<M::Resource>,
        mut resource: M::Resource,
        doomed: &mut Vec<M::Resource>,
    ) {
        if !self.manager.validate(&resource) {
            inner.size -= 1;
            doomed.push(resource);
            self.grant_slots(inner);
            return;
        }
        while let Some(waiter) = inner.waiters.pop_front() {
            match waiter.send(Grant::Ready(resource)) {
                Ok(()) => return,
                Err(Grant::Ready(returned)) => resource = returned,
                Err(Grant::Create) => unreachable!("sent a ready resource"),
            }
        }
        inner.idle.push_front(Idle {
            resource,
            since: Instant::now(),
        });
    }

    /// Let queued callers create resources while there is room
    fn grant_slots(&self, inner: &mut Inner<M::Resource>) {
        while inner.size < self.settings.max_size {
            let Some(waiter) = inner.waiters.pop_front() else {
                return;
            };
            inner.size += 1;
            if waiter.send(Grant::Create).is_err() {
                inner.size -= 1;
            }
        }
    }

    /// Destroy resources removed from the pool, outside the lock
    fn settle(self: &Arc<Self>, doomed: Vec<M::Resource>) {
        if doomed.is_empty() {
            return;
        }
        for resource in doomed {
            self.manager.destroy(resource);
        }
        let (closed, empty) = {
            let inner = self.inner.lock();
            (inner.closed, inner.size == 0)
        };
        if empty {
            self.emptied.notify_waiters();
        }
        if !closed {
            self.ensure_minimum();
        }
    }

    fn ensure_minimum(self: &Arc<Self>) {
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let deficit = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            let deficit = self.settings.min_size.saturating_sub(inner.size);
            inner.size += deficit;
            deficit
        };
        if deficit > 0 {
            pool_event!(self, deficit, "warming up to min_size");
        }
        for _ in 0..deficit {
            runtime.spawn(fill_slot(Arc::clone(self)));
        }
    }

    /// Destroy idle resources that are stale or invalid.
    /// Returns false once the pool is closed.
    fn reap(self: &Arc<Self>) -> bool {
        let now = Instant::now();
        let mut doomed = Vec::new();
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            let mut kept = VecDeque::with_capacity(inner.idle.len());
            while let Some(idle) = inner.idle.pop_front() {
                let stale = now.duration_since(idle.since) >= self.settings.idle_timeout
                    && inner.size > self.settings.min_size;
                if stale || !self.manager.validate(&idle.resource) {
                    inner.size -= 1;
                    doomed.push(idle.resource);
                } else {
                    kept.push_back(idle);
                }
            }
            inner.idle = kept;
            self.grant_slots(&mut inner);
        }
        if !doomed.is_empty() {
            pool_event!(self, reaped = doomed.len(), "reaped idle resources");
        }
        self.settle(doomed);
        self.ensure_minimum();
        true
    }
}

async fn reap_idle<M: Manage>(shared: Weak<Shared<M>>, period: Duration) {
    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if !shared.reap() {
            break;
        }
    }
}

async fn fill_slot<M: Manage>(shared: Arc<Shared<M>>) {
    match shared.manager.create().await {
        Ok(resource) => {
            pool_event!(shared, "created resource for min_size");
            shared.release(resource);
        }
        Err(err) => {
            warn!(pool = %shared.settings.name, %err, "failed to create resource for min_size");
            shared.forfeit();
        }
    }
}

/// Queued acquisition. Dropping it before the grant is consumed gives the
/// grant back to the pool.
struct Waiter<M: Manage> {
    shared: Arc<Shared<M>>,
    recv: oneshot::Receiver<Grant<M::Resource>>,
    settled: bool,
}

impl<M: Manage> Waiter<M> {
    async fn wait(mut self) -> Result<Grant<M::Resource>, PoolError<M::Error>> {
        let grant = (&mut self.recv).await;
        self.settled = true;
        grant.map_err(|_| PoolError::Closed)
    }
}

impl<M: Manage> Drop for Waiter<M> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.recv.close();
        match self.recv.try_recv() {
            Ok(Grant::Ready(resource)) => self.shared.release(resource),
            Ok(Grant::Create) => self.shared.forfeit(),
            Err(_) => {}
        }
    }
}

/// Slot held while a resource is being created
struct Reservation<M: Manage> {
    shared: Option<Arc<Shared<M>>>,
}

impl<M: Manage> Reservation<M> {
    fn new(shared: Arc<Shared<M>>) -> Self {
        Self {
            shared: Some(shared),
        }
    }

    fn fulfil(mut self) {
        self.shared = None;
    }
}

impl<M: Manage> Drop for Reservation<M> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.forfeit();
        }
    }
}

/// Exclusive loan of a pooled resource. Dropping the lease releases it.
pub struct Lease<M: Manage> {
    shared: Arc<Shared<M>>,
    resource: Option<M::Resource>,
}

impl<M: Manage> Lease<M> {
    fn new(shared: Arc<Shared<M>>, resource: M::Resource) -> Self {
        Self {
            shared,
            resource: Some(resource),
        }
    }

    /// Return the resource to the pool
    pub fn release(mut self) {
        if let Some(resource) = self.resource.take() {
            self.shared.release(resource);
        }
    }

    /// Destroy the resource instead of returning it
    pub fn discard(mut self) {
        if let Some(resource) = self.resource.take() {
            self.shared.discard(resource);
        }
    }
}

impl<M: Manage> Deref for Lease<M> {
    type Target = M::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource
            .as_ref()
            .expect("resource is present until the lease is returned")
    }
}

impl<M: Manage> Drop for Lease<M> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.shared.release(resource);
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::{Manage, Pool, PoolError, PoolSettings};

    #[derive(Default)]
    struct Counter {
        created: AtomicUsize,
        destroyed: Mutex<Vec<usize>>,
        invalid: Mutex<HashSet<usize>>,
        fail_next: AtomicBool,
    }

    impl Manage for Arc<Counter> {
        type Resource = usize;
        type Error = io::Error;

        async fn create(&self) -> Result<usize, io::Error> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        fn destroy(&self, resource: usize) {
            self.destroyed.lock().push(resource);
        }

        fn validate(&self, resource: &usize) -> bool {
            !self.invalid.lock().contains(resource)
        }
    }

    fn settings(max_size: usize, min_size: usize) -> PoolSettings {
        PoolSettings {
            name: "test".into(),
            max_size,
            min_size,
            idle_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(1),
            log: true,
        }
    }

    fn pool(max_size: usize, min_size: usize) -> (Pool<Arc<Counter>>, Arc<Counter>) {
        let counter = Arc::new(Counter::default());
        (Pool::new(Arc::clone(&counter), settings(max_size, min_size)), counter)
    }

    #[tokio::test]
    async fn reuses_released_resources() {
        let (pool, counter) = pool(2, 0);
        let lease = pool.acquire().await.unwrap();
        assert_eq!(*lease, 0);
        lease.release();

        let lease = pool.acquire().await.unwrap();
        assert_eq!(*lease, 0);
        assert_eq!(counter.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().size, 1);
    }

    #[tokio::test]
    async fn waiters_are_served_in_order() {
        let (pool, counter) = pool(1, 0);
        let held = pool.acquire().await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for name in ["first", "second"] {
            let pool = pool.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let lease = pool.acquire().await.unwrap();
                order.lock().push((name, *lease));
            }));
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.status().waiting, 2);

        drop(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock(), vec![("first", 0), ("second", 0)]);
        assert_eq!(counter.created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().size, 1);
    }

    #[tokio::test]
    async fn invalid_resources_are_replaced() {
        let (pool, counter) = pool(1, 0);
        pool.acquire().await.unwrap().release();
        counter.invalid.lock().insert(0);

        let lease = pool.acquire().await.unwrap();
        assert_eq!(*lease, 1);
        assert_eq!(*counter.destroyed.lock(), vec![0]);
        assert_eq!(pool.status().size, 1);
    }

    #[tokio::test]
    async fn invalid_release_lets_a_waiter_create() {
        let (pool, counter) = pool(1, 0);
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { *pool.acquire().await.unwrap() })
        };
        tokio::task::yield_now().await;

        counter.invalid.lock().insert(0);
        drop(held);
        assert_eq!(waiter.await.unwrap(), 1);
        assert_eq!(*counter.destroyed.lock(), vec![0]);
    }

    #[tokio::test]
    async fn invalid_release_is_not_parked() {
        let (pool, counter) = pool(2, 0);
        let lease = pool.acquire().await.unwrap();
        counter.invalid.lock().insert(0);
        lease.release();

        assert_eq!(*counter.destroyed.lock(), vec![0]);
        assert_eq!(pool.status().idle, 0);
        assert_eq!(pool.status().size, 0);
    }

    #[tokio::test]
    async fn failed_creation_frees_the_slot() {
        let (pool, counter) = pool(1, 0);
        counter.fail_next.store(true, Ordering::SeqCst);
        let err = pool.acquire().await.err().unwrap();
        assert!(matches!(
            err,
            PoolError::Create(ref e) if e.kind() == io::ErrorKind::ConnectionRefused
        ));
        assert_eq!(pool.status().size, 0);

        assert_eq!(*pool.acquire().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn discard_destroys_and_frees_the_slot() {
        let (pool, counter) = pool(1, 0);
        pool.acquire().await.unwrap().discard();
        assert_eq!(*counter.destroyed.lock(), vec![0]);
        assert_eq!(pool.status().size, 0);
        assert_eq!(*pool.acquire().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_does_not_leak() {
        let (pool, _counter) = pool(1, 0);
        let held = pool.acquire().await.unwrap();

        let attempt = tokio::time::timeout(Duration::from_millis(10), pool.acquire()).await;
        assert!(attempt.is_err());

        drop(held);
        let status = pool.status();
        assert_eq!(status.size, 1);
        assert_eq!(status.idle, 1);
        assert_eq!(*pool.acquire().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_resources_are_reaped() {
        let (pool, counter) = pool(2, 0);
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        drop(first);
        drop(second);
        assert_eq!(pool.status().idle, 2);

        tokio::time::sleep(Duration::from_secs(32)).await;
        let status = pool.status();
        assert_eq!(status.size, 0);
        assert_eq!(status.idle, 0);
        assert_eq!(counter.destroyed.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn min_size_is_kept_warm() {
        let (pool, counter) = pool(3, 2);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.status().idle, 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let status = pool.status();
        assert_eq!(status.size, 2);
        assert_eq!(status.idle, 2);
        assert!(counter.destroyed.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_reap_interval_still_reaps() {
        let counter = Arc::new(Counter::default());
        let settings = PoolSettings {
            idle_timeout: Duration::from_secs(1),
            reap_interval: Duration::ZERO,
            ..settings(1, 0)
        };
        let pool = Pool::new(Arc::clone(&counter), settings);
        drop(pool.acquire().await.unwrap());
        assert_eq!(pool.status().idle, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(pool.status().size, 0);
        assert_eq!(*counter.destroyed.lock(), vec![0]);
    }

    #[tokio::test]
    async fn sizes_are_clamped() {
        let (pool, _counter) = pool(0, 4);
        let status = pool.status();
        assert_eq!(status.max_size, 1);
        assert_eq!(status.min_size, 1);
    }

    #[tokio::test]
    async fn close_rejects_and_destroys() {
        let (pool, counter) = pool(2, 0);
        let held = pool.acquire().await.unwrap();
        pool.acquire().await.unwrap().release();

        pool.close();
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
        assert_eq!(*counter.destroyed.lock(), vec![1]);

        drop(held);
        assert_eq!(*counter.destroyed.lock(), vec![1, 0]);
        assert_eq!(pool.status().size, 0);
    }

    #[tokio::test]
    async fn close_fails_waiters() {
        let (pool, _counter) = pool(1, 0);
        let _held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|lease| *lease) })
        };
        tokio::task::yield_now().await;

        pool.close();
        assert!(matches!(waiter.await.unwrap(), Err(PoolError::Closed)));
    }

    #[tokio::test]
    async fn drain_waits_for_leases() {
        let (pool, counter) = pool(1, 0);
        let held = pool.acquire().await.unwrap();
        let drained = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.drain().await })
        };
        tokio::task::yield_now().await;
        assert!(!drained.is_finished());

        drop(held);
        drained.await.unwrap();
        assert_eq!(*counter.destroyed.lock(), vec![0]);
    }
}
