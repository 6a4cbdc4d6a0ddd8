//! Connection pool.
//!
//! - Bounded: a semaphore with `max_connections` permits; every checked-out
//!   (or in-flight) connection holds one, so open connections never exceed
//!   the maximum.
//! - Session-safe: before a connection re-enters the idle set the pool rolls
//!   back any open transaction and turns follower reads off; a connection
//!   that cannot be restored is destroyed instead.
//! - Cancellation-safe: each checkout runs in its own task and hands over a
//!   [`PooledConnection`], so a connection that arrives after its caller gave
//!   up goes straight back to the pool.
//! - Closable: after the grace period of [`Pool::close`], sessions still
//!   checked out are terminated from the pool side.
//! - Self-maintaining: a background task tops the pool up to
//!   `min_connections`, pings idle connections and retires expired ones
//!   every `health_check_period`.

mod connection;
mod stats;

pub use connection::{PooledConnection, ReadOnlyTransaction};
pub use stats::PoolStatistics;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::runtime::Handle;
use tokio::sync::{
    oneshot, watch, Mutex, Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError,
};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::PoolConfiguration;
use crate::connection::{Connection, Connector};
use crate::error::{DbError, DbResult};
use crate::hooks::{ConnectionHooks, SessionProbeHooks};
use crate::instrument::QueryInstrumentation;
use crate::postgres::PgConnector;
use crate::session::{DISABLE_FOLLOWER_READS, ROLLBACK};
use connection::{Entry, Slot};
use stats::PoolCounters;

const CONNECT_BACKOFF_START: Duration = Duration::from_millis(50);
const CONNECT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DestroyReason {
    Expired,
    HealthCheck,
    Vetoed,
    Dirty,
    Closed,
}

impl DestroyReason {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "max lifetime reached",
            Self::HealthCheck => "failed health check",
            Self::Vetoed => "rejected by hook",
            Self::Dirty => "session could not be restored",
            Self::Closed => "pool closed",
        }
    }
}

/// Shared connection pool; cheap to clone
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

/// Non-owning pool handle for background samplers
#[derive(Clone)]
pub struct WeakPool {
    inner: Weak<PoolInner>,
}

impl WeakPool {
    pub fn upgrade(&self) -> Option<Pool> {
        self.inner.upgrade().map(|inner| Pool { inner })
    }
}

pub(crate) struct PoolInner {
    config: PoolConfiguration,
    connector: Arc<dyn Connector>,
    hooks: Arc<dyn ConnectionHooks>,
    pub(crate) instrumentation: QueryInstrumentation,
    semaphore: Arc<Semaphore>,
    idle: Mutex<VecDeque<Entry>>,
    counters: PoolCounters,
    closed: AtomicBool,
    force_closed: watch::Sender<bool>,
    released: Notify,
    shutdown: Arc<Notify>,
    checked_out: std::sync::Mutex<HashMap<u64, Slot>>,
    next_id: AtomicU64,
}

/// Assembles a [`Pool`] from a configuration and its collaborators
pub struct PoolBuilder {
    config: PoolConfiguration,
    connector: Option<Arc<dyn Connector>>,
    hooks: Arc<dyn ConnectionHooks>,
    instrumentation: Option<QueryInstrumentation>,
}

impl PoolBuilder {
    /// Connection factory; defaults to [`PgConnector`]
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// Lifecycle hooks; defaults to [`SessionProbeHooks`]
    pub fn hooks(mut self, hooks: impl ConnectionHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Query instrumentation; defaults to spans only, per the configuration
    pub fn instrumentation(mut self, instrumentation: QueryInstrumentation) -> Self {
        self.instrumentation = Some(instrumentation);
        self
    }

    /// Create the pool and start its maintenance task. No connection is
    /// opened here; the first maintenance pass warms the pool up.
    pub fn build(self) -> DbResult<Pool> {
        let handle = Handle::try_current().map_err(|_| {
            DbError::configuration("the pool must be built inside a tokio runtime")
        })?;

        let connector = match self.connector {
            Some(connector) => connector,
            None => Arc::new(PgConnector::new(&self.config)),
        };
        let instrumentation = self
            .instrumentation
            .unwrap_or_else(|| QueryInstrumentation::new(&self.config));
        let max_connections = self.config.max_connections() as usize;

        let inner = Arc::new(PoolInner {
            connector,
            hooks: self.hooks,
            instrumentation,
            semaphore: Arc::new(Semaphore::new(max_connections)),
            idle: Mutex::new(VecDeque::with_capacity(max_connections)),
            counters: PoolCounters::default(),
            closed: AtomicBool::new(false),
            force_closed: watch::channel(false).0,
            released: Notify::new(),
            shutdown: Arc::new(Notify::new()),
            checked_out: std::sync::Mutex::new(HashMap::with_capacity(max_connections)),
            next_id: AtomicU64::new(0),
            config: self.config,
        });
        PoolInner::spawn_maintenance(&inner, &handle);

        info!(
            url = %inner.config.redacted_url(),
            max_connections = inner.config.max_connections(),
            min_connections = inner.config.min_connections(),
            "connection pool created"
        );
        Ok(Pool { inner })
    }
}

impl Pool {
    pub fn builder(config: PoolConfiguration) -> PoolBuilder {
        PoolBuilder {
            config,
            connector: None,
            hooks: Arc::new(SessionProbeHooks::new()),
            instrumentation: None,
        }
    }

    /// Acquire with the configured acquire timeout
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        self.acquire_until(Instant::now() + self.inner.config.acquire_timeout())
            .await
    }

    /// Acquire a connection, waiting no later than `deadline`.
    ///
    /// Fails with `PoolExhausted` when no slot frees up in time,
    /// `ConnectTimeout` when a new connection cannot be opened in time and
    /// `PoolClosed` after [`close`](Self::close). Dropping the returned
    /// future is safe at any point.
    pub async fn acquire_until(&self, deadline: Instant) -> DbResult<PooledConnection> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(DbError::PoolClosed);
        }
        let started = Instant::now();

        let (permit, waited) = match inner.semaphore.clone().try_acquire_owned() {
            Ok(permit) => (permit, false),
            Err(TryAcquireError::Closed) => return Err(DbError::PoolClosed),
            Err(TryAcquireError::NoPermits) => {
                match time::timeout_at(deadline, inner.semaphore.clone().acquire_owned()).await {
                    Ok(Ok(permit)) => (permit, true),
                    Ok(Err(_)) => return Err(DbError::PoolClosed),
                    Err(_) => {
                        debug!(
                            max_connections = inner.config.max_connections(),
                            "acquire deadline passed while the pool was exhausted"
                        );
                        return Err(DbError::PoolExhausted {
                            waited: started.elapsed(),
                            max_connections: inner.config.max_connections(),
                        });
                    }
                }
            }
        };

        let (tx, rx) = oneshot::channel();
        let task_inner = Arc::clone(inner);
        tokio::spawn(async move {
            let result = task_inner.checkout(deadline).await.map(|(entry, created)| {
                PoolCounters::incr(&task_inner.counters.acquired);
                (PooledConnection::new(entry, permit, Arc::clone(&task_inner)), created)
            });
            // whether the send fails or the receiver is dropped unread, the
            // handle's drop releases the connection
            if let Err(Ok(_)) = tx.send(result) {
                debug!("acquire abandoned by caller; returning connection to the pool");
            }
        });

        let (conn, created) = match time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => return Err(DbError::connection("connection checkout task failed")),
            Err(_) => {
                return Err(DbError::ConnectTimeout {
                    elapsed: started.elapsed(),
                })
            }
        };

        if inner.is_closed() {
            conn.release().await;
            return Err(DbError::PoolClosed);
        }

        inner.counters.record_acquire(started.elapsed());
        if waited || created {
            PoolCounters::incr(&inner.counters.empty_acquire_count);
        }
        Ok(conn)
    }

    /// Snapshot of the pool's counters; never blocks
    pub fn stat(&self) -> PoolStatistics {
        self.inner
            .counters
            .snapshot(self.inner.config.max_connections())
    }

    /// Close the pool.
    ///
    /// New acquires fail immediately and idle connections are closed. Then
    /// waits up to `grace` for checked-out connections to come back; after
    /// that, the sessions still held are terminated, and statements on their
    /// handles fail with `PoolClosed`.
    pub async fn close(&self, grace: Duration) {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.semaphore.close();
        // a pass already underway finishes; push_idle turns its entries away
        inner.shutdown.notify_one();

        let idle: Vec<Entry> = inner.idle.lock().await.drain(..).collect();
        for entry in idle {
            PoolCounters::decr(&inner.counters.idle);
            inner.destroy(entry, DestroyReason::Closed).await;
        }

        let deadline = Instant::now() + grace;
        loop {
            let released = inner.released.notified();
            let outstanding = inner.counters.acquired.load(Ordering::SeqCst);
            if outstanding == 0 {
                break;
            }
            if time::timeout_at(deadline, released).await.is_err() {
                warn!(
                    outstanding,
                    grace = ?grace,
                    "connections still checked out after grace period; forcing close"
                );
                inner.force_closed.send_replace(true);
                inner.terminate_checked_out().await;
                break;
            }
        }
        info!("connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn config(&self) -> &PoolConfiguration {
        &self.inner.config
    }

    pub fn instrumentation(&self) -> &QueryInstrumentation {
        &self.inner.instrumentation
    }

    pub fn downgrade(&self) -> WeakPool {
        WeakPool {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("url", &self.inner.config.redacted_url())
            .field("closed", &self.is_closed())
            .field("stats", &self.stat())
            .finish()
    }
}

impl PoolInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn is_force_closed(&self) -> bool {
        *self.force_closed.borrow()
    }

    /// Run `fut` unless the pool is force-closed first
    pub(crate) async fn unless_force_closed<F, T>(&self, fut: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        let mut forced = self.force_closed.subscribe();
        let terminated = async move {
            if forced.wait_for(|forced| *forced).await.is_ok() {
                return;
            }
            std::future::pending::<()>().await
        };
        tokio::select! {
            biased;
            _ = terminated => Err(DbError::PoolClosed),
            result = fut => result,
        }
    }

    fn checked_out(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Slot>> {
        self.checked_out
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn register(&self, slot: Slot) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.checked_out().insert(id, slot);
        id
    }

    pub(crate) fn deregister(&self, id: u64) {
        self.checked_out().remove(&id);
    }

    /// Close every session still checked out. Their handles find an empty
    /// slot afterwards.
    async fn terminate_checked_out(&self) {
        let slots: Vec<Slot> = self.checked_out().drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            let entry = slot.lock().await.take();
            if let Some(entry) = entry {
                PoolCounters::decr(&self.counters.acquired);
                self.destroy(entry, DestroyReason::Closed).await;
            }
        }
        self.released.notify_waiters();
    }

    fn spawn_maintenance(inner: &Arc<Self>, handle: &Handle) {
        let weak = Arc::downgrade(inner);
        let shutdown = Arc::clone(&inner.shutdown);
        let period = inner.config.health_check_period();
        handle.spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.notified() => break,
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.is_closed() {
                    break;
                }
                inner.check_idle().await;
                inner.top_up().await;
            }
        });
    }

    /// Hand out an idle connection, or open a new one.
    /// Returns whether the connection was freshly created.
    async fn checkout(&self, deadline: Instant) -> DbResult<(Entry, bool)> {
        while let Some(mut entry) = self.pop_idle().await {
            if entry.is_expired() {
                self.destroy(entry, DestroyReason::Expired).await;
                continue;
            }
            if !self.hooks.before_acquire(entry.conn.as_mut()).await {
                self.destroy(entry, DestroyReason::Vetoed).await;
                continue;
            }
            return Ok((entry, false));
        }
        self.open(deadline).await.map(|entry| (entry, true))
    }

    /// Open a connection, retrying transport failures with backoff until
    /// `deadline`. Each attempt is bounded by the connect timeout.
    async fn open(&self, deadline: Instant) -> DbResult<Entry> {
        let started = Instant::now();
        let mut backoff = CONNECT_BACKOFF_START;
        let mut last_error = None;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(match last_error {
                    Some(err @ DbError::Connection { .. }) => err,
                    _ => DbError::ConnectTimeout {
                        elapsed: started.elapsed(),
                    },
                });
            }
            let attempt_deadline = deadline.min(now + self.config.connect_timeout());

            let attempt = self
                .instrumentation
                .connect(async {
                    match time::timeout_at(attempt_deadline, self.connector.connect()).await {
                        Ok(result) => result,
                        Err(_) => Err(DbError::ConnectTimeout {
                            elapsed: attempt_deadline.saturating_duration_since(now),
                        }),
                    }
                })
                .await;

            match attempt {
                Ok(mut conn) => {
                    if let Err(err) = self.hooks.after_connect(conn.as_mut()).await {
                        warn!(host = conn.endpoint(), error = %err, "after_connect hook failed");
                        self.close_quietly(conn).await;
                        return Err(err);
                    }
                    PoolCounters::incr(&self.counters.total);
                    PoolCounters::incr(&self.counters.new_connections_count);
                    debug!(host = conn.endpoint(), "opened connection");
                    return Ok(Entry::new(conn, self.expiry()));
                }
                Err(err) if err.is_fatal_to_connection() => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if !remaining.is_zero() {
                        warn!(error = %err, retry_in = ?backoff, "connect failed; retrying");
                        time::sleep(backoff.min(remaining)).await;
                        backoff = (backoff * 2).min(CONNECT_BACKOFF_MAX);
                    }
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Lifetime plus a per-connection random jitter, so a pool filled at
    /// once does not expire at once
    fn expiry(&self) -> Instant {
        let jitter = self.config.max_connection_lifetime_jitter();
        let extra = if jitter.is_zero() {
            Duration::ZERO
        } else {
            rand::thread_rng().gen_range(Duration::ZERO..=jitter)
        };
        Instant::now() + self.config.max_connection_lifetime() + extra
    }

    /// Return a checked-out connection
    pub(crate) async fn release(&self, entry: Entry, permit: OwnedSemaphorePermit) {
        PoolCounters::decr(&self.counters.acquired);
        self.check_in(entry, permit).await;
    }

    /// Restore the session and put the connection back into the idle set,
    /// or destroy it. The permit is dropped last, so a waiter woken by it
    /// finds the connection already idle.
    async fn check_in(&self, mut entry: Entry, permit: OwnedSemaphorePermit) {
        let verdict = if self.is_closed() || self.is_force_closed() {
            Some(DestroyReason::Closed)
        } else if !self.reset_session(&mut entry).await {
            Some(DestroyReason::Dirty)
        } else if entry.is_expired() {
            Some(DestroyReason::Expired)
        } else if !self.hooks.after_release(entry.conn.as_mut()).await {
            Some(DestroyReason::Vetoed)
        } else {
            None
        };

        match verdict {
            Some(reason) => self.destroy(entry, reason).await,
            None => self.push_idle(entry).await,
        }
        drop(permit);
        self.released.notify_waiters();
    }

    /// Undo whatever session state the last holder left behind
    async fn reset_session(&self, entry: &mut Entry) -> bool {
        if entry.session.broken {
            return false;
        }
        if entry.session.is_clean() {
            return true;
        }

        let host = entry.conn.endpoint().to_string();
        let reset = async {
            if entry.session.in_transaction {
                debug!(host = %host, "rolling back transaction left open on release");
                entry.conn.execute(ROLLBACK, &[]).await?;
                entry.session.in_transaction = false;
            }
            if entry.session.follower_reads {
                debug!(host = %host, "turning follower reads off on release");
                entry.conn.execute(DISABLE_FOLLOWER_READS, &[]).await?;
                entry.session.follower_reads = false;
            }
            Ok::<(), DbError>(())
        };

        match time::timeout(self.config.connect_timeout(), reset).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                warn!(host = %host, error = %err, "session reset failed");
                false
            }
            Err(_) => {
                warn!(host = %host, "session reset timed out");
                false
            }
        }
    }

    /// Park an entry, or destroy it when the pool has closed meanwhile.
    /// `closed` is read under the idle lock, so `close` either drains the
    /// entry or this sees the flag.
    async fn push_idle(&self, entry: Entry) {
        {
            let mut idle = self.idle.lock().await;
            if !self.is_closed() {
                idle.push_back(entry);
                PoolCounters::incr(&self.counters.idle);
                return;
            }
        }
        self.destroy(entry, DestroyReason::Closed).await;
    }

    /// Most recently used first
    async fn pop_idle(&self) -> Option<Entry> {
        let entry = self.idle.lock().await.pop_back();
        if entry.is_some() {
            PoolCounters::decr(&self.counters.idle);
        }
        entry
    }

    async fn pop_oldest(&self) -> Option<Entry> {
        let entry = self.idle.lock().await.pop_front();
        if entry.is_some() {
            PoolCounters::decr(&self.counters.idle);
        }
        entry
    }

    async fn destroy(&self, entry: Entry, reason: DestroyReason) {
        let endpoint = entry.conn.endpoint().to_string();
        self.hooks.before_close(&endpoint).await;
        debug!(host = %endpoint, reason = reason.as_str(), "destroying connection");
        self.close_quietly(entry.conn).await;
        self.count_destroyed(reason);
    }

    async fn close_quietly(&self, conn: Box<dyn Connection>) {
        let endpoint = conn.endpoint().to_string();
        let timeout = self.config.connect_timeout();
        let closing = async {
            match time::timeout(timeout, conn.close()).await {
                Ok(result) => result,
                Err(_) => Err(DbError::connection("timed out closing connection")),
            }
        };
        if let Err(err) = self.instrumentation.close(&endpoint, closing).await {
            debug!(host = %endpoint, error = %err, "error while closing connection");
        }
    }

    /// Synchronous teardown for a connection dropped outside any runtime
    pub(crate) fn discard(&self, entry: Entry) {
        PoolCounters::decr(&self.counters.acquired);
        drop(entry);
        self.count_destroyed(DestroyReason::Dirty);
        self.released.notify_waiters();
    }

    fn count_destroyed(&self, reason: DestroyReason) {
        PoolCounters::decr(&self.counters.total);
        PoolCounters::incr(&self.counters.destroyed_count);
        match reason {
            DestroyReason::Expired => {
                PoolCounters::incr(&self.counters.max_lifetime_destroy_count)
            }
            DestroyReason::HealthCheck => {
                PoolCounters::incr(&self.counters.health_check_destroy_count)
            }
            _ => {}
        }
    }

    /// Retire expired idle connections and ping the rest. Each inspected
    /// connection holds a permit while it is out of the idle set.
    async fn check_idle(&self) {
        let count = self.idle.lock().await.len();
        let timeout = self.config.connect_timeout();

        for _ in 0..count {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };
            let Some(mut entry) = self.pop_oldest().await else {
                break;
            };

            if entry.is_expired() {
                self.destroy(entry, DestroyReason::Expired).await;
            } else {
                match time::timeout(timeout, entry.conn.ping()).await {
                    Ok(Ok(())) => self.push_idle(entry).await,
                    Ok(Err(err)) => {
                        debug!(host = entry.conn.endpoint(), error = %err, "idle connection failed ping");
                        self.destroy(entry, DestroyReason::HealthCheck).await;
                    }
                    Err(_) => {
                        debug!(host = entry.conn.endpoint(), "idle connection ping timed out");
                        self.destroy(entry, DestroyReason::HealthCheck).await;
                    }
                }
            }
            drop(permit);
        }
    }

    /// Open connections until `min_connections` are alive
    async fn top_up(&self) {
        let min = u64::from(self.config.min_connections());
        while self.counters.total.load(Ordering::Relaxed) < min && !self.is_closed() {
            let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                break;
            };
            let deadline = Instant::now() + self.config.connect_timeout();
            match self.open(deadline).await {
                Ok(entry) => self.push_idle(entry).await,
                Err(err) => {
                    warn!(error = %err, min_connections = min, "could not open minimum connections");
                    break;
                }
            }
            drop(permit);
        }
    }
}

#[cfg(test)]
mod tests;
