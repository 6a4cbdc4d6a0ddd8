//! Checked-out connections and read-only transactions.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{Mutex, MutexGuard, OwnedSemaphorePermit};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::PoolInner;
use crate::connection::Connection;
use crate::error::{DbError, DbResult};
use crate::instrument::QueryOutcome;
use crate::session::{
    SessionState, BEGIN_READ_ONLY, COMMIT, DISABLE_FOLLOWER_READS, ENABLE_FOLLOWER_READS, ROLLBACK,
};
use crate::value::{Row, SqlValue};

/// A physical connection plus the pool's bookkeeping for it
pub(crate) struct Entry {
    pub(crate) conn: Box<dyn Connection>,
    pub(crate) expires_at: Instant,
    pub(crate) session: SessionState,
}

impl Entry {
    pub(crate) fn new(conn: Box<dyn Connection>, expires_at: Instant) -> Self {
        Self {
            conn,
            expires_at,
            session: SessionState::default(),
        }
    }

    pub(crate) fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Shared home of a checked-out entry. The holder runs statements through
/// it; the pool empties it when a forced close terminates the session.
pub(crate) type Slot = Arc<Mutex<Option<Entry>>>;

/// A connection checked out of the [`Pool`](crate::Pool).
///
/// Exclusively owned by one caller. Prefer [`release`](Self::release);
/// dropping the handle schedules the same release on the runtime.
pub struct PooledConnection {
    id: u64,
    endpoint: String,
    slot: Slot,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    /// Register a checked-out entry with the pool. The caller has already
    /// counted it as acquired.
    pub(crate) fn new(entry: Entry, permit: OwnedSemaphorePermit, pool: Arc<PoolInner>) -> Self {
        let endpoint = entry.conn.endpoint().to_string();
        let slot: Slot = Arc::new(Mutex::new(Some(entry)));
        let id = pool.register(Arc::clone(&slot));
        Self {
            id,
            endpoint,
            slot,
            permit: Some(permit),
            pool,
        }
    }

    async fn lock(&self) -> DbResult<MutexGuard<'_, Option<Entry>>> {
        if self.pool.is_force_closed() {
            return Err(DbError::PoolClosed);
        }
        Ok(self.slot.lock().await)
    }

    /// Run one instrumented statement; a forced pool close cancels it
    async fn run<F, T>(&self, sql: &str, params: &[SqlValue], statement: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
        T: QueryOutcome,
    {
        let instrumented = self
            .pool
            .instrumentation
            .query(sql, params, &self.endpoint, statement);
        self.pool.unless_force_closed(instrumented).await
    }

    async fn update_session(&self, update: impl FnOnce(&mut SessionState)) -> DbResult<()> {
        let mut slot = self.lock().await?;
        let entry = slot.as_mut().ok_or(DbError::PoolClosed)?;
        update(&mut entry.session);
        Ok(())
    }

    /// `host:port` of the underlying session
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The pool's view of this session
    pub fn session(&self) -> SessionState {
        self.slot
            .try_lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|entry| entry.session))
            .unwrap_or_default()
    }

    pub async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        let mut slot = self.lock().await?;
        let entry = slot.as_mut().ok_or(DbError::PoolClosed)?;
        let result = self.run(sql, params, entry.conn.execute(sql, params)).await;
        mark_if_fatal(entry, result)
    }

    pub async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> DbResult<Option<Row>> {
        let mut slot = self.lock().await?;
        let entry = slot.as_mut().ok_or(DbError::PoolClosed)?;
        let result = self
            .run(sql, params, entry.conn.fetch_optional(sql, params))
            .await;
        mark_if_fatal(entry, result)
    }

    pub async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        let mut slot = self.lock().await?;
        let entry = slot.as_mut().ok_or(DbError::PoolClosed)?;
        let result = self.run(sql, params, entry.conn.fetch_all(sql, params)).await;
        mark_if_fatal(entry, result)
    }

    pub async fn ping(&mut self) -> DbResult<()> {
        let mut slot = self.lock().await?;
        let entry = slot.as_mut().ok_or(DbError::PoolClosed)?;
        let result = self.pool.unless_force_closed(entry.conn.ping()).await;
        mark_if_fatal(entry, result)
    }

    /// Toggle follower reads for this session.
    ///
    /// Turning them on marks the session dirty before the statement is sent.
    /// Turning them off clears the mark only on success; a failed disable
    /// marks the connection broken so it never re-enters the idle set.
    pub async fn set_follower_reads(&mut self, enabled: bool) -> DbResult<()> {
        let sql = if enabled {
            ENABLE_FOLLOWER_READS
        } else {
            DISABLE_FOLLOWER_READS
        };

        let mut slot = self.lock().await?;
        let entry = slot.as_mut().ok_or(DbError::PoolClosed)?;
        if enabled {
            entry.session.follower_reads = true;
        }
        let result = self.run(sql, &[], entry.conn.execute(sql, &[])).await;
        match mark_if_fatal(entry, result) {
            Ok(_) => {
                if !enabled {
                    entry.session.follower_reads = false;
                }
                Ok(())
            }
            Err(err) => {
                if !enabled {
                    entry.session.broken = true;
                }
                Err(err)
            }
        }
    }

    /// Open a read-only transaction on this connection
    pub async fn begin_read_only(&mut self) -> DbResult<ReadOnlyTransaction<'_>> {
        {
            let mut slot = self.lock().await?;
            let entry = slot.as_mut().ok_or(DbError::PoolClosed)?;
            // a failed BEGIN may still have opened one; the reset on release
            // rolls back unconditionally while this is set
            entry.session.in_transaction = true;
            let result = self
                .run(BEGIN_READ_ONLY, &[], entry.conn.execute(BEGIN_READ_ONLY, &[]))
                .await;
            mark_if_fatal(entry, result)?;
        }
        Ok(ReadOnlyTransaction {
            conn: self,
            finished: false,
        })
    }

    /// Return the connection to the pool, restoring its session first
    pub async fn release(mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        self.pool.deregister(self.id);
        let entry = self.slot.lock().await.take();
        match entry {
            Some(entry) => self.pool.release(entry, permit).await,
            // terminated by a forced close, which already did the accounting
            None => drop(permit),
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("endpoint", &self.endpoint)
            .field("session", &self.session())
            .field("released", &self.permit.is_none())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        self.pool.deregister(self.id);
        // a failed try_lock means a forced close is terminating the entry
        let entry = match self.slot.try_lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(entry) = entry else {
            return;
        };
        match Handle::try_current() {
            Ok(handle) => {
                let pool = self.pool.clone();
                handle.spawn(async move {
                    pool.release(entry, permit).await;
                });
            }
            Err(_) => {
                debug!("connection dropped outside a runtime; discarding");
                self.pool.discard(entry);
                drop(permit);
            }
        }
    }
}

fn mark_if_fatal<T>(entry: &mut Entry, result: DbResult<T>) -> DbResult<T> {
    if let Err(err) = &result {
        if err.is_fatal_to_connection() {
            entry.session.broken = true;
        }
    }
    result
}

/// An open `BEGIN READ ONLY` transaction.
///
/// Finish it with [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// Dropping it unfinished leaves the session marked in-transaction, and the
/// pool rolls back before the connection is reused.
pub struct ReadOnlyTransaction<'c> {
    conn: &'c mut PooledConnection,
    finished: bool,
}

impl ReadOnlyTransaction<'_> {
    pub async fn fetch_optional(
        &mut self,
        sql: &str,
        params: &[SqlValue],
    ) -> DbResult<Option<Row>> {
        self.conn.fetch_optional(sql, params).await
    }

    pub async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        self.conn.fetch_all(sql, params).await
    }

    pub async fn commit(mut self) -> DbResult<()> {
        self.finish(COMMIT).await
    }

    pub async fn rollback(mut self) -> DbResult<()> {
        self.finish(ROLLBACK).await
    }

    async fn finish(&mut self, sql: &str) -> DbResult<()> {
        self.finished = true;
        self.conn.execute(sql, &[]).await?;
        self.conn
            .update_session(|session| session.in_transaction = false)
            .await
    }
}

impl Drop for ReadOnlyTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("read-only transaction dropped without commit or rollback");
        }
    }
}
