//! Follower-read transaction executor.
//!
//! A read runs as:
//!
//! ```text
//! acquire -> SET yb_read_from_followers = true -> BEGIN READ ONLY -> query
//!         -> COMMIT | ROLLBACK -> SET yb_read_from_followers = false -> release
//! ```
//!
//! [`FollowerReadSession`] owns the toggle: once `enter` has sent the enable
//! statement, `exit` (or, failing that, the pool's reset on release) turns
//! follower reads off again before the connection can be reused. Writes
//! never use follower reads; they run on the primary in the default session
//! mode.

use tracing::{instrument, warn};

use crate::error::DbResult;
use crate::pool::{Pool, PooledConnection, ReadOnlyTransaction};
use crate::value::{Row, Statement};

/// Scoped follower-read mode on one connection
pub struct FollowerReadSession<'c> {
    conn: &'c mut PooledConnection,
    enabled: bool,
}

impl<'c> FollowerReadSession<'c> {
    /// Turn follower reads on (when `enabled`). If the enable statement
    /// fails, the setting is switched back off before the error is returned.
    pub async fn enter(conn: &'c mut PooledConnection, enabled: bool) -> DbResult<Self> {
        let session = Self { conn, enabled };
        if !enabled {
            return Ok(session);
        }
        if let Err(err) = session.conn.set_follower_reads(true).await {
            session.exit().await;
            return Err(err);
        }
        Ok(session)
    }

    pub async fn begin_read_only(&mut self) -> DbResult<ReadOnlyTransaction<'_>> {
        self.conn.begin_read_only().await
    }

    /// Turn follower reads back off. A failed restore marks the connection
    /// broken, so the pool discards it on release.
    pub async fn exit(self) {
        if !self.enabled {
            return;
        }
        if let Err(err) = self.conn.set_follower_reads(false).await {
            warn!(
                host = self.conn.endpoint(),
                error = %err,
                "could not turn follower reads off; connection will be discarded"
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fetch {
    One,
    All,
}

/// Runs statements against the pool: reads through the follower-read
/// path, writes on the primary
#[derive(Debug, Clone)]
pub struct FollowerReadExecutor {
    pool: Pool,
}

impl FollowerReadExecutor {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Single-row read. No row is `NotFound` for the statement's resource.
    #[instrument(skip_all, fields(follower_reads = self.pool.config().follower_reads()))]
    pub async fn fetch_one(&self, stmt: &Statement<'_>) -> DbResult<Row> {
        let rows = self.read(stmt, Fetch::One).await?;
        rows.into_iter().next().ok_or_else(|| stmt.not_found())
    }

    /// Multi-row read; an empty result is not an error
    #[instrument(skip_all, fields(follower_reads = self.pool.config().follower_reads()))]
    pub async fn fetch_all(&self, stmt: &Statement<'_>) -> DbResult<Vec<Row>> {
        self.read(stmt, Fetch::All).await
    }

    /// Write on the primary, returning the affected-row count
    #[instrument(skip_all)]
    pub async fn execute(&self, stmt: &Statement<'_>) -> DbResult<u64> {
        let mut conn = self.pool.acquire().await?;
        let result = conn.execute(stmt.sql(), stmt.params()).await;
        conn.release().await;
        result
    }

    /// Write with a `RETURNING` clause on the primary. No row is `NotFound`.
    #[instrument(skip_all)]
    pub async fn execute_returning(&self, stmt: &Statement<'_>) -> DbResult<Row> {
        let mut conn = self.pool.acquire().await?;
        let result = conn.fetch_optional(stmt.sql(), stmt.params()).await;
        conn.release().await;
        result?.ok_or_else(|| stmt.not_found())
    }

    async fn read(&self, stmt: &Statement<'_>, fetch: Fetch) -> DbResult<Vec<Row>> {
        let mut conn = self.pool.acquire().await?;
        let follower_reads = self.pool.config().follower_reads();

        let result = match FollowerReadSession::enter(&mut conn, follower_reads).await {
            Ok(mut session) => {
                let result = read_in_transaction(&mut session, stmt, fetch).await;
                session.exit().await;
                result
            }
            Err(err) => Err(err),
        };

        conn.release().await;
        result
    }
}

/// `BEGIN READ ONLY`, query, then commit on success or roll back on any
/// failure, including a single-row read that matched nothing
async fn read_in_transaction(
    session: &mut FollowerReadSession<'_>,
    stmt: &Statement<'_>,
    fetch: Fetch,
) -> DbResult<Vec<Row>> {
    let mut tx = session.begin_read_only().await?;
    let rows = match fetch {
        Fetch::One => tx
            .fetch_optional(stmt.sql(), stmt.params())
            .await
            .map(|row| row.into_iter().collect::<Vec<_>>()),
        Fetch::All => tx.fetch_all(stmt.sql(), stmt.params()).await,
    };

    match rows {
        Ok(rows) if fetch == Fetch::One && rows.is_empty() => {
            if let Err(err) = tx.rollback().await {
                warn!(error = %err, "rollback after empty read failed");
            }
            Err(stmt.not_found())
        }
        Ok(rows) => {
            tx.commit().await?;
            Ok(rows)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback after failed read failed");
            }
            Err(err)
        }
    }
}
