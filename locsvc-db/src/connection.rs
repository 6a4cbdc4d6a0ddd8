//! Physical connection seam.
//!
//! The pool never talks to a driver directly; it owns `Box<dyn Connection>`
//! values produced by a [`Connector`]. The production implementation lives
//! in [`crate::postgres`]; tests use the in-memory cluster from
//! `crate::testing`.

use async_trait::async_trait;

use crate::error::DbResult;
use crate::value::{Row, SqlValue};

/// A single physical database session
#[async_trait]
pub trait Connection: Send {
    /// Execute a statement, returning the affected row count.
    ///
    /// Without parameters the statement is sent as a simple query, which is
    /// what session and transaction control (`SET`, `BEGIN`, `COMMIT`)
    /// needs.
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<u64>;

    /// Fetch at most one row
    async fn fetch_optional(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Row>>;

    /// Fetch every row
    async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>>;

    /// Cheap liveness probe
    async fn ping(&mut self) -> DbResult<()>;

    /// Terminate the session
    async fn close(self: Box<Self>) -> DbResult<()>;

    /// `host:port` this session is connected to
    fn endpoint(&self) -> &str;
}

/// Opens new physical connections for the pool
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open one connection. The pool bounds each call with its connect
    /// timeout and retries transport failures with backoff.
    async fn connect(&self) -> DbResult<Box<dyn Connection>>;
}
