//! In-memory stand-in for a YugabyteDB cluster.
//!
//! [`MemoryCluster`] is a [`Connector`] whose sessions keep the state the
//! pool and executor care about: the `yb_read_from_followers` setting, the
//! open transaction and its access mode. Session and transaction control is
//! handled here; every other statement goes to a pluggable [`Backend`].
//!
//! Like the real server, follower reads only take effect for a read-only
//! transaction begun while the setting was on, writes inside a read-only
//! transaction fail with SQLSTATE 25006, and a failed statement aborts the
//! surrounding transaction (25P02) until it is rolled back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::connection::{Connection, Connector};
use crate::error::{DbError, DbResult};
use crate::value::{Row, SqlValue};

/// Executes data statements for a [`MemoryCluster`]
pub trait Backend: Send + Sync {
    fn query(&self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>>;
    fn execute(&self, sql: &str, params: &[SqlValue]) -> DbResult<u64>;
}

/// Backend with no data: reads return nothing, writes touch nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyBackend;

impl Backend for EmptyBackend {
    fn query(&self, _sql: &str, _params: &[SqlValue]) -> DbResult<Vec<Row>> {
        Ok(Vec::new())
    }

    fn execute(&self, _sql: &str, _params: &[SqlValue]) -> DbResult<u64> {
        Ok(0)
    }
}

/// Injected failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The statement fails with this SQLSTATE
    Execution { sql_state: String },
    /// The server drops the session
    Disconnect,
}

/// A statement as received by the cluster
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedStatement {
    pub session: u64,
    pub sql: String,
    pub params: Vec<SqlValue>,
    /// Sent inside a transaction
    pub in_transaction: bool,
    /// Would have been served by a follower replica
    pub follower_read: bool,
}

/// Server-side view of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: u64,
    pub endpoint: String,
    pub open: bool,
    pub follower_reads: bool,
    pub in_transaction: bool,
}

#[derive(Debug, Clone, Copy)]
struct Transaction {
    read_only: bool,
    follower_reads: bool,
    aborted: bool,
}

#[derive(Debug)]
struct SessionRecord {
    endpoint: String,
    open: bool,
    follower_reads: bool,
    transaction: Option<Transaction>,
}

struct FaultRule {
    pattern: String,
    fault: Fault,
    remaining: usize,
}

struct ClusterState {
    backend: Arc<dyn Backend>,
    hosts: Mutex<Vec<String>>,
    next_host: AtomicUsize,
    next_session: AtomicU64,
    connects: AtomicU64,
    refused_connects: AtomicU64,
    latency: Mutex<Duration>,
    connect_latency: Mutex<Duration>,
    sessions: Mutex<BTreeMap<u64, SessionRecord>>,
    log: Mutex<Vec<LoggedStatement>>,
    faults: Mutex<Vec<FaultRule>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared handle to an in-memory cluster; clones see the same sessions
#[derive(Clone)]
pub struct MemoryCluster {
    state: Arc<ClusterState>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new(EmptyBackend)
    }
}

impl MemoryCluster {
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self {
            state: Arc::new(ClusterState {
                backend: Arc::new(backend),
                hosts: Mutex::new(vec!["127.0.0.1:5433".to_string()]),
                next_host: AtomicUsize::new(0),
                next_session: AtomicU64::new(1),
                connects: AtomicU64::new(0),
                refused_connects: AtomicU64::new(0),
                latency: Mutex::new(Duration::ZERO),
                connect_latency: Mutex::new(Duration::ZERO),
                sessions: Mutex::new(BTreeMap::new()),
                log: Mutex::new(Vec::new()),
                faults: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Endpoints handed out round-robin to new sessions
    pub fn with_hosts(self, hosts: &[&str]) -> Self {
        *lock(&self.state.hosts) = hosts.iter().map(|h| (*h).to_string()).collect();
        self
    }

    /// Delay before every statement
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.state.latency) = latency;
    }

    /// Delay before every connect
    pub fn set_connect_latency(&self, latency: Duration) {
        *lock(&self.state.connect_latency) = latency;
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_connects(&self, count: u64) {
        self.state.refused_connects.store(count, Ordering::SeqCst);
    }

    /// Fail the next `times` statements containing `pattern`
    /// (case-insensitive)
    pub fn fail_next(&self, pattern: &str, fault: Fault, times: usize) {
        lock(&self.state.faults).push(FaultRule {
            pattern: pattern.to_ascii_uppercase(),
            fault,
            remaining: times,
        });
    }

    /// Drop every session server-side
    pub fn terminate_all_sessions(&self) {
        for session in lock(&self.state.sessions).values_mut() {
            session.open = false;
        }
    }

    /// Successful connects so far
    pub fn connects(&self) -> u64 {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn statements(&self) -> Vec<LoggedStatement> {
        lock(&self.state.log).clone()
    }

    pub fn clear_statements(&self) {
        lock(&self.state.log).clear();
    }

    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        lock(&self.state.sessions)
            .iter()
            .map(|(id, record)| SessionSnapshot {
                id: *id,
                endpoint: record.endpoint.clone(),
                open: record.open,
                follower_reads: record.follower_reads,
                in_transaction: record.transaction.is_some(),
            })
            .collect()
    }

    pub fn open_sessions(&self) -> Vec<SessionSnapshot> {
        self.sessions().into_iter().filter(|s| s.open).collect()
    }
}

#[async_trait]
impl Connector for MemoryCluster {
    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        let latency = *lock(&self.state.connect_latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let refused = self
            .state
            .refused_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(DbError::connection("connection refused"));
        }

        let endpoint = {
            let hosts = lock(&self.state.hosts);
            let i = self.state.next_host.fetch_add(1, Ordering::SeqCst);
            hosts
                .get(i % hosts.len().max(1))
                .cloned()
                .unwrap_or_default()
        };
        let id = self.state.next_session.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.sessions).insert(
            id,
            SessionRecord {
                endpoint: endpoint.clone(),
                open: true,
                follower_reads: false,
                transaction: None,
            },
        );
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryConnection {
            id,
            endpoint,
            state: Arc::clone(&self.state),
        }))
    }
}

enum Reply {
    Rows(Vec<Row>),
    Affected(u64),
}

struct MemoryConnection {
    id: u64,
    endpoint: String,
    state: Arc<ClusterState>,
}

impl MemoryConnection {
    async fn run(&mut self, sql: &str, params: &[SqlValue], want_rows: bool) -> DbResult<Reply> {
        let latency = *lock(&self.state.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.state.statement(self.id, sql, params, want_rows)
    }
}

impl ClusterState {
    fn take_fault(&self, command: &str) -> Option<Fault> {
        let mut faults = lock(&self.faults);
        let rule = faults
            .iter_mut()
            .find(|rule| rule.remaining > 0 && command.contains(&rule.pattern))?;
        rule.remaining -= 1;
        Some(rule.fault.clone())
    }

    fn statement(
        &self,
        id: u64,
        sql: &str,
        params: &[SqlValue],
        want_rows: bool,
    ) -> DbResult<Reply> {
        let command = normalize(sql);
        let mut sessions = lock(&self.sessions);
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| DbError::connection("unknown session"))?;
        if !session.open {
            return Err(DbError::connection("server closed the connection unexpectedly"));
        }

        lock(&self.log).push(LoggedStatement {
            session: id,
            sql: sql.to_string(),
            params: params.to_vec(),
            in_transaction: session.transaction.is_some(),
            follower_read: session
                .transaction
                .is_some_and(|tx| tx.read_only && tx.follower_reads),
        });

        if let Some(fault) = self.take_fault(&command) {
            return match fault {
                Fault::Disconnect => {
                    session.open = false;
                    Err(DbError::connection("server closed the connection unexpectedly"))
                }
                Fault::Execution { sql_state } => {
                    if let Some(tx) = session.transaction.as_mut() {
                        tx.aborted = true;
                    }
                    Err(DbError::execution("injected failure", Some(sql_state)))
                }
            };
        }

        let ends_transaction = matches!(command.as_str(), "COMMIT" | "END" | "ROLLBACK" | "ABORT");
        if ends_transaction {
            session.transaction = None;
            return Ok(Reply::Affected(0));
        }
        if session.transaction.is_some_and(|tx| tx.aborted) {
            return Err(DbError::execution(
                "current transaction is aborted, commands ignored until end of transaction block",
                Some("25P02".to_string()),
            ));
        }

        if let Some(enabled) = parse_follower_setting(&command) {
            session.follower_reads = enabled;
            return Ok(Reply::Affected(0));
        }
        if command.starts_with("BEGIN") || command.starts_with("START TRANSACTION") {
            if session.transaction.is_none() {
                session.transaction = Some(Transaction {
                    read_only: command.contains("READ ONLY"),
                    follower_reads: session.follower_reads,
                    aborted: false,
                });
            }
            return Ok(Reply::Affected(0));
        }
        if command == "SELECT 1" {
            return Ok(Reply::Rows(vec![Row::new().with("?column?", 1_i64)]));
        }
        if command.contains("CURRENT_SETTING('YB_READ_FROM_FOLLOWERS')") {
            let value = if session.follower_reads { "on" } else { "off" };
            return Ok(Reply::Rows(vec![
                Row::new().with("yb_read_from_followers", value)
            ]));
        }

        if let Some(tx) = session.transaction.as_mut() {
            if tx.read_only && is_write(&command) {
                tx.aborted = true;
                let operation = command.split(' ').next().unwrap_or_default();
                return Err(DbError::execution(
                    format!("cannot execute {operation} in a read-only transaction"),
                    Some("25006".to_string()),
                ));
            }
        }
        drop(sessions);

        let result = if want_rows {
            self.backend.query(sql, params).map(Reply::Rows)
        } else {
            self.backend.execute(sql, params).map(Reply::Affected)
        };
        if result.is_err() {
            if let Some(tx) = lock(&self.sessions)
                .get_mut(&id)
                .and_then(|s| s.transaction.as_mut())
            {
                tx.aborted = true;
            }
        }
        result
    }

    fn session_open(&self, id: u64) -> bool {
        lock(&self.sessions).get(&id).is_some_and(|s| s.open)
    }

    fn end_session(&self, id: u64) {
        if let Some(session) = lock(&self.sessions).get_mut(&id) {
            session.open = false;
            session.transaction = None;
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        match self.run(sql, params, false).await? {
            Reply::Affected(n) => Ok(n),
            Reply::Rows(rows) => Ok(rows.len() as u64),
        }
    }

    async fn fetch_optional(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Row>> {
        match self.run(sql, params, true).await? {
            Reply::Rows(rows) => Ok(rows.into_iter().next()),
            Reply::Affected(_) => Ok(None),
        }
    }

    async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        match self.run(sql, params, true).await? {
            Reply::Rows(rows) => Ok(rows),
            Reply::Affected(_) => Ok(Vec::new()),
        }
    }

    async fn ping(&mut self) -> DbResult<()> {
        if self.state.session_open(self.id) {
            Ok(())
        } else {
            Err(DbError::connection("server closed the connection unexpectedly"))
        }
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        // Drop ends the session
        Ok(())
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.state.end_session(self.id);
    }
}

/// Uppercase, single-spaced, without a trailing semicolon
fn normalize(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .trim_end()
        .to_ascii_uppercase()
}

fn parse_follower_setting(command: &str) -> Option<bool> {
    let rest = command.strip_prefix("SET ")?;
    let rest = rest.strip_prefix("SESSION ").unwrap_or(rest);
    let rest = rest.strip_prefix("YB_READ_FROM_FOLLOWERS")?.trim_start();
    let value = rest
        .strip_prefix('=')
        .or_else(|| rest.strip_prefix("TO "))?
        .trim()
        .trim_matches('\'');
    match value {
        "TRUE" | "ON" | "1" => Some(true),
        "FALSE" | "OFF" | "0" => Some(false),
        _ => None,
    }
}

fn is_write(command: &str) -> bool {
    let first = command.split(' ').next().unwrap_or_default();
    match first {
        "INSERT" | "UPDATE" | "DELETE" | "CREATE" | "DROP" | "ALTER" | "TRUNCATE" => true,
        "WITH" => {
            command.contains("INSERT INTO")
                || command.contains("DELETE FROM")
                || command.contains(" UPDATE ")
        }
        _ => false,
    }
}
