//! sqlx-backed connections to YugabyteDB's YSQL endpoint.
//!
//! [`PgConnector`] opens one `sqlx::PgConnection` per call. With load
//! balancing on, it spreads new connections round-robin over the tablet
//! servers on the most preferred topology tier, refreshing the server list
//! from `yb_servers()` at most every five minutes; otherwise it walks the
//! configured host list in order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgArguments, PgConnectOptions, PgConnection, PgRow, PgSslMode, Postgres};
use sqlx::query::Query;
use sqlx::{Column as _, Connection as _, Executor as _, Row as _, TypeInfo as _};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{HostAddr, PoolConfiguration, SslMode};
use crate::connection::{Connection, Connector};
use crate::error::{DbError, DbResult};
use crate::topology::{preferred_servers, ServerPlacement, TopologyKey};
use crate::value::{Row, SqlType, SqlValue};

/// How long a fetched `yb_servers()` list is trusted
pub const SERVER_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);

const YB_SERVERS: &str = "SELECT host, port, cloud, region, zone FROM yb_servers()";

fn ssl_mode(mode: SslMode) -> PgSslMode {
    match mode {
        SslMode::Disable => PgSslMode::Disable,
        SslMode::Allow => PgSslMode::Allow,
        SslMode::Prefer => PgSslMode::Prefer,
        SslMode::Require => PgSslMode::Require,
        SslMode::VerifyCa => PgSslMode::VerifyCa,
        SslMode::VerifyFull => PgSslMode::VerifyFull,
    }
}

#[derive(Default)]
struct ServerCache {
    refreshed_at: Option<Instant>,
    servers: Vec<ServerPlacement>,
}

/// Opens sqlx connections against the configured cluster
pub struct PgConnector {
    options: PgConnectOptions,
    hosts: Vec<HostAddr>,
    load_balance: bool,
    topology_keys: Vec<TopologyKey>,
    next: AtomicUsize,
    cache: Mutex<ServerCache>,
}

impl PgConnector {
    pub fn new(config: &PoolConfiguration) -> Self {
        let mut options = PgConnectOptions::new()
            .username(config.user())
            .password(config.password())
            .database(config.database())
            .ssl_mode(ssl_mode(config.ssl_mode()))
            .application_name(config.application_name());
        if let Some(timeout) = config.statement_timeout() {
            options = options.options([("statement_timeout", timeout.as_millis().to_string())]);
        }

        Self {
            options,
            hosts: config.hosts().to_vec(),
            load_balance: config.load_balance(),
            topology_keys: config.topology_keys().to_vec(),
            next: AtomicUsize::new(0),
            cache: Mutex::new(ServerCache::default()),
        }
    }

    async fn open(&self, host: &HostAddr) -> DbResult<PgConnection> {
        let options = self.options.clone().host(&host.host).port(host.port);
        Ok(PgConnection::connect_with(&options).await?)
    }

    /// Hosts to try, best first
    async fn candidates(&self) -> Vec<HostAddr> {
        if !self.load_balance {
            return self.hosts.clone();
        }

        let servers = self.cluster_servers().await;
        if servers.is_empty() {
            return rotate(self.hosts.clone(), self.next.fetch_add(1, Ordering::Relaxed));
        }

        let preferred: Vec<HostAddr> = preferred_servers(&servers, &self.topology_keys)
            .into_iter()
            .map(|server| HostAddr::new(server.host.clone(), server.port))
            .collect();
        let mut candidates = rotate(preferred, self.next.fetch_add(1, Ordering::Relaxed));

        // everything else stays reachable as a fallback
        for host in servers
            .iter()
            .map(|server| HostAddr::new(server.host.clone(), server.port))
            .chain(self.hosts.iter().cloned())
        {
            if !candidates.contains(&host) {
                candidates.push(host);
            }
        }
        candidates
    }

    async fn cluster_servers(&self) -> Vec<ServerPlacement> {
        let mut cache = self.cache.lock().await;
        let fresh = cache
            .refreshed_at
            .is_some_and(|at| at.elapsed() < SERVER_REFRESH_INTERVAL);
        if !fresh {
            match self.fetch_servers().await {
                Ok(servers) => {
                    debug!(servers = servers.len(), "refreshed cluster server list");
                    cache.servers = servers;
                }
                Err(err) => {
                    warn!(error = %err, "could not refresh cluster server list; using configured hosts");
                }
            }
            cache.refreshed_at = Some(Instant::now());
        }
        cache.servers.clone()
    }

    async fn fetch_servers(&self) -> DbResult<Vec<ServerPlacement>> {
        let mut last_error = DbError::configuration("no hosts configured");
        for host in &self.hosts {
            let mut conn = match self.open(host).await {
                Ok(conn) => conn,
                Err(err) => {
                    last_error = err;
                    continue;
                }
            };
            let rows: Vec<(String, i64, String, String, String)> =
                sqlx::query_as(YB_SERVERS).fetch_all(&mut conn).await?;
            if let Err(err) = conn.close().await {
                debug!(error = %err, "error closing discovery connection");
            }

            return rows
                .into_iter()
                .map(|(host, port, cloud, region, zone)| {
                    let port = u16::try_from(port)
                        .map_err(|_| DbError::decode("port", format!("{port} out of range")))?;
                    Ok(ServerPlacement {
                        host,
                        port,
                        cloud,
                        region,
                        zone,
                    })
                })
                .collect();
        }
        Err(last_error)
    }
}

fn rotate<T>(mut items: Vec<T>, by: usize) -> Vec<T> {
    if !items.is_empty() {
        let len = items.len();
        items.rotate_left(by % len);
    }
    items
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        let mut last_error = DbError::configuration("no hosts configured");
        for host in self.candidates().await {
            match self.open(&host).await {
                Ok(conn) => {
                    return Ok(Box::new(PgSession {
                        conn,
                        endpoint: host.to_string(),
                    }))
                }
                Err(err) if err.is_fatal_to_connection() => {
                    debug!(host = %host, error = %err, "host unavailable; trying next");
                    last_error = err;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_error)
    }
}

/// One sqlx connection
pub struct PgSession {
    conn: PgConnection,
    endpoint: String,
}

fn bind_params<'q>(sql: &'q str, params: &'q [SqlValue]) -> Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, value| match value {
            SqlValue::Null(SqlType::Bool) => query.bind(None::<bool>),
            SqlValue::Null(SqlType::Int) => query.bind(None::<i64>),
            SqlValue::Null(SqlType::Float) => query.bind(None::<f64>),
            SqlValue::Null(SqlType::Text) => query.bind(None::<String>),
            SqlValue::Null(SqlType::Uuid) => query.bind(None::<uuid::Uuid>),
            SqlValue::Bool(b) => query.bind(*b),
            SqlValue::Int(n) => query.bind(*n),
            SqlValue::Float(x) => query.bind(*x),
            SqlValue::Text(s) => query.bind(s.as_str()),
            SqlValue::Uuid(u) => query.bind(*u),
        })
}

fn decode_row(row: &PgRow) -> DbResult<Row> {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name();
        let value = match column.type_info().name() {
            "BOOL" => row
                .try_get::<Option<bool>, _>(i)?
                .map_or(SqlValue::Null(SqlType::Bool), SqlValue::Bool),
            "INT2" => row
                .try_get::<Option<i16>, _>(i)?
                .map_or(SqlValue::Null(SqlType::Int), |n| SqlValue::Int(n.into())),
            "INT4" => row
                .try_get::<Option<i32>, _>(i)?
                .map_or(SqlValue::Null(SqlType::Int), |n| SqlValue::Int(n.into())),
            "INT8" => row
                .try_get::<Option<i64>, _>(i)?
                .map_or(SqlValue::Null(SqlType::Int), SqlValue::Int),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(i)?
                .map_or(SqlValue::Null(SqlType::Float), |x| SqlValue::Float(x.into())),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(i)?
                .map_or(SqlValue::Null(SqlType::Float), SqlValue::Float),
            "UUID" => row
                .try_get::<Option<uuid::Uuid>, _>(i)?
                .map_or(SqlValue::Null(SqlType::Uuid), SqlValue::Uuid),
            "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CHAR" => row
                .try_get::<Option<String>, _>(i)?
                .map_or(SqlValue::Null(SqlType::Text), SqlValue::Text),
            other => {
                return Err(DbError::decode(
                    name,
                    format!("unsupported column type {other}"),
                ))
            }
        };
        out.push(name, value);
    }
    Ok(out)
}

#[async_trait]
impl Connection for PgSession {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<u64> {
        let result = if params.is_empty() {
            // simple query protocol: no prepared statement for SET/BEGIN/COMMIT
            self.conn.execute(sql).await?
        } else {
            bind_params(sql, params).execute(&mut self.conn).await?
        };
        Ok(result.rows_affected())
    }

    async fn fetch_optional(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Option<Row>> {
        bind_params(sql, params)
            .fetch_optional(&mut self.conn)
            .await?
            .as_ref()
            .map(decode_row)
            .transpose()
    }

    async fn fetch_all(&mut self, sql: &str, params: &[SqlValue]) -> DbResult<Vec<Row>> {
        bind_params(sql, params)
            .fetch_all(&mut self.conn)
            .await?
            .iter()
            .map(decode_row)
            .collect()
    }

    async fn ping(&mut self) -> DbResult<()> {
        Ok(self.conn.ping().await?)
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        Ok(self.conn.close().await?)
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_spreads_start_position() {
        assert_eq!(rotate(vec![1, 2, 3], 0), vec![1, 2, 3]);
        assert_eq!(rotate(vec![1, 2, 3], 1), vec![2, 3, 1]);
        assert_eq!(rotate(vec![1, 2, 3], 5), vec![3, 1, 2]);
        assert!(rotate(Vec::<u8>::new(), 7).is_empty());
    }

    #[test]
    fn test_ssl_mode_mapping() {
        assert!(matches!(ssl_mode(SslMode::Disable), PgSslMode::Disable));
        assert!(matches!(ssl_mode(SslMode::VerifyFull), PgSslMode::VerifyFull));
    }

    #[tokio::test]
    async fn test_without_load_balance_hosts_keep_configured_order() {
        let config = PoolConfiguration::builder()
            .hosts("db1:5433,db2:5433")
            .load_balance(false)
            .build()
            .unwrap();
        let connector = PgConnector::new(&config);
        let candidates = connector.candidates().await;
        assert_eq!(
            candidates,
            vec![HostAddr::new("db1", 5433), HostAddr::new("db2", 5433)]
        );
    }
}
