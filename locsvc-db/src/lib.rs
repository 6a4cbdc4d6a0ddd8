//! Read-replica-aware data access for YugabyteDB.
//!
//! A [`Pool`] hands out session-stateful connections, a
//! [`FollowerReadExecutor`] wraps reads in follower-read, read-only
//! transactions and always restores the session before the connection goes
//! back, and [`QueryInstrumentation`] turns every statement into a span
//! plus an optional telemetry event.

pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod health;
pub mod hooks;
pub mod instrument;
pub mod pool;
pub mod postgres;
pub mod session;
pub mod settings;
#[cfg(feature = "telemetry")]
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod topology;
pub mod value;

pub use config::{HostAddr, Password, PoolConfiguration, PoolConfigurationBuilder, SslMode, TraceSettings};
pub use connection::{Connection, Connector};
pub use error::{DbError, DbResult, TelemetryError};
pub use executor::{FollowerReadExecutor, FollowerReadSession};
pub use health::{spawn_stats_logger, PoolHealthReporter};
pub use hooks::{ConnectionHooks, NoopHooks, SessionProbeHooks};
pub use instrument::{EventKind, MeterSink, NoopSink, QueryEvent, QueryInstrumentation, TelemetrySink};
pub use pool::{Pool, PoolBuilder, PoolStatistics, PooledConnection, ReadOnlyTransaction, WeakPool};
pub use postgres::PgConnector;
pub use session::SessionState;
pub use settings::{load_dotenv, DatabaseSettings, TracerSettings};
pub use topology::{parse_topology_keys, TopologyKey};
pub use value::{FromSqlValue, Row, SqlType, SqlValue, Statement};
