//! Service-level database settings.
//!
//! Settings come from the process environment (optionally seeded from a
//! `.env` file) or from a TOML file. Either way they end up as a
//! [`PoolConfigurationBuilder`], which does the validation.
//!
//! Unset variables keep their defaults. A variable that is set but cannot
//! be parsed is a [`DbError::Configuration`], never a silent fallback.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{
    parse_bool, parse_human, parse_millis_or_human, parse_number, Password,
    PoolConfigurationBuilder, TraceSettings,
};
use crate::error::{DbError, DbResult};

/// Load `.env` from the working directory, if there is one.
///
/// Variables already present in the environment win over the file.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => info!("Loaded .env from {}", path.display()),
        Err(e) if e.not_found() => debug!("No .env file found; using environment variables only"),
        Err(e) => debug!("Failed to load .env: {}", e),
    }
}

/// Query tracing switches, mirroring [`TraceSettings`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TracerSettings {
    pub enabled: bool,
    pub log_sql_statement: bool,
    pub include_params: bool,
    pub prefix_query_span_name: bool,
    pub trim_query_span_name: bool,
}

impl Default for TracerSettings {
    fn default() -> Self {
        let trace = TraceSettings::default();
        Self {
            enabled: trace.enabled,
            log_sql_statement: trace.include_statement,
            include_params: trace.include_params,
            prefix_query_span_name: trace.prefix_span_name,
            trim_query_span_name: trace.trim_span_name,
        }
    }
}

impl From<&TracerSettings> for TraceSettings {
    fn from(settings: &TracerSettings) -> Self {
        Self {
            enabled: settings.enabled,
            include_statement: settings.log_sql_statement,
            include_params: settings.include_params,
            prefix_span_name: settings.prefix_query_span_name,
            trim_span_name: settings.trim_query_span_name,
        }
    }
}

/// Flat database settings as an operator writes them
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: Password,
    /// Comma-separated `host[:port]` list
    pub hostname: String,
    pub database: String,
    pub ssl_mode: String,
    pub application_name: String,
    pub load_balance: bool,
    /// Comma-separated `cloud.region.zone[:priority]` list
    pub topology_keys: String,
    pub max_connections: u32,
    pub min_connections: u32,
    #[serde(with = "humantime_serde")]
    pub max_connection_lifetime: Duration,
    #[serde(with = "humantime_serde")]
    pub max_connection_lifetime_jitter: Duration,
    #[serde(with = "humantime_serde")]
    pub health_check_period: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    #[serde(with = "humantime_serde::option")]
    pub statement_timeout: Option<Duration>,
    pub follower_reads: bool,
    pub tracing: TracerSettings,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let defaults = PoolConfigurationBuilder::default();
        Self {
            username: defaults.user,
            password: Password::default(),
            hostname: defaults.hosts,
            database: defaults.database,
            ssl_mode: defaults.ssl_mode,
            application_name: defaults.application_name,
            load_balance: defaults.load_balance,
            topology_keys: defaults.topology_keys,
            max_connections: defaults.max_connections,
            min_connections: defaults.min_connections,
            max_connection_lifetime: defaults.max_connection_lifetime,
            max_connection_lifetime_jitter: defaults.max_connection_lifetime_jitter,
            health_check_period: defaults.health_check_period,
            connect_timeout: defaults.connect_timeout,
            acquire_timeout: defaults.acquire_timeout,
            statement_timeout: defaults.statement_timeout,
            follower_reads: defaults.follower_reads,
            tracing: TracerSettings::default(),
        }
    }
}

impl DatabaseSettings {
    /// Read settings from the process environment
    pub fn from_env() -> DbResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, which returns the raw value of a
    /// variable or `None` when it is unset
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DbResult<Self> {
        let mut settings = Self::default();
        let env = Env(&lookup);

        env.string("DB_USERNAME", &mut settings.username);
        if let Some(password) = lookup("DB_PASSWORD") {
            settings.password = Password::from(password);
        }
        env.string("DB_HOSTNAME", &mut settings.hostname);
        env.string("DB_DATABASE", &mut settings.database);
        env.string("DB_SSL_MODE", &mut settings.ssl_mode);
        env.string("DB_APPLICATION_NAME", &mut settings.application_name);
        env.parsed("DB_YSQL_LOAD_BALANCE", &mut settings.load_balance, parse_bool)?;
        env.string("DB_YSQL_TOPOLOGY_KEYS", &mut settings.topology_keys);
        env.parsed("DB_MAX_CONNS", &mut settings.max_connections, parse_number)?;
        env.parsed("DB_MIN_CONNS", &mut settings.min_connections, parse_number)?;
        env.parsed("DB_MAX_CONN_LIFETIME", &mut settings.max_connection_lifetime, parse_human)?;
        env.parsed(
            "DB_MAX_CONN_LIFETIME_JITTER",
            &mut settings.max_connection_lifetime_jitter,
            parse_human,
        )?;
        env.parsed("DB_HEALTH_CHECK_PERIOD", &mut settings.health_check_period, parse_human)?;
        env.parsed("DB_CONNECT_TIMEOUT", &mut settings.connect_timeout, parse_human)?;
        env.parsed("DB_ACQUIRE_TIMEOUT", &mut settings.acquire_timeout, parse_human)?;
        if let Some(raw) = lookup("DB_STATEMENT_TIMEOUT") {
            // empty or zero disables the server-side timeout
            settings.statement_timeout = if raw.trim().is_empty() {
                None
            } else {
                Some(parse_millis_or_human("DB_STATEMENT_TIMEOUT", &raw)?).filter(|t| !t.is_zero())
            };
        }
        env.parsed("DB_FOLLOWER_READS", &mut settings.follower_reads, parse_bool)?;

        let tracer = &mut settings.tracing;
        env.parsed("OTEL_TRACER_ENABLE", &mut tracer.enabled, parse_bool)?;
        env.parsed("OTEL_TRACER_LOG_SQL_STMT", &mut tracer.log_sql_statement, parse_bool)?;
        env.parsed("OTEL_TRACER_INCLUDE_PARAMS", &mut tracer.include_params, parse_bool)?;
        env.parsed("OTEL_PREFIX_QUERY_SPAN_NAME", &mut tracer.prefix_query_span_name, parse_bool)?;
        env.parsed("OTEL_TRIM_QUERY_SPAN_NAME", &mut tracer.trim_query_span_name, parse_bool)?;

        Ok(settings)
    }

    /// Parse settings from a TOML document; missing keys keep defaults
    pub fn from_toml_str(raw: &str) -> DbResult<Self> {
        toml::from_str(raw)
            .map_err(|e| DbError::configuration(format!("invalid database settings: {e}")))
    }

    /// Read settings from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DbError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "loaded database settings file");
        Self::from_toml_str(&raw)
    }

    /// Hand the settings to the pool configuration builder for validation
    pub fn into_builder(self) -> PoolConfigurationBuilder {
        let trace = TraceSettings::from(&self.tracing);
        PoolConfigurationBuilder::new()
            .user(self.username)
            .password(self.password.expose().to_string())
            .hosts(self.hostname)
            .database(self.database)
            .ssl_mode(self.ssl_mode)
            .application_name(self.application_name)
            .load_balance(self.load_balance)
            .topology_keys(self.topology_keys)
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .max_connection_lifetime(self.max_connection_lifetime)
            .max_connection_lifetime_jitter(self.max_connection_lifetime_jitter)
            .health_check_period(self.health_check_period)
            .connect_timeout(self.connect_timeout)
            .acquire_timeout(self.acquire_timeout)
            .statement_timeout(self.statement_timeout)
            .follower_reads(self.follower_reads)
            .trace(trace)
    }
}

struct Env<'a, F>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str, target: &mut String) {
        if let Some(value) = (self.0)(key) {
            *target = value;
        }
    }

    fn parsed<T>(
        &self,
        key: &str,
        target: &mut T,
        parse: impl Fn(&str, &str) -> DbResult<T>,
    ) -> DbResult<()> {
        if let Some(value) = (self.0)(key) {
            *target = parse(key, &value)?;
        }
        Ok(())
    }
}
