//! Pool configuration: an immutable, validated parameter set.
//!
//! [`PoolConfigurationBuilder`] is pure: it parses and validates but never
//! touches the network. All I/O is deferred to the [`Pool`](crate::Pool).

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::error::{DbError, DbResult};
use crate::topology::{parse_topology_keys, render_topology_keys, TopologyKey};

/// Default YSQL port
pub const DEFAULT_PORT: u16 = 5433;

const DEFAULT_HOSTS: &str = "127.0.0.1:5433,127.0.0.2:5433,127.0.0.3:5433";
const DEFAULT_TOPOLOGY_KEYS: &str = "gcp.us-east1.*:1,gcp.us-central1.*:2,gcp.us-west1.*:3";
const PASSWORD_MASK: &str = "*****";

static URL_PASSWORD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(postgres(?:ql)?://[^:/@]+:)([^@]+)(@.+)").expect("valid password regex")
});

/// Mask the password component of a `postgres://` URL
pub fn redact_password(url: &str) -> Cow<'_, str> {
    URL_PASSWORD.replace(url, format!("${{1}}{PASSWORD_MASK}${{3}}"))
}

/// TLS negotiation mode, as understood by libpq-style drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    #[default]
    Disable,
    Allow,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Allow => "allow",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }
}

impl FromStr for SslMode {
    type Err = DbError;

    fn from_str(s: &str) -> DbResult<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disable" => Ok(Self::Disable),
            "allow" => Ok(Self::Allow),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            "verify-ca" => Ok(Self::VerifyCa),
            "verify-full" => Ok(Self::VerifyFull),
            other => Err(DbError::configuration(format!("unknown sslmode '{other}'"))),
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `host[:port]` entry of the host list
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostAddr {
    pub host: String,
    pub port: u16,
}

impl HostAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for HostAddr {
    type Err = DbError;

    fn from_str(raw: &str) -> DbResult<Self> {
        let raw = raw.trim();
        let bad = |reason: &str| DbError::configuration(format!("host '{raw}': {reason}"));

        // [v6]:port
        let (host, port) = if let Some(rest) = raw.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(|| bad("unclosed '['"))?;
            match tail.strip_prefix(':') {
                Some(port) => (host, Some(port)),
                None if tail.is_empty() => (host, None),
                None => return Err(bad("unexpected text after ']'")),
            }
        } else {
            match raw.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (raw, None),
            }
        };

        if host.is_empty() {
            return Err(bad("empty host name"));
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| bad("invalid port"))?,
            None => DEFAULT_PORT,
        };
        if port == 0 {
            return Err(bad("port must be non-zero"));
        }

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse a comma-separated host list
pub fn parse_host_list(raw: &str) -> DbResult<Vec<HostAddr>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(HostAddr::from_str)
        .collect()
}

/// Password that never shows up in `Debug` output
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl From<String> for Password {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

impl Password {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(PASSWORD_MASK)
    }
}

/// Query tracing toggles.
///
/// Parameter values may carry personal data, so `include_params` defaults
/// to off and must be switched on explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceSettings {
    /// Emit query/connect spans and telemetry events at all
    pub enabled: bool,
    /// Attach the literal statement text to query spans
    pub include_statement: bool,
    /// Attach bound parameter values (requires `include_statement`)
    pub include_params: bool,
    /// Prefix span names with `"query "`
    pub prefix_span_name: bool,
    /// Name spans by operation (`SELECT`) instead of the full statement
    pub trim_span_name: bool,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            include_statement: true,
            include_params: false,
            prefix_span_name: true,
            trim_span_name: true,
        }
    }
}

/// Immutable, validated pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfiguration {
    user: String,
    password: Password,
    hosts: Vec<HostAddr>,
    database: String,
    ssl_mode: SslMode,
    application_name: String,
    load_balance: bool,
    topology_keys: Vec<TopologyKey>,
    max_connections: u32,
    min_connections: u32,
    max_connection_lifetime: Duration,
    max_connection_lifetime_jitter: Duration,
    health_check_period: Duration,
    connect_timeout: Duration,
    acquire_timeout: Duration,
    statement_timeout: Option<Duration>,
    follower_reads: bool,
    trace: TraceSettings,
}

impl PoolConfiguration {
    pub fn builder() -> PoolConfigurationBuilder {
        PoolConfigurationBuilder::new()
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn password(&self) -> &str {
        self.password.expose()
    }

    pub fn hosts(&self) -> &[HostAddr] {
        &self.hosts
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn ssl_mode(&self) -> SslMode {
        self.ssl_mode
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    pub fn load_balance(&self) -> bool {
        self.load_balance
    }

    /// Ordered follower-read topology hint
    pub fn topology_keys(&self) -> &[TopologyKey] {
        &self.topology_keys
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    pub fn min_connections(&self) -> u32 {
        self.min_connections
    }

    pub fn max_connection_lifetime(&self) -> Duration {
        self.max_connection_lifetime
    }

    pub fn max_connection_lifetime_jitter(&self) -> Duration {
        self.max_connection_lifetime_jitter
    }

    pub fn health_check_period(&self) -> Duration {
        self.health_check_period
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Default deadline for `Pool::acquire`
    pub fn acquire_timeout(&self) -> Duration {
        self.acquire_timeout
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout
    }

    /// Whether single-row reads are routed through follower replicas
    pub fn follower_reads(&self) -> bool {
        self.follower_reads
    }

    pub fn trace(&self) -> TraceSettings {
        self.trace
    }

    /// Connection URL in the driver's option format
    pub fn connection_url(&self) -> String {
        self.render_url(&urlencoding::encode(self.password.expose()))
    }

    /// Connection URL with the password masked, safe for logs and spans
    pub fn redacted_url(&self) -> String {
        self.render_url(PASSWORD_MASK)
    }

    fn render_url(&self, password: &str) -> String {
        let hosts = self
            .hosts
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut options = vec![
            format!("sslmode={}", self.ssl_mode),
            format!("load_balance={}", self.load_balance),
        ];
        if !self.topology_keys.is_empty() {
            options.push(format!(
                "topology_keys={}",
                render_topology_keys(&self.topology_keys)
            ));
        }
        if let Some(timeout) = self.statement_timeout {
            options.push(format!("statement_timeout={}", timeout.as_millis()));
        }

        let credentials = if password.is_empty() {
            urlencoding::encode(&self.user).into_owned()
        } else {
            format!("{}:{}", urlencoding::encode(&self.user), password)
        };

        format!(
            "postgres://{credentials}@{hosts}/{}?{}",
            urlencoding::encode(&self.database),
            options.join("&")
        )
    }
}

/// Builder for [`PoolConfiguration`], pre-populated with service defaults
#[derive(Debug, Clone)]
pub struct PoolConfigurationBuilder {
    pub(crate) user: String,
    pub(crate) password: Password,
    pub(crate) hosts: String,
    pub(crate) database: String,
    pub(crate) ssl_mode: String,
    pub(crate) application_name: String,
    pub(crate) load_balance: bool,
    pub(crate) topology_keys: String,
    pub(crate) max_connections: u32,
    pub(crate) min_connections: u32,
    pub(crate) max_connection_lifetime: Duration,
    pub(crate) max_connection_lifetime_jitter: Duration,
    pub(crate) health_check_period: Duration,
    pub(crate) connect_timeout: Duration,
    pub(crate) acquire_timeout: Duration,
    pub(crate) statement_timeout: Option<Duration>,
    pub(crate) follower_reads: bool,
    pub(crate) trace: TraceSettings,
}

impl Default for PoolConfigurationBuilder {
    fn default() -> Self {
        Self {
            user: "yugabyte".to_string(),
            password: Password::default(),
            hosts: DEFAULT_HOSTS.to_string(),
            database: "yugabyte".to_string(),
            ssl_mode: SslMode::Disable.as_str().to_string(),
            application_name: "location-service".to_string(),
            load_balance: true,
            topology_keys: DEFAULT_TOPOLOGY_KEYS.to_string(),
            max_connections: 10,
            min_connections: 10,
            max_connection_lifetime: Duration::from_secs(4 * 60 * 60),
            max_connection_lifetime_jitter: Duration::from_secs(15 * 60),
            health_check_period: Duration::from_secs(10 * 60),
            connect_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(5),
            statement_timeout: None,
            follower_reads: true,
            trace: TraceSettings::default(),
        }
    }
}

impl PoolConfigurationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a multi-host connection URL:
    ///
    /// `postgres://user:pass@h1:5433,h2:5433/db?sslmode=disable&load_balance=true&topology_keys=...`
    ///
    /// Pool sizing options (`pool_max_conns`, `pool_min_conns`,
    /// `pool_max_conn_lifetime`, `pool_max_conn_lifetime_jitter`,
    /// `pool_health_check_period`) are accepted alongside driver options.
    pub fn from_url(url: &str) -> DbResult<Self> {
        let bad = |reason: String| {
            DbError::configuration(format!("connection url '{}': {reason}", redact_password(url)))
        };

        let rest = url
            .strip_prefix("postgres://")
            .or_else(|| url.strip_prefix("postgresql://"))
            .ok_or_else(|| bad("scheme must be postgres:// or postgresql://".to_string()))?;

        let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
        let (database, query) = path.split_once('?').unwrap_or((path, ""));

        let mut builder = Self::new();

        let hosts = match authority.rsplit_once('@') {
            Some((userinfo, hosts)) => {
                let (user, password) = userinfo.split_once(':').unwrap_or((userinfo, ""));
                builder.user = decode(user).map_err(&bad)?;
                builder.password = Password(decode(password).map_err(&bad)?);
                hosts
            }
            None => authority,
        };
        if hosts.is_empty() {
            return Err(bad("missing host list".to_string()));
        }
        builder.hosts = hosts.to_string();

        if !database.is_empty() {
            builder.database = decode(database).map_err(&bad)?;
        }

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| bad(format!("option '{pair}' has no value")))?;
            let value = decode(value).map_err(&bad)?;
            builder.apply_option(key, &value).map_err(|e| match e {
                DbError::Configuration { reason } => bad(reason),
                other => other,
            })?;
        }

        Ok(builder)
    }

    fn apply_option(&mut self, key: &str, value: &str) -> DbResult<()> {
        match key {
            "sslmode" => self.ssl_mode = value.to_string(),
            "load_balance" => self.load_balance = parse_bool(key, value)?,
            "topology_keys" => self.topology_keys = value.to_string(),
            "application_name" => self.application_name = value.to_string(),
            "statement_timeout" => self.statement_timeout = Some(parse_millis_or_human(key, value)?),
            "connect_timeout" => {
                // libpq semantics: whole seconds
                let secs: u64 = value.parse().map_err(|_| {
                    DbError::configuration(format!("connect_timeout '{value}' is not a number"))
                })?;
                self.connect_timeout = Duration::from_secs(secs);
            }
            "pool_max_conns" => self.max_connections = parse_number(key, value)?,
            "pool_min_conns" => self.min_connections = parse_number(key, value)?,
            "pool_max_conn_lifetime" => self.max_connection_lifetime = parse_human(key, value)?,
            "pool_max_conn_lifetime_jitter" => {
                self.max_connection_lifetime_jitter = parse_human(key, value)?
            }
            "pool_health_check_period" => self.health_check_period = parse_human(key, value)?,
            other => {
                return Err(DbError::configuration(format!(
                    "unsupported connection option '{other}'"
                )))
            }
        }
        Ok(())
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Password(password.into());
        self
    }

    /// Comma-separated `host[:port]` list
    pub fn hosts(mut self, hosts: impl Into<String>) -> Self {
        self.hosts = hosts.into();
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn ssl_mode(mut self, mode: impl Into<String>) -> Self {
        self.ssl_mode = mode.into();
        self
    }

    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = name.into();
        self
    }

    pub fn load_balance(mut self, enabled: bool) -> Self {
        self.load_balance = enabled;
        self
    }

    /// Comma-separated `cloud.region.zone:priority` list
    pub fn topology_keys(mut self, keys: impl Into<String>) -> Self {
        self.topology_keys = keys.into();
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn max_connection_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_connection_lifetime = lifetime;
        self
    }

    pub fn max_connection_lifetime_jitter(mut self, jitter: Duration) -> Self {
        self.max_connection_lifetime_jitter = jitter;
        self
    }

    pub fn health_check_period(mut self, period: Duration) -> Self {
        self.health_check_period = period;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn statement_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn follower_reads(mut self, enabled: bool) -> Self {
        self.follower_reads = enabled;
        self
    }

    pub fn trace(mut self, trace: TraceSettings) -> Self {
        self.trace = trace;
        self
    }

    /// Validate and freeze the configuration
    pub fn build(self) -> DbResult<PoolConfiguration> {
        if self.user.trim().is_empty() {
            return Err(DbError::configuration("user must not be empty"));
        }
        if self.database.trim().is_empty() {
            return Err(DbError::configuration("database must not be empty"));
        }

        let hosts = parse_host_list(&self.hosts)?;
        if hosts.is_empty() {
            return Err(DbError::configuration("host list must not be empty"));
        }

        let ssl_mode: SslMode = self.ssl_mode.parse()?;
        let topology_keys = parse_topology_keys(&self.topology_keys)?;

        if self.max_connections == 0 {
            return Err(DbError::configuration("max_connections must be at least 1"));
        }
        if self.min_connections > self.max_connections {
            return Err(DbError::configuration(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.max_connection_lifetime.is_zero() {
            return Err(DbError::configuration("max_connection_lifetime must be positive"));
        }
        if self.max_connection_lifetime_jitter > self.max_connection_lifetime {
            return Err(DbError::configuration(format!(
                "lifetime jitter ({:?}) exceeds max_connection_lifetime ({:?})",
                self.max_connection_lifetime_jitter, self.max_connection_lifetime
            )));
        }
        for (name, value) in [
            ("health_check_period", self.health_check_period),
            ("connect_timeout", self.connect_timeout),
            ("acquire_timeout", self.acquire_timeout),
        ] {
            if value.is_zero() {
                return Err(DbError::configuration(format!("{name} must be positive")));
            }
        }
        if matches!(self.statement_timeout, Some(t) if t.as_millis() == 0) {
            return Err(DbError::configuration(
                "statement_timeout must be at least 1ms when set",
            ));
        }

        Ok(PoolConfiguration {
            user: self.user,
            password: self.password,
            hosts,
            database: self.database,
            ssl_mode,
            application_name: self.application_name,
            load_balance: self.load_balance,
            topology_keys,
            max_connections: self.max_connections,
            min_connections: self.min_connections,
            max_connection_lifetime: self.max_connection_lifetime,
            max_connection_lifetime_jitter: self.max_connection_lifetime_jitter,
            health_check_period: self.health_check_period,
            connect_timeout: self.connect_timeout,
            acquire_timeout: self.acquire_timeout,
            statement_timeout: self.statement_timeout,
            follower_reads: self.follower_reads,
            trace: self.trace,
        })
    }
}

fn decode(raw: &str) -> Result<String, String> {
    urlencoding::decode(raw)
        .map(Cow::into_owned)
        .map_err(|e| format!("invalid percent-encoding: {e}"))
}

pub(crate) fn parse_bool(key: &str, value: &str) -> DbResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(DbError::configuration(format!(
            "{key}: '{value}' is not a boolean"
        ))),
    }
}

pub(crate) fn parse_number<T: FromStr>(key: &str, value: &str) -> DbResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DbError::configuration(format!("{key}: '{value}' is not a valid number")))
}

pub(crate) fn parse_human(key: &str, value: &str) -> DbResult<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| DbError::configuration(format!("{key}: '{value}' is not a duration ({e})")))
}

/// Bare numbers are milliseconds (Postgres convention), otherwise humantime
pub(crate) fn parse_millis_or_human(key: &str, value: &str) -> DbResult<Duration> {
    match value.trim().parse::<u64>() {
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(_) => parse_human(key, value),
    }
}
