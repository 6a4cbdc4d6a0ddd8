//! Query instrumentation.
//!
//! Every statement, connection attempt and connection close runs inside a `tracing`
//! span named after the statement, parented to whatever span the caller is
//! in. When the future finishes, one [`QueryEvent`] goes to the configured
//! [`TelemetrySink`]. Sink failures are logged and dropped; they never fail
//! the database operation.
//!
//! "No rows" is an expected outcome and is not marked as a span error.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;
use tracing::field::{display, Empty};
use tracing::{info_span, warn, Instrument, Span};

use crate::config::{PoolConfiguration, TraceSettings};
use crate::error::{DbError, DbResult, TelemetryError};
use crate::value::{Row, SqlValue};

/// `db.system` attribute value
pub const DB_SYSTEM: &str = "yugabytedb";

/// Label used when a statement has no first token
pub const UNKNOWN_OPERATION: &str = "UNKNOWN";

const SPAN_NAME_PREFIX: &str = "query ";

/// Caller-supplied span naming function
pub type SpanNamer = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Connect,
    Query,
    Close,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Query => "query",
            Self::Close => "close",
        }
    }
}

/// One finished connect, query or close, as forwarded to the telemetry collector
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEvent {
    pub kind: EventKind,
    pub operation: String,
    pub duration: Duration,
    pub error: bool,
    pub sql_state: Option<String>,
    pub rows_affected: Option<u64>,
}

/// Destination for [`QueryEvent`]s. Must not block.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &QueryEvent) -> Result<(), TelemetryError>;
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl TelemetrySink for NoopSink {
    fn record(&self, _event: &QueryEvent) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Records events as OpenTelemetry instruments on an injected [`Meter`]
pub struct MeterSink {
    duration: Histogram<f64>,
    errors: Counter<u64>,
    rows_affected: Counter<u64>,
}

impl MeterSink {
    pub fn new(meter: &Meter) -> Self {
        Self {
            duration: meter
                .f64_histogram("db.client.operation.duration")
                .with_unit("s")
                .with_description("Duration of database connects and queries")
                .build(),
            errors: meter
                .u64_counter("db.client.operation.errors")
                .with_description("Failed database connects and queries")
                .build(),
            rows_affected: meter
                .u64_counter("db.client.rows_affected")
                .with_description("Rows affected by write statements")
                .build(),
        }
    }
}

impl fmt::Debug for MeterSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeterSink").finish_non_exhaustive()
    }
}

impl TelemetrySink for MeterSink {
    fn record(&self, event: &QueryEvent) -> Result<(), TelemetryError> {
        let mut attributes = vec![
            KeyValue::new("db.system", DB_SYSTEM),
            KeyValue::new("db.operation", event.operation.clone()),
            KeyValue::new("db.event", event.kind.as_str()),
        ];
        if let Some(code) = &event.sql_state {
            attributes.push(KeyValue::new("db.sql_state", code.clone()));
        }

        self.duration
            .record(event.duration.as_secs_f64(), &attributes);
        if event.error {
            self.errors.add(1, &attributes);
        }
        if let Some(rows) = event.rows_affected {
            self.rows_affected.add(rows, &attributes);
        }
        Ok(())
    }
}

/// Outcome types that can report an affected-row count
pub trait QueryOutcome {
    fn rows_affected(&self) -> Option<u64> {
        None
    }
}

impl QueryOutcome for u64 {
    fn rows_affected(&self) -> Option<u64> {
        Some(*self)
    }
}

impl QueryOutcome for () {}
impl QueryOutcome for Option<Row> {}
impl QueryOutcome for Vec<Row> {}

/// Wraps connects and queries in spans and telemetry events
#[derive(Clone)]
pub struct QueryInstrumentation {
    settings: TraceSettings,
    connection_string: String,
    sink: Arc<dyn TelemetrySink>,
    namer: Option<SpanNamer>,
}

impl fmt::Debug for QueryInstrumentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryInstrumentation")
            .field("settings", &self.settings)
            .field("connection_string", &self.connection_string)
            .field("custom_namer", &self.namer.is_some())
            .finish_non_exhaustive()
    }
}

impl QueryInstrumentation {
    /// Instrumentation configured from the pool's trace settings. The
    /// connection string recorded on spans has its password masked.
    pub fn new(config: &PoolConfiguration) -> Self {
        Self {
            settings: config.trace(),
            connection_string: config.redacted_url(),
            sink: Arc::new(NoopSink),
            namer: None,
        }
    }

    /// No spans, no events
    pub fn disabled() -> Self {
        Self {
            settings: TraceSettings {
                enabled: false,
                ..TraceSettings::default()
            },
            connection_string: String::new(),
            sink: Arc::new(NoopSink),
            namer: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Override span naming entirely
    pub fn with_span_namer(
        mut self,
        namer: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Self {
        self.namer = Some(Arc::new(namer));
        self
    }

    pub fn settings(&self) -> TraceSettings {
        self.settings
    }

    /// First token of the statement, uppercased; never empty
    pub fn operation_name(sql: &str) -> String {
        sql.split_whitespace()
            .next()
            .map(str::to_uppercase)
            .unwrap_or_else(|| UNKNOWN_OPERATION.to_string())
    }

    pub fn span_name(&self, sql: &str) -> String {
        if let Some(namer) = &self.namer {
            return namer(sql);
        }
        let base = if self.settings.trim_span_name {
            Self::operation_name(sql)
        } else {
            let trimmed = sql.trim();
            if trimmed.is_empty() {
                UNKNOWN_OPERATION.to_string()
            } else {
                trimmed.to_string()
            }
        };
        if self.settings.prefix_span_name {
            format!("{SPAN_NAME_PREFIX}{base}")
        } else {
            base
        }
    }

    /// Instrument one connection attempt
    pub async fn connect<F, T>(&self, fut: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        if !self.settings.enabled {
            return fut.await;
        }

        let span = info_span!(
            "db.connect",
            otel.name = "connect",
            otel.kind = "client",
            otel.status_code = Empty,
            db.system = DB_SYSTEM,
            db.connection_string = %self.connection_string,
            error.message = Empty,
        );
        let started = Instant::now();
        let result = fut.instrument(span.clone()).await;
        let (error, sql_state) = Self::record_error(&span, result.as_ref().err());

        self.emit(QueryEvent {
            kind: EventKind::Connect,
            operation: "CONNECT".to_string(),
            duration: started.elapsed(),
            error,
            sql_state,
            rows_affected: None,
        });
        result
    }

    /// Instrument closing the connection to `server`
    pub async fn close<F>(&self, server: &str, fut: F) -> DbResult<()>
    where
        F: Future<Output = DbResult<()>>,
    {
        if !self.settings.enabled {
            return fut.await;
        }

        let span = info_span!(
            "db.close",
            otel.name = "close",
            otel.kind = "client",
            otel.status_code = Empty,
            db.system = DB_SYSTEM,
            server.address = %server,
            error.message = Empty,
        );
        let started = Instant::now();
        let result = fut.instrument(span.clone()).await;
        let (error, sql_state) = Self::record_error(&span, result.as_ref().err());

        self.emit(QueryEvent {
            kind: EventKind::Close,
            operation: "CLOSE".to_string(),
            duration: started.elapsed(),
            error,
            sql_state,
            rows_affected: None,
        });
        result
    }

    /// Instrument one statement against `server`
    pub async fn query<F, T>(
        &self,
        sql: &str,
        params: &[SqlValue],
        server: &str,
        fut: F,
    ) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
        T: QueryOutcome,
    {
        if !self.settings.enabled {
            return fut.await;
        }

        let operation = Self::operation_name(sql);
        let span = info_span!(
            "db.query",
            otel.name = %self.span_name(sql),
            otel.kind = "client",
            otel.status_code = Empty,
            db.system = DB_SYSTEM,
            db.operation = %operation,
            db.statement = Empty,
            db.query.parameters = Empty,
            db.rows_affected = Empty,
            db.sql_state = Empty,
            server.address = %server,
            error.message = Empty,
        );
        if self.settings.include_statement {
            span.record("db.statement", sql);
            if self.settings.include_params && !params.is_empty() {
                span.record("db.query.parameters", display(render_params(params)));
            }
        }

        let started = Instant::now();
        let result = fut.instrument(span.clone()).await;
        let rows_affected = result.as_ref().ok().and_then(QueryOutcome::rows_affected);
        if let Some(rows) = rows_affected {
            span.record("db.rows_affected", rows);
        }
        let (error, sql_state) = Self::record_error(&span, result.as_ref().err());

        self.emit(QueryEvent {
            kind: EventKind::Query,
            operation,
            duration: started.elapsed(),
            error,
            sql_state,
            rows_affected,
        });
        result
    }

    fn record_error(span: &Span, err: Option<&DbError>) -> (bool, Option<String>) {
        match err {
            Some(err) if err.is_reportable() => {
                span.record("otel.status_code", "ERROR");
                span.record("error.message", display(err));
                let sql_state = err.sql_state().map(str::to_owned);
                if let Some(code) = &sql_state {
                    span.record("db.sql_state", code.as_str());
                }
                (true, sql_state)
            }
            _ => (false, None),
        }
    }

    fn emit(&self, event: QueryEvent) {
        if let Err(err) = self.sink.record(&event) {
            warn!(error = %err, operation = %event.operation, "dropping telemetry event");
        }
    }
}

fn render_params(params: &[SqlValue]) -> String {
    let rendered: Vec<String> = params.iter().map(ToString::to_string).collect();
    format!("[{}]", rendered.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<QueryEvent>>,
    }

    impl TelemetrySink for RecordingSink {
        fn record(&self, event: &QueryEvent) -> Result<(), TelemetryError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct FailingSink;

    impl TelemetrySink for FailingSink {
        fn record(&self, _event: &QueryEvent) -> Result<(), TelemetryError> {
            Err(TelemetryError::rejected("collector unavailable"))
        }
    }

    fn instrumentation(trace: TraceSettings) -> QueryInstrumentation {
        let config = PoolConfiguration::builder().trace(trace).build().unwrap();
        QueryInstrumentation::new(&config)
    }

    #[test]
    fn test_operation_name() {
        assert_eq!(QueryInstrumentation::operation_name("SELECT 1"), "SELECT");
        assert_eq!(
            QueryInstrumentation::operation_name("  with recent as (select 1) select *"),
            "WITH"
        );
        assert_eq!(QueryInstrumentation::operation_name(""), UNKNOWN_OPERATION);
        assert_eq!(QueryInstrumentation::operation_name(" \n\t "), UNKNOWN_OPERATION);
    }

    #[test]
    fn test_span_name_variants() {
        let trimmed = instrumentation(TraceSettings::default());
        assert_eq!(trimmed.span_name("select * from location"), "query SELECT");

        let full = instrumentation(TraceSettings {
            trim_span_name: false,
            prefix_span_name: false,
            ..TraceSettings::default()
        });
        assert_eq!(full.span_name(" SELECT 1 "), "SELECT 1");
        assert_eq!(full.span_name("   "), UNKNOWN_OPERATION);

        let custom = trimmed.with_span_namer(|sql| format!("custom:{}", sql.len()));
        assert_eq!(custom.span_name("SELECT 1"), "custom:8");
    }

    #[tokio::test]
    async fn test_query_event_carries_rows_affected() {
        let sink = Arc::new(RecordingSink::default());
        let inst = instrumentation(TraceSettings::default()).with_sink(sink.clone());

        let rows = inst
            .query("UPDATE location SET name = $1", &[], "h1:5433", async {
                Ok::<u64, DbError>(3)
            })
            .await
            .unwrap();
        assert_eq!(rows, 3);

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Query);
        assert_eq!(events[0].operation, "UPDATE");
        assert_eq!(events[0].rows_affected, Some(3));
        assert!(!events[0].error);
    }

    #[tokio::test]
    async fn test_not_found_is_not_an_error_event() {
        let sink = Arc::new(RecordingSink::default());
        let inst = instrumentation(TraceSettings::default()).with_sink(sink.clone());

        let result: DbResult<Option<Row>> = inst
            .query("SELECT 1", &[], "h1:5433", async {
                Err(DbError::not_found("location", "x"))
            })
            .await;
        assert!(result.unwrap_err().is_not_found());

        let result: DbResult<Option<Row>> = inst
            .query("SELEC 1", &[], "h1:5433", async {
                Err(DbError::execution("syntax error", Some("42601".into())))
            })
            .await;
        assert!(result.is_err());

        let events = sink.events.lock().unwrap();
        assert!(!events[0].error);
        assert!(events[1].error);
        assert_eq!(events[1].sql_state.as_deref(), Some("42601"));
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_fail_query() {
        let inst = instrumentation(TraceSettings::default()).with_sink(Arc::new(FailingSink));
        let out = inst
            .query("SELECT 1", &[], "h1:5433", async { Ok::<Vec<Row>, DbError>(vec![]) })
            .await;
        assert!(out.is_ok());

        let connected = inst.connect(async { Ok::<(), DbError>(()) }).await;
        assert!(connected.is_ok());
    }

    #[tokio::test]
    async fn test_close_emits_close_event() {
        let sink = Arc::new(RecordingSink::default());
        let inst = instrumentation(TraceSettings::default()).with_sink(sink.clone());

        inst.close("h1:5433", async { Ok::<(), DbError>(()) })
            .await
            .unwrap();
        let failed = inst
            .close("h2:5433", async { Err(DbError::connection("reset by peer")) })
            .await;
        assert!(failed.is_err());

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::Close);
        assert_eq!(events[0].operation, "CLOSE");
        assert!(!events[0].error);
        assert!(events[1].error);
    }

    #[tokio::test]
    async fn test_disabled_emits_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let inst = QueryInstrumentation::disabled().with_sink(sink.clone());
        inst.query("SELECT 1", &[], "h", async { Ok::<(), DbError>(()) })
            .await
            .unwrap();
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_params_rendering() {
        let rendered = render_params(&[SqlValue::from("HQ"), SqlValue::from(2_i64)]);
        assert_eq!(rendered, r#"["HQ", 2]"#);
    }

    proptest! {
        #[test]
        fn prop_operation_name_never_empty(sql in "\\PC*") {
            let name = QueryInstrumentation::operation_name(&sql);
            prop_assert!(!name.is_empty());
            prop_assert!(!name.chars().any(char::is_whitespace));
        }

        #[test]
        fn prop_operation_name_is_uppercased_first_token(
            token in "[a-zA-Z]{1,12}",
            rest in "[ a-z0-9*]{0,30}",
        ) {
            let sql = format!("  {token} {rest}");
            prop_assert_eq!(QueryInstrumentation::operation_name(&sql), token.to_uppercase());
        }
    }
}
