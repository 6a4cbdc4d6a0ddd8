//! Tracing and OpenTelemetry setup for services built on this crate.
//!
//! Console logging always goes through `tracing-subscriber`; with `otel`
//! set, spans and metrics are also exported over OTLP/gRPC. The providers
//! are handed back to the caller instead of being installed globally, so
//! the caller decides where the [`Meter`] goes and when to flush.
//!
//! Environment variables:
//!   RUST_LOG                          # Log filter (default: info)
//!   OTEL_EXPORTER_OTLP_ENDPOINT       # OTLP endpoint (default: http://localhost:4317)
//!   OTEL_SERVICE_NAME                 # Service name (default: location-service)
//!   OTEL_METRIC_POLL_INTERVAL         # Metric export interval (default: 15s)

use std::time::Duration;

use opentelemetry::metrics::{Meter, MeterProvider as _};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::TelemetryError;

const DEFAULT_ENDPOINT: &str = "http://localhost:4317";
const DEFAULT_SERVICE_NAME: &str = "location-service";
const DEFAULT_METRIC_INTERVAL: Duration = Duration::from_secs(15);

/// Tracing configuration options
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Debug level unless RUST_LOG says otherwise
    pub debug: bool,
    /// Export spans and metrics over OTLP
    pub otel: bool,
    pub endpoint: String,
    pub service_name: String,
    pub metric_interval: Duration,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            debug: false,
            otel: false,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            metric_interval: DEFAULT_METRIC_INTERVAL,
        }
    }
}

impl TracingConfig {
    /// Defaults overlaid with the `OTEL_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Ok(name) = std::env::var("OTEL_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Some(interval) = std::env::var("OTEL_METRIC_POLL_INTERVAL")
            .ok()
            .and_then(|raw| humantime::parse_duration(&raw).ok())
        {
            config.metric_interval = interval;
        }
        config
    }
}

/// Exporter pipelines created by [`init_tracing`]
pub struct TelemetryProviders {
    service_name: String,
    tracer: Option<TracerProvider>,
    meter: Option<SdkMeterProvider>,
}

impl TelemetryProviders {
    /// Meter for pool and query instruments.
    ///
    /// Without an exporter this is the global no-op meter.
    pub fn meter(&self) -> Meter {
        match &self.meter {
            Some(provider) => provider.meter("locsvc-db"),
            None => opentelemetry::global::meter("locsvc-db"),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Flush and stop both pipelines
    pub fn shutdown(self) -> Result<(), TelemetryError> {
        if let Some(tracer) = self.tracer {
            tracer
                .shutdown()
                .map_err(|e| TelemetryError::pipeline(format!("tracer shutdown: {e}")))?;
        }
        if let Some(meter) = self.meter {
            meter
                .shutdown()
                .map_err(|e| TelemetryError::pipeline(format!("meter shutdown: {e}")))?;
        }
        Ok(())
    }
}

fn env_filter(debug: bool) -> EnvFilter {
    let default = if debug { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber, and OTLP pipelines when `config.otel` is set
pub fn init_tracing(config: &TracingConfig) -> Result<TelemetryProviders, TelemetryError> {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(config.debug)
        .compact();

    if !config.otel {
        tracing_subscriber::registry()
            .with(env_filter(config.debug))
            .with(fmt_layer)
            .try_init()
            .map_err(|e| TelemetryError::pipeline(e.to_string()))?;
        return Ok(TelemetryProviders {
            service_name: config.service_name.clone(),
            tracer: None,
            meter: None,
        });
    }

    let resource = Resource::new(vec![KeyValue::new(
        "service.name",
        config.service_name.clone(),
    )]);

    let span_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.endpoint)
        .build()
        .map_err(|e| TelemetryError::pipeline(format!("Failed to create OTLP span exporter: {e}")))?;
    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(span_exporter, runtime::Tokio)
        .with_resource(resource.clone())
        .build();

    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&config.endpoint)
        .build()
        .map_err(|e| {
            TelemetryError::pipeline(format!("Failed to create OTLP metric exporter: {e}"))
        })?;
    let reader = PeriodicReader::builder(metric_exporter, runtime::Tokio)
        .with_interval(config.metric_interval)
        .build();
    let meter_provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    let tracer = tracer_provider.tracer(config.service_name.clone());
    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter(config.debug))
        .with(fmt_layer)
        .with(telemetry_layer)
        .try_init()
        .map_err(|e| TelemetryError::pipeline(e.to_string()))?;

    tracing::info!(
        endpoint = %config.endpoint,
        service = %config.service_name,
        "OpenTelemetry tracing initialized"
    );

    Ok(TelemetryProviders {
        service_name: config.service_name.clone(),
        tracer: Some(tracer_provider),
        meter: Some(meter_provider),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_console_only() {
        let config = TracingConfig::default();
        assert!(!config.otel);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.metric_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_console_only_providers_shut_down_cleanly() {
        let providers = TelemetryProviders {
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            tracer: None,
            meter: None,
        };
        let _meter = providers.meter();
        assert_eq!(providers.service_name(), DEFAULT_SERVICE_NAME);
        providers.shutdown().unwrap();
    }
}
