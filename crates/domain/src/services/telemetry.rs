use std::{env, net::SocketAddr};

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::hydrate_env_file;

static SUBSCRIBER_INSTALLED: OnceCell<()> = OnceCell::new();
static METRICS_INSTALLED: OnceCell<()> = OnceCell::new();

/// Shared observability options for binaries.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    log_filter: String,
    metrics_address: Option<String>,
}

impl TelemetryConfig {
    /// Loads telemetry knobs from optional environment variables prefixed with
    /// `<PREFIX>_`, e.g. `RELAY_LOG_FILTER`. Missing entries fall back to sane
    /// defaults so binaries do not require extra configuration to boot.
    pub fn from_env(prefix: &str) -> Self {
        let _ = hydrate_env_file();
        let upper = prefix.trim().to_ascii_uppercase();
        let log_key = format!("{}_LOG_FILTER", upper);
        let metrics_key = format!("{}_METRICS_ADDRESS", upper);

        let log_filter = env::var(log_key).unwrap_or_else(|_| "info".to_string());
        let metrics_address = env::var(metrics_key).ok().and_then(|value| {
            if value.trim().is_empty() {
                None
            } else {
                Some(value)
            }
        });

        Self {
            log_filter,
            metrics_address,
        }
    }

    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    pub fn metrics_address(&self) -> Option<&str> {
        self.metrics_address.as_deref()
    }
}

/// Centralized helper to wire up tracing + metrics exporters once per process.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    install_tracing(config)?;
    install_metrics(config)
}

fn install_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    if SUBSCRIBER_INSTALLED.get().is_some() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_new(config.log_filter())
        .map_err(|err| TelemetryError::InvalidLogFilter(err.to_string()))?;

    if SUBSCRIBER_INSTALLED.set(()).is_ok() {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
            .map_err(|err| TelemetryError::Tracing(err.to_string()))?;
    }

    Ok(())
}

fn install_metrics(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    // Without a scrape address the facade stays on its no-op recorder.
    let Some(addr) = config.metrics_address() else {
        debug!("metrics exporter disabled");
        return Ok(());
    };

    METRICS_INSTALLED.get_or_try_init(|| {
        let socket: SocketAddr = addr.parse().map_err(|err: std::net::AddrParseError| {
            TelemetryError::InvalidMetricsAddress(addr.to_string(), err.to_string())
        })?;
        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(socket)
            .build()
            .map_err(|err| TelemetryError::Metrics(err.to_string()))?;
        metrics::set_global_recorder(recorder)
            .map_err(|err| TelemetryError::Metrics(err.to_string()))?;
        tokio::spawn(async move {
            if let Err(err) = exporter.await {
                warn!(?err, "prometheus exporter stopped");
            }
        });
        describe_metrics();
        info!(%socket, "prometheus exporter listening");
        Ok(())
    })?;
    Ok(())
}

fn describe_metrics() {
    describe_counter!(
        "relay_notifications_total",
        "Runtime notifications seen by the listener, by result"
    );
    describe_counter!(
        "relay_connections_total",
        "Subscriber connection attempts, by result"
    );
    describe_counter!(
        "relay_deliveries_total",
        "Per-subscriber message deliveries, by result"
    );
    describe_counter!(
        "ledger_persist_ticks_total",
        "Ledger persistence ticks, by result"
    );
    describe_gauge!("relay_subscribers", "Currently registered subscribers");
    describe_gauge!("ledger_height", "Last persisted block height");
    describe_gauge!("ledger_header_height", "Block count announced by the node");
    describe_histogram!(
        "relay_broadcast_fanout",
        "Subscribers targeted by one broadcast"
    );
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    InvalidLogFilter(String),
    #[error("failed to install tracing subscriber: {0}")]
    Tracing(String),
    #[error("invalid metrics address `{0}`: {1}")]
    InvalidMetricsAddress(String, String),
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}
