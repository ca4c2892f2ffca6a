//! Prometheus metrics for the consumer runtime.
//!
//! Counters are recorded through the `metrics` facade, so they are free when no
//! recorder is installed (tests, embedding). The service installs the Prometheus
//! exporter only when a metrics address is configured.
//!
//! # Example
//!
//! ```rust,no_run
//! use kafka_consumer_runtime::metrics::install_exporter;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! install_exporter("0.0.0.0:9090".parse()?)?;
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use thiserror::Error;

/// Messages whose handler returned `Ok`
pub const MESSAGES_HANDLED: &str = "consumer_messages_handled_total";
/// Messages whose handler returned an error
pub const MESSAGES_FAILED: &str = "consumer_messages_failed_total";
/// Offsets successfully committed
pub const OFFSETS_COMMITTED: &str = "consumer_offsets_committed_total";
/// Offset commits rejected by the broker
pub const COMMIT_FAILURES: &str = "consumer_commit_failures_total";
/// Broker poll errors (each one followed by a backoff)
pub const POLL_ERRORS: &str = "consumer_poll_errors_total";
/// Shutdown signals received, including repeated deliveries
pub const SHUTDOWN_SIGNALS: &str = "shutdown_signals_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build or install the Prometheus exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Install the Prometheus exporter with an HTTP listener on `addr`.
///
/// Must be called from within a tokio runtime, at most once per process.
///
/// # Errors
///
/// Returns [`MetricsError::Install`] if a recorder is already installed or the
/// listener cannot be set up.
pub fn install_exporter(addr: SocketAddr) -> Result<(), MetricsError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    register_metrics();

    tracing::info!(
        addr = %addr,
        "Metrics exporter started - available at http://{}/metrics",
        addr
    );
    Ok(())
}

/// Register all metric descriptions.
fn register_metrics() {
    describe_counter!(
        MESSAGES_HANDLED,
        "Total number of messages successfully handled"
    );
    describe_counter!(
        MESSAGES_FAILED,
        "Total number of messages whose handler returned an error"
    );
    describe_counter!(OFFSETS_COMMITTED, "Total number of offsets committed");
    describe_counter!(
        COMMIT_FAILURES,
        "Total number of offset commits rejected by the broker"
    );
    describe_counter!(POLL_ERRORS, "Total number of broker poll errors");
    describe_counter!(
        SHUTDOWN_SIGNALS,
        "Total number of shutdown signals received"
    );
}
