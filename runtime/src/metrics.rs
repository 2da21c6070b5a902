//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the runtime components:
//! - Reply correlation (matches, timeouts, orphaned and malformed replies)
//! - Redelivery (attempts, handled failures, exhaustion, rollbacks)
//! - Pipeline execution (completed, failed, rolled back exchanges)
//!
//! # Example
//!
//! ```rust,no_run
//! use courier_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Metrics available at http://localhost:9090/metrics
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.serve()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Latency buckets (seconds) shared by every `*_seconds` histogram.
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The Prometheus exporter rejected its configuration
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// The HTTP scrape listener could not be installed
    #[error("Failed to install metrics exporter on {addr}: {reason}")]
    Install {
        /// Address the listener was meant to bind
        addr: SocketAddr,
        /// Exporter error
        reason: String,
    },
}

/// Prometheus metrics server.
///
/// [`start`](Self::start) installs a process-wide recorder. Metrics recorded
/// before that are dropped; recording without a server is always allowed.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server that will expose `/metrics` on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe every Courier metric and install the Prometheus recorder.
    ///
    /// Only one recorder can exist per process. If one is already installed
    /// (several servers in one test binary), this server reuses it and
    /// [`render`](Self::render) returns `None`.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Build`] if the exporter configuration is invalid.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(Matcher::Suffix("_seconds".to_string()), LATENCY_BUCKETS)
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build_recorder();
        let handle = recorder.handle();

        if metrics::set_global_recorder(recorder).is_ok() {
            tracing::info!(addr = %self.addr, "Metrics recorder installed");
            self.handle = Some(handle);
        } else {
            tracing::warn!(addr = %self.addr, "Metrics recorder already installed, reusing it");
        }
        Ok(())
    }

    /// Install the recorder together with an HTTP listener serving `/metrics`
    /// on the configured address. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if the listener cannot be installed
    /// (address in use, recorder already installed).
    pub fn serve(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(Matcher::Suffix("_seconds".to_string()), LATENCY_BUCKETS)
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .install()
            .map_err(|e| MetricsError::Install {
                addr: self.addr,
                reason: e.to_string(),
            })?;

        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        Ok(())
    }

    /// Handle to the installed recorder, if this server installed it.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Current metrics in Prometheus text format.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Correlation Metrics
    describe_gauge!(
        "courier_pending_requests",
        "Number of requests awaiting a reply"
    );
    describe_counter!(
        "courier_replies_matched_total",
        "Total number of replies matched to an outstanding request"
    );
    describe_counter!(
        "courier_replies_timed_out_total",
        "Total number of requests finalised by the timeout sweep"
    );
    describe_counter!(
        "courier_replies_early_total",
        "Total number of replies that arrived before their request was registered"
    );
    describe_counter!(
        "courier_replies_orphaned_total",
        "Total number of replies dropped because no request matched"
    );
    describe_counter!(
        "courier_replies_malformed_total",
        "Total number of replies dropped because they had no correlation id"
    );
    describe_histogram!(
        "courier_reply_latency_seconds",
        "Time between registering a request and resolving it"
    );

    // Redelivery Metrics
    describe_counter!(
        "courier_redeliveries_total",
        "Total number of redelivery attempts"
    );
    describe_counter!(
        "courier_failures_handled_total",
        "Total number of failures converted to a normal outcome"
    );
    describe_counter!(
        "courier_redelivery_exhausted_total",
        "Total number of failures propagated after redelivery was exhausted"
    );
    describe_counter!(
        "courier_rollbacks_total",
        "Total number of rollback outcomes"
    );

    // Pipeline Metrics
    describe_counter!(
        "courier_exchanges_completed_total",
        "Total number of exchanges that completed"
    );
    describe_counter!(
        "courier_exchanges_failed_total",
        "Total number of exchanges that ended with a failure"
    );
    describe_counter!(
        "courier_exchanges_rolled_back_total",
        "Total number of exchanges that ended rolled back"
    );
    describe_histogram!(
        "courier_exchange_duration_seconds",
        "Time taken to run an exchange through a pipeline"
    );
}

/// Reply correlation metrics recorder.
pub struct CorrelationMetrics;

impl CorrelationMetrics {
    /// Record the number of outstanding requests.
    pub fn record_pending(count: usize) {
        // Intentional cast for metrics - f64 represents all practical registry sizes exactly
        #[allow(clippy::cast_precision_loss)]
        let pending = count as f64;
        gauge!("courier_pending_requests").set(pending);
    }

    /// Record a matched reply.
    pub fn record_match(latency: Duration) {
        counter!("courier_replies_matched_total").increment(1);
        histogram!("courier_reply_latency_seconds").record(latency.as_secs_f64());
    }

    /// Record a request finalised by the sweep.
    pub fn record_timeout() {
        counter!("courier_replies_timed_out_total").increment(1);
    }

    /// Record a reply that arrived before its registration.
    pub fn record_early_reply() {
        counter!("courier_replies_early_total").increment(1);
    }

    /// Record a dropped reply with no matching request.
    pub fn record_orphan() {
        counter!("courier_replies_orphaned_total").increment(1);
    }

    /// Record a dropped reply without correlation id.
    pub fn record_malformed() {
        counter!("courier_replies_malformed_total").increment(1);
    }
}

/// Redelivery metrics recorder.
pub struct RedeliveryMetrics;

impl RedeliveryMetrics {
    /// Record a redelivery attempt.
    pub fn record_attempt() {
        counter!("courier_redeliveries_total").increment(1);
    }

    /// Record a handled failure.
    pub fn record_handled() {
        counter!("courier_failures_handled_total").increment(1);
    }

    /// Record exhausted redelivery.
    pub fn record_exhausted() {
        counter!("courier_redelivery_exhausted_total").increment(1);
    }

    /// Record a rollback.
    pub fn record_rollback() {
        counter!("courier_rollbacks_total").increment(1);
    }
}

/// Pipeline metrics recorder.
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Record a completed exchange.
    pub fn record_completed(duration: Duration) {
        counter!("courier_exchanges_completed_total").increment(1);
        histogram!("courier_exchange_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed exchange.
    pub fn record_failed(duration: Duration) {
        counter!("courier_exchanges_failed_total").increment(1);
        histogram!("courier_exchange_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a rolled back exchange.
    pub fn record_rolled_back(duration: Duration) {
        counter!("courier_exchanges_rolled_back_total").increment(1);
        histogram!("courier_exchange_duration_seconds").record(duration.as_secs_f64());
    }
}
