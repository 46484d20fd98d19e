//! Prometheus metrics for the engine
//!
//! A process-wide singleton, initialised once at startup and read through
//! [`Metrics::get`] on hot paths. Component series are labelled with the
//! component's manager path so brokers and their children stay
//! distinguishable.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, TextEncoder, register_counter_vec, register_gauge,
    register_gauge_vec,
};
use std::sync::OnceLock;
use virta_core::{Error, Result};

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All engine metrics.
pub struct Metrics {
    /// Messages read from inputs (by component path).
    pub input_received: CounterVec,

    /// Messages written by outputs (by component path).
    pub output_sent: CounterVec,

    /// Failed output writes (by component path).
    pub output_errors: CounterVec,

    /// Messages dropped by explicit policy (by component, reason).
    pub dropped: CounterVec,

    /// Streams currently running.
    pub active_streams: Gauge,

    /// Shards owned by this instance (by stream).
    pub shards_owned: GaugeVec,
}

impl Metrics {
    /// Initialise the singleton. Safe to call more than once; later calls
    /// return the existing instance.
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            input_received: register_counter_vec!(
                "virta_input_received_total",
                "Total messages read from inputs",
                &["path"]
            )
            .map_err(|e| Error::Config(format!("metrics input_received: {e}")))?,

            output_sent: register_counter_vec!(
                "virta_output_sent_total",
                "Total messages written by outputs",
                &["path"]
            )
            .map_err(|e| Error::Config(format!("metrics output_sent: {e}")))?,

            output_errors: register_counter_vec!(
                "virta_output_error_total",
                "Total failed output writes",
                &["path"]
            )
            .map_err(|e| Error::Config(format!("metrics output_errors: {e}")))?,

            dropped: register_counter_vec!(
                "virta_dropped_total",
                "Total messages dropped by explicit policy",
                &["component", "reason"]
            )
            .map_err(|e| Error::Config(format!("metrics dropped: {e}")))?,

            active_streams: register_gauge!(
                "virta_active_streams",
                "Streams currently running"
            )
            .map_err(|e| Error::Config(format!("metrics active_streams: {e}")))?,

            shards_owned: register_gauge_vec!(
                "virta_shards_owned",
                "Shards owned by this instance",
                &["stream"]
            )
            .map_err(|e| Error::Config(format!("metrics shards_owned: {e}")))?,
        };

        Ok(METRICS.get_or_init(|| metrics))
    }

    /// The singleton, if initialised.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    /// Record messages read from an input.
    pub fn record_input_received(&self, path: &str, count: usize) {
        self.input_received
            .with_label_values(&[path])
            .inc_by(count as f64);
    }

    /// Record messages written by an output.
    pub fn record_output_sent(&self, path: &str, count: usize) {
        self.output_sent
            .with_label_values(&[path])
            .inc_by(count as f64);
    }

    /// Record a failed output write.
    pub fn record_output_error(&self, path: &str) {
        self.output_errors.with_label_values(&[path]).inc();
    }

    /// Record a policy drop.
    pub fn record_dropped(&self, component: &str, reason: &str, count: usize) {
        self.dropped
            .with_label_values(&[component, reason])
            .inc_by(count as f64);
    }

    /// Render the default registry in the exposition format.
    pub fn render() -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(err) = encoder.encode(&prometheus::gather(), &mut buf) {
            tracing::warn!(error = %err, "failed to encode metrics");
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_records() {
        let metrics = Metrics::init().unwrap();
        let again = Metrics::init().unwrap();
        assert!(std::ptr::eq(metrics, again));

        metrics.record_input_received("test.input", 3);
        metrics.record_output_sent("test.output", 2);
        metrics.record_output_error("test.output");
        metrics.record_dropped("drop_on", "error", 1);

        let rendered = Metrics::render();
        assert!(rendered.contains("virta_input_received_total"));
        assert!(rendered.contains("virta_dropped_total"));
    }
}
