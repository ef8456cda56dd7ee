use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::time::Duration;

use crate::output::WriteOutcome;

/// Pipeline counters. Per-message failures are only observable here and in
/// the logs; they never stop the pipeline.
pub struct Metrics {
    registry: Registry,

    // Source metrics
    pub messages_read: IntCounterVec,
    pub malformed_frames: IntCounterVec,
    pub capture_dropped: IntCounter,

    // Dispatch metrics
    pub outcomes: IntCounterVec,
    pub retries: IntCounterVec,
    pub in_flight: IntGauge,
    pub write_duration: Histogram,

    // Middleware metrics
    pub middleware_sent: IntCounter,
    pub middleware_received: IntCounter,
    pub middleware_failures: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let messages_read = IntCounterVec::new(
            Opts::new(
                "http_mirror_messages_read_total",
                "Messages produced by each source",
            ),
            &["source"],
        )
        .expect("metric creation failed");
        let malformed_frames = IntCounterVec::new(
            Opts::new(
                "http_mirror_malformed_frames_total",
                "Frames dropped because they could not be decoded",
            ),
            &["origin"],
        )
        .expect("metric creation failed");
        let capture_dropped = IntCounter::new(
            "http_mirror_capture_dropped_total",
            "Captured messages dropped because the pipeline lagged behind",
        )
        .expect("metric creation failed");

        let outcomes = IntCounterVec::new(
            Opts::new(
                "http_mirror_dispatch_outcomes_total",
                "Final write outcome per sink",
            ),
            &["sink", "outcome"],
        )
        .expect("metric creation failed");
        let retries = IntCounterVec::new(
            Opts::new("http_mirror_dispatch_retries_total", "Retried writes per sink"),
            &["sink"],
        )
        .expect("metric creation failed");
        let in_flight = IntGauge::new(
            "http_mirror_dispatch_in_flight",
            "Sink writes currently in progress",
        )
        .expect("metric creation failed");
        let write_duration = Histogram::with_opts(HistogramOpts::new(
            "http_mirror_write_duration_seconds",
            "Duration of a single sink write attempt",
        ))
        .expect("metric creation failed");

        let middleware_sent = IntCounter::new(
            "http_mirror_middleware_sent_total",
            "Messages written to the middleware process",
        )
        .expect("metric creation failed");
        let middleware_received = IntCounter::new(
            "http_mirror_middleware_received_total",
            "Messages read back from the middleware process",
        )
        .expect("metric creation failed");
        let middleware_failures = IntCounter::new(
            "http_mirror_middleware_failures_total",
            "Fatal middleware failures",
        )
        .expect("metric creation failed");

        registry
            .register(Box::new(messages_read.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(malformed_frames.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(capture_dropped.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(outcomes.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(retries.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(in_flight.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(write_duration.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(middleware_sent.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(middleware_received.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(middleware_failures.clone()))
            .expect("metric registration failed");

        Self {
            registry,
            messages_read,
            malformed_frames,
            capture_dropped,
            outcomes,
            retries,
            in_flight,
            write_duration,
            middleware_sent,
            middleware_received,
            middleware_failures,
        }
    }

    pub fn record_read(&self, source: &str) {
        self.messages_read.with_label_values(&[source]).inc();
    }

    pub fn record_malformed(&self, origin: &str) {
        self.malformed_frames.with_label_values(&[origin]).inc();
    }

    pub fn record_outcome(&self, sink: &str, outcome: &WriteOutcome) {
        self.outcomes
            .with_label_values(&[sink, outcome.label()])
            .inc();
    }

    pub fn record_retry(&self, sink: &str) {
        self.retries.with_label_values(&[sink]).inc();
    }

    pub fn record_write_duration(&self, duration: Duration) {
        self.write_duration.observe(duration.as_secs_f64());
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Flat name → value view used by `/debug/vars`.
    pub fn snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut vars = serde_json::Map::new();
        for family in self.registry.gather() {
            for metric in family.get_metric() {
                let mut name = family.get_name().to_string();
                for label in metric.get_label() {
                    name.push_str(&format!(".{}", label.get_value()));
                }
                let value = if metric.has_counter() {
                    serde_json::json!(metric.get_counter().get_value())
                } else if metric.has_gauge() {
                    serde_json::json!(metric.get_gauge().get_value())
                } else if metric.has_histogram() {
                    let histogram = metric.get_histogram();
                    serde_json::json!({
                        "count": histogram.get_sample_count(),
                        "sum": histogram.get_sample_sum(),
                    })
                } else {
                    continue;
                };
                vars.insert(name, value);
            }
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_counters_are_labelled() {
        let metrics = Metrics::new();
        metrics.record_outcome("discard", &WriteOutcome::Delivered);
        metrics.record_outcome("discard", &WriteOutcome::Delivered);
        metrics.record_outcome("http", &WriteOutcome::Dropped("queue full".into()));

        assert_eq!(
            metrics
                .outcomes
                .with_label_values(&["discard", "delivered"])
                .get(),
            2
        );
        assert_eq!(
            metrics.outcomes.with_label_values(&["http", "dropped"]).get(),
            1
        );
    }

    #[test]
    fn test_snapshot_flattens_labels() {
        let metrics = Metrics::new();
        metrics.record_read("file:/tmp/requests.gor");
        metrics.capture_dropped.inc();

        let vars = metrics.snapshot();
        assert_eq!(
            vars.get("http_mirror_messages_read_total.file:/tmp/requests.gor"),
            Some(&serde_json::json!(1.0))
        );
        assert_eq!(
            vars.get("http_mirror_capture_dropped_total"),
            Some(&serde_json::json!(1.0))
        );
    }
}
