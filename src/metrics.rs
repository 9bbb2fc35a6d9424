//! Prometheus counters for pushed and handled jobs.
//!
//! Counters live in a registry owned by this crate so they never clash with
//! an application's own metrics; call [`gather`] to render them in the text
//! exposition format.

use crate::error::{CourierError, CourierResult};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

static METRICS: OnceLock<Option<CourierMetrics>> = OnceLock::new();

#[derive(Debug)]
struct CourierMetrics {
    registry: Registry,
    pushed: IntCounterVec,
    outcomes: IntCounterVec,
}

impl CourierMetrics {
    fn build() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("courierq".to_string()), None)?;

        let pushed = IntCounterVec::new(
            Opts::new("jobs_pushed_total", "Jobs pushed to a queue backend"),
            &["backend", "queue"],
        )?;
        let outcomes = IntCounterVec::new(
            Opts::new("job_runs_total", "Poll cycles by outcome"),
            &["backend", "queue", "outcome"],
        )?;

        registry.register(Box::new(pushed.clone()))?;
        registry.register(Box::new(outcomes.clone()))?;

        Ok(Self {
            registry,
            pushed,
            outcomes,
        })
    }
}

fn metrics() -> Option<&'static CourierMetrics> {
    METRICS
        .get_or_init(|| match CourierMetrics::build() {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                tracing::warn!("Queue metrics disabled, registration failed: {}", e);
                None
            }
        })
        .as_ref()
}

/// Count a job pushed to `queue` on `backend`.
pub fn record_push(backend: &str, queue: &str) {
    if let Some(metrics) = metrics() {
        metrics.pushed.with_label_values(&[backend, queue]).inc();
    }
}

/// Count one poll cycle on `queue` with the given outcome label.
pub fn record_outcome(backend: &str, queue: &str, outcome: &str) {
    if let Some(metrics) = metrics() {
        metrics
            .outcomes
            .with_label_values(&[backend, queue, outcome])
            .inc();
    }
}

/// Render every counter in the Prometheus text format.
pub fn gather() -> CourierResult<String> {
    let Some(metrics) = metrics() else {
        return Ok(String::new());
    };

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metrics.registry.gather(), &mut buffer)
        .map_err(|e| CourierError::queue("failed to encode metrics", e))?;
    String::from_utf8(buffer).map_err(|e| CourierError::queue("metrics output is not UTF-8", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_rendered() {
        record_push("memory", "metrics-test");
        record_outcome("memory", "metrics-test", "completed");
        record_outcome("memory", "metrics-test", "completed");

        let output = gather().unwrap();
        assert!(output.contains("courierq_jobs_pushed_total"));
        assert!(output.contains(r#"queue="metrics-test""#));
        assert!(output.contains(r#"outcome="completed""#));
    }
}
