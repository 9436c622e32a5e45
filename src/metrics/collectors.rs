//! High-level metric recording for pipeline runs.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics with consistent
//! labels. Every method is a no-op until `init_metrics()` has run.

use super::prometheus::{
    FAILURES_RECORDED_TOTAL, RUNS_TOTAL, RUN_ROUNDS, STAGE_DURATION, STAGE_INVOCATIONS_TOTAL,
    TRACES_REGISTERED,
};

/// Outcome label for successful runs.
pub const OUTCOME_SUCCESS: &str = "success";

/// Records sqlforge operational metrics.
///
/// # Example
///
/// ```ignore
/// use sqlforge::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_stage("generation", true, 1.2);
/// collector.record_run("success", 4);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a finished run.
    ///
    /// `outcome` is `success` or the error kind name.
    pub fn record_run(&self, outcome: &str, rounds: usize) {
        if let Some(runs_total) = RUNS_TOTAL.get() {
            runs_total.with_label_values(&[outcome]).inc();
        }

        if let Some(run_rounds) = RUN_ROUNDS.get() {
            run_rounds.observe(rounds as f64);
        }

        tracing::trace!(outcome = outcome, rounds = rounds, "Recorded run metric");
    }

    /// Record one stage invocation.
    pub fn record_stage(&self, stage: &str, success: bool, duration_secs: f64) {
        let status = if success { "success" } else { "failed" };

        if let Some(invocations) = STAGE_INVOCATIONS_TOTAL.get() {
            invocations.with_label_values(&[stage, status]).inc();
        }

        if let Some(duration) = STAGE_DURATION.get() {
            duration.with_label_values(&[stage]).observe(duration_secs);
        }

        tracing::trace!(
            stage = stage,
            status = status,
            duration_secs = duration_secs,
            "Recorded stage metric"
        );
    }

    /// Record a failure handed to the failure sink.
    pub fn record_failure(&self, error_kind: &str) {
        if let Some(failures) = FAILURES_RECORDED_TOTAL.get() {
            failures.with_label_values(&[error_kind]).inc();
        }

        tracing::trace!(error_kind = error_kind, "Recorded failure metric");
    }

    /// Set the number of traces held by the registry.
    pub fn set_traces_registered(&self, count: usize) {
        if let Some(gauge) = TRACES_REGISTERED.get() {
            gauge.set(count as f64);
        }
    }
}
