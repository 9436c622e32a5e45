//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by sqlforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, Gauge, Histogram, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all sqlforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total pipeline runs, labeled by outcome (`success` or an error kind).
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Rounds used per run.
pub static RUN_ROUNDS: OnceLock<Histogram> = OnceLock::new();

/// Total stage invocations, labeled by stage and status.
pub static STAGE_INVOCATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Stage invocation latency in seconds, labeled by stage.
pub static STAGE_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Failure records handed to the failure sink, labeled by error kind.
pub static FAILURES_RECORDED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of traces currently held by the registry.
pub static TRACES_REGISTERED: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording before initialization is a no-op.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let runs_total = CounterVec::new(
        Opts::new("sqlforge_runs_total", "Total pipeline runs"),
        &["outcome"],
    )?;

    let run_rounds = Histogram::with_opts(
        prometheus::HistogramOpts::new("sqlforge_run_rounds", "Rounds used per run")
            .buckets(vec![1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0, 20.0, 50.0]),
    )?;

    let stage_invocations_total = CounterVec::new(
        Opts::new(
            "sqlforge_stage_invocations_total",
            "Total stage invocations",
        ),
        &["stage", "status"],
    )?;

    let stage_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "sqlforge_stage_duration_seconds",
            "Stage invocation latency in seconds",
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        &["stage"],
    )?;

    let failures_recorded_total = CounterVec::new(
        Opts::new(
            "sqlforge_failures_recorded_total",
            "Failure records handed to the failure sink",
        ),
        &["error_kind"],
    )?;

    let traces_registered = Gauge::new(
        "sqlforge_traces_registered",
        "Number of traces held by the trace registry",
    )?;

    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(run_rounds.clone()))?;
    registry.register(Box::new(stage_invocations_total.clone()))?;
    registry.register(Box::new(stage_duration.clone()))?;
    registry.register(Box::new(failures_recorded_total.clone()))?;
    registry.register(Box::new(traces_registered.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = RUN_ROUNDS.set(run_rounds);
    let _ = STAGE_INVOCATIONS_TOTAL.set(stage_invocations_total);
    let _ = STAGE_DURATION.set(stage_duration);
    let _ = FAILURES_RECORDED_TOTAL.set(failures_recorded_total);
    let _ = TRACES_REGISTERED.set(traces_registered);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
