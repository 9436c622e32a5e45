//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks pipeline runs, stage invocations, recorded failures and the size
//! of the trace registry.
//!
//! # Example
//!
//! ```ignore
//! use sqlforge::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//! let collector = MetricsCollector::new();
//! collector.record_run("success", 3);
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::{MetricsCollector, OUTCOME_SUCCESS};
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    FAILURES_RECORDED_TOTAL, REGISTRY, RUNS_TOTAL, RUN_ROUNDS, STAGE_DURATION,
    STAGE_INVOCATIONS_TOTAL, TRACES_REGISTERED,
};
