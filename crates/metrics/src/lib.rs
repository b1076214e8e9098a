//! Metrics for livewire.
//!
//! Metric names live in [`streams`], [`resolve`] and [`packets`] and are
//! recorded with the `metrics` crate facade. When the `prometheus` feature is enabled,
//! [`init_metrics`] installs a Prometheus recorder whose output can be
//! rendered on demand.
//!
//! ```rust,ignore
//! use livewire_metrics::{counter, labels, streams};
//!
//! counter!(streams::RUNS_STARTED_TOTAL, labels::PLUGIN => "loki").increment(1);
//! ```

mod definitions;
mod recorder;

pub use {
    definitions::*,
    recorder::{MetricsHandle, MetricsRecorderConfig, init_metrics},
};

// Re-export metrics macros for convenience
pub use metrics::{counter, gauge, histogram};
