//! Config schema types for the stream orchestrator and its metrics.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivewireConfig {
    pub streams: StreamsConfig,
    pub metrics: MetricsConfig,
}

/// Stream lifecycle tuning.
///
/// All durations are stored in milliseconds so the file format stays plain
/// integers; use the accessor methods to get [`Duration`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsConfig {
    /// How long a channel may sit at zero subscribers before its stream is
    /// torn down. Absorbs quick unsubscribe/resubscribe cycles.
    pub grace_period_ms: u64,
    /// First retry delay after a stream ends unexpectedly.
    pub backoff_base_ms: u64,
    /// Upper bound for the doubling retry delay.
    pub backoff_max_ms: u64,
    /// Upper bound for a single plugin context lookup.
    pub resolve_timeout_ms: u64,
    /// Packets buffered between a runner and the sink per run.
    pub packet_queue_capacity: usize,
    /// Interval of the background presence sweep. `0` disables the sweep.
    pub presence_check_interval_ms: u64,
    /// Default deadline used by callers that shut down without an explicit one.
    pub shutdown_timeout_ms: u64,
}

impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 3_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            resolve_timeout_ms: 10_000,
            packet_queue_capacity: 64,
            presence_check_interval_ms: 5_000,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl StreamsConfig {
    #[must_use]
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    #[must_use]
    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    #[must_use]
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    /// `None` when the periodic sweep is disabled.
    #[must_use]
    pub fn presence_check_interval(&self) -> Option<Duration> {
        (self.presence_check_interval_ms > 0)
            .then(|| Duration::from_millis(self.presence_check_interval_ms))
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Metrics export configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metrics collection is enabled.
    pub enabled: bool,
    /// Extra labels attached to every exported metric.
    pub labels: std::collections::BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            labels: std::collections::BTreeMap::new(),
        }
    }
}
