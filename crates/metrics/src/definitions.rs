//! Metric name and label definitions.
//!
//! Every metric the orchestrator records is named here so exporters and
//! dashboards have a single place to look.

/// Stream lifecycle metrics
pub mod streams {
    /// Number of channels with a live stream run
    pub const ACTIVE: &str = "livewire_streams_active";
    /// Total number of runner invocations started (first runs and restarts)
    pub const RUNS_STARTED_TOTAL: &str = "livewire_stream_runs_started_total";
    /// Total number of restarts after a run ended while still wanted
    pub const RESTARTS_TOTAL: &str = "livewire_stream_restarts_total";
    /// Wall time of a single runner invocation in seconds
    pub const RUN_DURATION_SECONDS: &str = "livewire_stream_run_duration_seconds";
    /// Streams stopped because presence stayed at zero past the grace window
    pub const TEARDOWNS_TOTAL: &str = "livewire_stream_teardowns_total";
    /// Streams that did not exit before the shutdown deadline
    pub const ABANDONED_TOTAL: &str = "livewire_streams_abandoned_total";
}

/// Plugin context resolution metrics
pub mod resolve {
    /// Plugin context lookups that failed or found nothing
    pub const FAILURES_TOTAL: &str = "livewire_resolve_failures_total";
    /// Plugin context lookup duration in seconds
    pub const DURATION_SECONDS: &str = "livewire_resolve_duration_seconds";
}

/// Packet forwarding metrics
pub mod packets {
    /// Packets handed to the channel sink successfully
    pub const DELIVERED_TOTAL: &str = "livewire_packets_delivered_total";
    /// Payload bytes handed to the channel sink successfully
    pub const DELIVERED_BYTES_TOTAL: &str = "livewire_packets_delivered_bytes_total";
    /// Packets dropped because their run was superseded
    pub const DROPPED_STALE_TOTAL: &str = "livewire_packets_dropped_stale_total";
    /// Packets the channel sink rejected
    pub const DELIVERY_ERRORS_TOTAL: &str = "livewire_packet_delivery_errors_total";
}

/// Common label keys
pub mod labels {
    pub const PLUGIN: &str = "plugin";
    pub const REASON: &str = "reason";
}

/// Standard histogram buckets for different metric types
pub mod buckets {
    use once_cell::sync::Lazy;

    /// Run duration buckets (in seconds)
    /// Covers 100ms to 1 day; healthy streams live for hours
    pub static RUN_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.1, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0, 14400.0, 86400.0,
        ]
    });

    /// Resolution duration buckets (in seconds)
    /// Covers 1ms to 10s
    pub static RESOLVE_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]
    });
}
