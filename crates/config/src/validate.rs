//! Semantic validation of a loaded configuration.
//!
//! Parsing already guarantees types; this catches values that parse fine but
//! would make the orchestrator misbehave (zero-capacity queues, inverted
//! backoff bounds).

use crate::schema::LivewireConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "streams.backoff_max_ms"
    pub path: &'static str,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.severity, self.path, self.message)
    }
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    fn push(&mut self, severity: Severity, path: &'static str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path,
            message: message.into(),
        });
    }
}

/// Check a config for values the orchestrator cannot work with.
#[must_use]
pub fn validate(config: &LivewireConfig) -> ValidationResult {
    let mut result = ValidationResult::default();
    let streams = &config.streams;

    if streams.packet_queue_capacity == 0 {
        result.push(
            Severity::Error,
            "streams.packet_queue_capacity",
            "must be at least 1",
        );
    }
    if streams.backoff_base_ms == 0 {
        result.push(
            Severity::Error,
            "streams.backoff_base_ms",
            "must be greater than 0",
        );
    }
    if streams.backoff_base_ms > streams.backoff_max_ms {
        result.push(
            Severity::Error,
            "streams.backoff_max_ms",
            format!(
                "must not be lower than backoff_base_ms ({})",
                streams.backoff_base_ms
            ),
        );
    }
    if streams.resolve_timeout_ms == 0 {
        result.push(
            Severity::Error,
            "streams.resolve_timeout_ms",
            "must be greater than 0",
        );
    }
    if streams.grace_period_ms == 0 {
        result.push(
            Severity::Warning,
            "streams.grace_period_ms",
            "0 tears streams down on every brief unsubscribe",
        );
    }
    if streams.shutdown_timeout_ms == 0 {
        result.push(
            Severity::Warning,
            "streams.shutdown_timeout_ms",
            "0 abandons every stream that does not stop instantly",
        );
    }

    result
}
