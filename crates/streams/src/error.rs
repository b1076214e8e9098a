use std::{error::Error as StdError, time::Duration};

use crate::channel::ChannelKey;

/// Crate-wide result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse failure classes, used to decide whether something is retried,
/// surfaced, or only logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Channel cannot be served as configured. Surfaced to the caller, never
    /// retried.
    Configuration,
    /// A run ended while subscribers were still listening. Retried with
    /// backoff.
    TransientRun,
    /// The sink rejected a packet. Logged; the stream keeps going.
    Delivery,
    /// Expected outcome of an intentional stop.
    Cancellation,
}

/// Typed orchestrator errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Channel key is malformed or names a scope without plugin streams.
    #[error("invalid channel {channel}: {reason}")]
    InvalidChannel {
        channel: String,
        reason: &'static str,
    },

    /// The resolver reported no plugin/datasource for the channel.
    #[error("plugin context not found for {channel} (plugin {plugin_id:?}, datasource {datasource_uid:?})")]
    PluginNotFound {
        channel: ChannelKey,
        plugin_id: String,
        datasource_uid: String,
    },

    /// The resolved plugin has no registered stream runner.
    #[error("plugin {plugin_id} does not provide a stream runner")]
    RunnerNotFound { plugin_id: String },

    /// Plugin context lookup did not finish in time.
    #[error("plugin context resolution for {channel} timed out after {timeout:?}")]
    ResolveTimeout {
        channel: ChannelKey,
        timeout: Duration,
    },

    /// Plugin context lookup failed.
    #[error("plugin context resolution for {channel} failed: {source}")]
    Resolve {
        channel: ChannelKey,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// A runner returned while the stream was still wanted.
    #[error("stream for {channel} ended unexpectedly: {reason}")]
    RunEnded { channel: ChannelKey, reason: String },

    /// The sink refused a packet.
    #[error("delivery to {channel} failed: {source}")]
    Delivery {
        channel: ChannelKey,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },

    /// The run this sender belongs to has been stopped or replaced.
    #[error("stream run superseded")]
    Superseded,

    /// The orchestrator no longer accepts streams.
    #[error("stream orchestrator is shutting down")]
    ShuttingDown,
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidChannel { .. }
            | Self::PluginNotFound { .. }
            | Self::RunnerNotFound { .. }
            | Self::ResolveTimeout { .. }
            | Self::Resolve { .. } => ErrorKind::Configuration,
            Self::RunEnded { .. } => ErrorKind::TransientRun,
            Self::Delivery { .. } => ErrorKind::Delivery,
            Self::Superseded | Self::ShuttingDown => ErrorKind::Cancellation,
        }
    }

    #[must_use]
    pub fn is_configuration(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }

    #[must_use]
    pub fn invalid_channel(channel: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidChannel {
            channel: channel.into(),
            reason,
        }
    }

    pub(crate) fn run_ended(channel: &ChannelKey, result: &anyhow::Result<()>) -> Self {
        let reason = match result {
            Ok(()) => "runner returned without error".to_string(),
            Err(e) => format!("{e:#}"),
        };
        Self::RunEnded {
            channel: channel.clone(),
            reason,
        }
    }
}
