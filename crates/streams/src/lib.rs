//! Live plugin streams.
//!
//! A [`StreamOrchestrator`] runs one plugin stream per channel while the
//! channel has subscribers. Plugins implement [`StreamRunner`] and push
//! packets through a [`PacketSender`]; the orchestrator forwards them to a
//! [`ChannelSink`], restarts runs that end unexpectedly, and stops runs a
//! grace period after the last subscriber leaves.

pub mod backoff;
pub mod channel;
pub mod error;
pub mod orchestrator;
pub mod plugin;
pub mod registry;
pub mod sender;
pub mod supervisor;
mod watcher;

pub use {
    backoff::Backoff,
    channel::{ChannelAddress, ChannelKey, ChannelScope},
    error::{Error, ErrorKind, Result},
    orchestrator::{ShutdownReport, StreamOrchestrator},
    plugin::{ChannelSink, PluginContext, PluginContextResolver, PresenceTracker, StreamRequest, StreamRunner},
    registry::RunnerRegistry,
    sender::PacketSender,
    supervisor::{StreamInfo, StreamState},
};
