use {anyhow::Result, async_trait::async_trait, bytes::Bytes, tokio_util::sync::CancellationToken};

use crate::{channel::ChannelKey, sender::PacketSender};

// ── Plugin context ──────────────────────────────────────────────────────────

/// Snapshot of everything a plugin needs to serve a stream.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PluginContext {
    pub org_id: i64,
    pub plugin_id: String,
    /// Set for datasource-backed streams.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasource_uid: Option<String>,
    /// Opaque plugin/datasource settings.
    #[serde(default)]
    pub settings: serde_json::Value,
    /// Last modification of the settings (unix millis).
    #[serde(default)]
    pub updated_at_ms: i64,
}

/// Request handed to a [`StreamRunner`] for one run.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub channel: ChannelKey,
    /// Channel path below the namespace, e.g. `logs` for `ds/abc/logs`.
    pub path: String,
    pub plugin_context: PluginContext,
}

// ── Collaborators ───────────────────────────────────────────────────────────

/// Maps a plugin id / datasource uid pair to a plugin context.
#[async_trait]
pub trait PluginContextResolver: Send + Sync {
    /// Returns `Ok(None)` when the plugin or datasource does not exist.
    ///
    /// Exactly one of `plugin_id` and `datasource_uid` is non-empty.
    async fn resolve_plugin_context(
        &self,
        plugin_id: &str,
        datasource_uid: &str,
    ) -> Result<Option<PluginContext>>;
}

/// Source of per-channel subscriber counts.
#[async_trait]
pub trait PresenceTracker: Send + Sync {
    async fn subscriber_count(&self, channel: &ChannelKey) -> Result<usize>;
}

/// Delivers a payload to every current subscriber of a channel.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn publish(&self, channel: &ChannelKey, payload: Bytes) -> Result<()>;
}

/// A plugin's streaming implementation.
#[async_trait]
pub trait StreamRunner: Send + Sync {
    /// Run until `cancel` fires, emitting packets through `sender`.
    ///
    /// Returning before cancellation counts as an unexpected end and the
    /// orchestrator restarts the stream while it still has subscribers.
    async fn run_stream(
        &self,
        request: StreamRequest,
        sender: PacketSender,
        cancel: CancellationToken,
    ) -> Result<()>;
}
