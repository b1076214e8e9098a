//! `livewire simulate`: drive the orchestrator with in-memory plugins and
//! subscribers that come and go.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    anyhow::Result,
    async_trait::async_trait,
    bytes::Bytes,
    clap::Args,
    livewire_config::LivewireConfig,
    livewire_metrics::{MetricsRecorderConfig, init_metrics},
    livewire_streams::{
        ChannelKey, ChannelSink, PacketSender, PluginContext, PluginContextResolver,
        PresenceTracker, RunnerRegistry, StreamOrchestrator, StreamRequest, StreamRunner,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

const PLUGIN_ID: &str = "ticker";

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of datasource channels to open.
    #[arg(long, default_value_t = 3)]
    channels: usize,
    /// How long to run before shutting down.
    #[arg(long, default_value_t = 20)]
    duration_secs: u64,
    /// Packet interval of the demo plugin.
    #[arg(long, default_value_t = 500)]
    tick_ms: u64,
    /// Every this many seconds one subscriber leaves or rejoins.
    #[arg(long, default_value_t = 4)]
    churn_secs: u64,
    /// Make the demo plugin fail after this many packets (0 = never).
    #[arg(long, default_value_t = 0)]
    fail_after: u64,
    /// Print Prometheus metrics after shutdown.
    #[arg(long, default_value_t = false)]
    metrics: bool,
}

/// Knows one `demo-N` datasource per simulated channel.
struct DemoResolver {
    datasources: usize,
    tick_ms: u64,
}

#[async_trait]
impl PluginContextResolver for DemoResolver {
    async fn resolve_plugin_context(
        &self,
        plugin_id: &str,
        datasource_uid: &str,
    ) -> Result<Option<PluginContext>> {
        let known = if datasource_uid.is_empty() {
            plugin_id == PLUGIN_ID
        } else {
            datasource_uid
                .strip_prefix("demo-")
                .and_then(|n| n.parse::<usize>().ok())
                .is_some_and(|n| n < self.datasources)
        };
        Ok(known.then(|| PluginContext {
            org_id: 1,
            plugin_id: PLUGIN_ID.to_string(),
            datasource_uid: (!datasource_uid.is_empty()).then(|| datasource_uid.to_string()),
            settings: serde_json::json!({ "tick_ms": self.tick_ms }),
            updated_at_ms: 0,
        }))
    }
}

#[derive(Default)]
struct Subscribers {
    counts: Mutex<HashMap<ChannelKey, usize>>,
}

impl Subscribers {
    fn join(&self, channel: &ChannelKey) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        *counts.entry(channel.clone()).or_default() += 1;
    }

    fn leave(&self, channel: &ChannelKey) {
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(channel) {
            *count = count.saturating_sub(1);
        }
    }

    fn count(&self, channel: &ChannelKey) -> usize {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.get(channel).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PresenceTracker for Subscribers {
    async fn subscriber_count(&self, channel: &ChannelKey) -> Result<usize> {
        Ok(self.count(channel))
    }
}

/// Counts what would have been pushed to clients.
#[derive(Default)]
struct CountingSink {
    delivered: Mutex<HashMap<ChannelKey, u64>>,
}

#[async_trait]
impl ChannelSink for CountingSink {
    async fn publish(&self, channel: &ChannelKey, payload: Bytes) -> Result<()> {
        debug!(channel = %channel, bytes = payload.len(), "publish");
        let mut delivered = self.delivered.lock().unwrap_or_else(|e| e.into_inner());
        *delivered.entry(channel.clone()).or_default() += 1;
        Ok(())
    }
}

/// Emits a JSON sequence number every `tick_ms`.
struct TickerPlugin {
    fail_after: u64,
}

#[async_trait]
impl StreamRunner for TickerPlugin {
    async fn run_stream(
        &self,
        request: StreamRequest,
        sender: PacketSender,
        cancel: CancellationToken,
    ) -> Result<()> {
        let tick_ms = request.plugin_context.settings["tick_ms"]
            .as_u64()
            .unwrap_or(500);
        let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms.max(1)));
        let mut seq = 0u64;

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {},
            }
            seq += 1;
            let payload = serde_json::to_vec(&serde_json::json!({
                "path": request.path,
                "seq": seq,
            }))?;
            if sender.send(payload).await.is_err() {
                return Ok(());
            }
            if self.fail_after > 0 && seq >= self.fail_after {
                anyhow::bail!("demo plugin gave up after {seq} packets");
            }
        }
    }
}

pub async fn run(config: LivewireConfig, args: SimulateArgs) -> Result<()> {
    let metrics = init_metrics(MetricsRecorderConfig {
        enabled: config.metrics.enabled,
        global_labels: config.metrics.labels.clone().into_iter().collect(),
    })?;

    let subscribers = Arc::new(Subscribers::default());
    let sink = Arc::new(CountingSink::default());
    let orchestrator = StreamOrchestrator::new(
        config.streams.clone(),
        Arc::new(DemoResolver {
            datasources: args.channels,
            tick_ms: args.tick_ms,
        }),
        Arc::clone(&subscribers) as Arc<dyn PresenceTracker>,
        Arc::clone(&sink) as Arc<dyn ChannelSink>,
        RunnerRegistry::new().with_runner(
            PLUGIN_ID,
            Arc::new(TickerPlugin {
                fail_after: args.fail_after,
            }),
        ),
    );
    orchestrator.start_presence_watcher();

    let channels: Vec<ChannelKey> = (0..args.channels)
        .map(|n| ChannelKey::from(format!("ds/demo-{n}/ticks")))
        .collect();
    for channel in &channels {
        subscribers.join(channel);
        orchestrator.ensure_stream(channel).await?;
    }
    info!(channels = channels.len(), "simulation running");

    let deadline = tokio::time::sleep(Duration::from_secs(args.duration_secs));
    tokio::pin!(deadline);
    let mut churn = tokio::time::interval(Duration::from_secs(args.churn_secs.max(1)));
    churn.tick().await;
    let mut round = 0usize;

    loop {
        tokio::select! {
            () = &mut deadline => break,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            },
            _ = churn.tick() => {
                if channels.is_empty() {
                    continue;
                }
                let channel = &channels[round % channels.len()];
                round += 1;
                if subscribers.count(channel) > 0 {
                    info!(channel = %channel, "subscriber leaves");
                    subscribers.leave(channel);
                    orchestrator.release_stream(channel).await;
                } else {
                    info!(channel = %channel, "subscriber joins");
                    subscribers.join(channel);
                    if let Err(e) = orchestrator.ensure_stream(channel).await {
                        warn!(channel = %channel, error = %e, "could not start stream");
                    }
                }
            },
        }
    }

    let report = orchestrator
        .shutdown(config.streams.shutdown_timeout())
        .await;

    println!("{}", serde_json::to_string_pretty(&orchestrator.streams())?);
    {
        let delivered = sink.delivered.lock().unwrap_or_else(|e| e.into_inner());
        for channel in &channels {
            println!(
                "{channel}: {} packets",
                delivered.get(channel).copied().unwrap_or(0)
            );
        }
    }
    println!(
        "stopped {} stream(s), abandoned {}",
        report.stopped.len(),
        report.abandoned.len()
    );
    if args.metrics {
        print!("{}", metrics.render());
    }
    Ok(())
}
