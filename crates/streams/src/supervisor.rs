//! Per-channel stream lifecycle.
//!
//! ```text
//! Idle ──► Resolving ──► Running ──► Stopping ──► Idle
//!              ▲            │
//!              └─ Backoff ◄─┘   (run ended while subscribers remain)
//! ```
//!
//! Every transition of a channel happens while holding its entry's `slot`
//! lock. The generation counter is only advanced under that lock, so a run
//! can tell whether it is still the current one by comparing generations.

use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicU64, Ordering},
};

use {
    tokio::{sync::mpsc, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use livewire_metrics::{counter, gauge, histogram, labels, streams as stream_metrics};

use crate::{
    backoff::Backoff,
    channel::ChannelKey,
    error::Error,
    orchestrator::Shared,
    plugin::{PluginContext, StreamRequest, StreamRunner},
    sender::{Forwarded, Forwarder, PacketSender},
};

/// Lifecycle state of a channel's stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Idle,
    Resolving,
    Running,
    Backoff,
    Stopping,
}

/// Point-in-time view of one channel, for status endpoints and tests.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StreamInfo {
    pub channel: ChannelKey,
    pub state: StreamState,
    pub generation: u64,
    /// Restarts of the current stream after unexpected ends.
    pub restarts: u32,
    pub plugin_id: Option<String>,
    pub datasource_uid: Option<String>,
    /// Start of the current run (unix millis).
    pub started_at_ms: Option<i64>,
    pub last_error: Option<String>,
    /// Set when shutdown gave up waiting for this channel's run.
    pub abandoned: bool,
}

/// Everything needed to launch a run.
pub(crate) struct ResolvedStream {
    pub(crate) context: PluginContext,
    pub(crate) runner: Arc<dyn StreamRunner>,
    pub(crate) path: String,
}

/// The live run of a channel.
pub(crate) struct StreamHandle {
    pub(crate) generation: u64,
    pub(crate) context: PluginContext,
    pub(crate) cancel: CancellationToken,
    pub(crate) task: JoinHandle<()>,
}

impl StreamHandle {
    pub(crate) fn serves_datasource(&self, datasource_uid: &str) -> bool {
        self.context.datasource_uid.as_deref() == Some(datasource_uid)
    }
}

pub(crate) struct PendingTeardown {
    pub(crate) id: u64,
    pub(crate) cancel: CancellationToken,
}

/// State guarded by the per-channel transition lock.
#[derive(Default)]
pub(crate) struct Slot {
    pub(crate) handle: Option<StreamHandle>,
    pub(crate) teardown: Option<PendingTeardown>,
    pub(crate) next_teardown_id: u64,
    /// Supervisor tasks of stopped runs that may still be winding down.
    pub(crate) stopping: Vec<JoinHandle<()>>,
    /// Entry was removed from the registry; callers must look it up again.
    pub(crate) retired: bool,
}

impl Slot {
    pub(crate) fn take_handle(&mut self) -> Option<StreamHandle> {
        let handle = self.handle.take();
        #[cfg(feature = "metrics")]
        if handle.is_some() {
            gauge!(stream_metrics::ACTIVE).decrement(1.0);
        }
        handle
    }

    pub(crate) fn prune_stopping(&mut self) {
        self.stopping.retain(|task| !task.is_finished());
    }

    /// Nothing running, pending, or winding down.
    pub(crate) fn is_vacant(&self) -> bool {
        self.handle.is_none()
            && self.teardown.is_none()
            && self.stopping.iter().all(JoinHandle::is_finished)
    }
}

struct Status {
    state: StreamState,
    restarts: u32,
    plugin_id: Option<String>,
    datasource_uid: Option<String>,
    started_at_ms: Option<i64>,
    last_error: Option<String>,
    abandoned: bool,
}

/// Registry entry for one channel.
pub(crate) struct SupervisorEntry {
    pub(crate) channel: ChannelKey,
    generation: Arc<AtomicU64>,
    pub(crate) slot: tokio::sync::Mutex<Slot>,
    // Readable without waiting for an in-flight transition; never held
    // across an await.
    status: Mutex<Status>,
}

impl SupervisorEntry {
    pub(crate) fn new(channel: ChannelKey) -> Self {
        Self {
            channel,
            generation: Arc::new(AtomicU64::new(0)),
            slot: tokio::sync::Mutex::new(Slot::default()),
            status: Mutex::new(Status {
                state: StreamState::Idle,
                restarts: 0,
                plugin_id: None,
                datasource_uid: None,
                started_at_ms: None,
                last_error: None,
                abandoned: false,
            }),
        }
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn generation_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.generation)
    }

    /// Invalidate everything tagged with the current generation. Callers
    /// must hold the slot lock.
    pub(crate) fn advance_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn state(&self) -> StreamState {
        self.status().state
    }

    pub(crate) fn set_state(&self, state: StreamState) {
        self.status().state = state;
    }

    pub(crate) fn record_error(&self, err: &Error) {
        self.status().last_error = Some(err.to_string());
    }

    pub(crate) fn mark_started(&self, context: &PluginContext) {
        let mut status = self.status();
        status.state = StreamState::Running;
        status.restarts = 0;
        status.plugin_id = Some(context.plugin_id.clone());
        status.datasource_uid = context.datasource_uid.clone();
        status.started_at_ms = Some(chrono::Utc::now().timestamp_millis());
        status.abandoned = false;
    }

    fn mark_restarted(&self, context: &PluginContext) {
        let mut status = self.status();
        status.state = StreamState::Running;
        status.restarts += 1;
        status.plugin_id = Some(context.plugin_id.clone());
        status.datasource_uid = context.datasource_uid.clone();
        status.started_at_ms = Some(chrono::Utc::now().timestamp_millis());
    }

    pub(crate) fn mark_abandoned(&self) {
        self.status().abandoned = true;
    }

    pub(crate) fn info(&self) -> StreamInfo {
        let status = self.status();
        StreamInfo {
            channel: self.channel.clone(),
            state: status.state,
            generation: self.generation.load(Ordering::Acquire),
            restarts: status.restarts,
            plugin_id: status.plugin_id.clone(),
            datasource_uid: status.datasource_uid.clone(),
            started_at_ms: status.started_at_ms,
            last_error: status.last_error.clone(),
            abandoned: status.abandoned,
        }
    }

    /// Move to `state` if `generation` still owns the channel.
    async fn transition_if_current(&self, generation: u64, state: StreamState) -> bool {
        let slot = self.slot.lock().await;
        let current = slot
            .handle
            .as_ref()
            .is_some_and(|h| h.generation == generation && !h.cancel.is_cancelled());
        if current {
            self.set_state(state);
        }
        current
    }

    /// Called by a supervisor task on its way out. Releases the handle if the
    /// exiting run still owns it, and settles the channel in `Idle` unless a
    /// newer run has taken over.
    async fn finish_run(&self, generation: u64) {
        let mut slot = self.slot.lock().await;
        if slot.handle.as_ref().is_some_and(|h| h.generation == generation)
            && let Some(handle) = slot.take_handle()
        {
            self.advance_generation();
            slot.stopping.push(handle.task);
            if let Some(pending) = slot.teardown.take() {
                pending.cancel.cancel();
            }
        }
        if slot.handle.is_none() {
            self.set_state(StreamState::Idle);
        }
    }
}

/// Body of a channel's supervisor task: run, forward, and restart with
/// backoff until cancelled or no longer wanted.
pub(crate) async fn supervise(
    shared: Arc<Shared>,
    entry: Arc<SupervisorEntry>,
    mut resolved: ResolvedStream,
    mut generation: u64,
    cancel: CancellationToken,
) {
    let channel = entry.channel.clone();
    let mut backoff = Backoff::new(shared.config.backoff_base(), shared.config.backoff_max());

    loop {
        let result = run_once(&shared, &entry, &resolved, generation, &cancel, &mut backoff).await;

        if cancel.is_cancelled() {
            match &result {
                Ok(()) => debug!(channel = %channel, generation, "stream stopped"),
                Err(e) => debug!(channel = %channel, generation, error = %e, "stream stopped"),
            }
            entry.finish_run(generation).await;
            return;
        }

        let err = Error::run_ended(&channel, &result);
        entry.record_error(&err);

        match shared.presence.subscriber_count(&channel).await {
            Ok(0) => {
                info!(channel = %channel, generation, error = %err, "stream ended with no subscribers left");
                entry.finish_run(generation).await;
                return;
            },
            Ok(_) => {},
            Err(e) => {
                warn!(channel = %channel, error = %e, "presence lookup failed, assuming subscribers remain");
            },
        }

        if !entry
            .transition_if_current(generation, StreamState::Backoff)
            .await
        {
            entry.finish_run(generation).await;
            return;
        }

        let delay = backoff.next_delay();
        warn!(
            channel = %channel,
            generation,
            error = %err,
            retry_in_ms = delay.as_millis() as u64,
            "stream ended unexpectedly, retrying"
        );

        tokio::select! {
            () = cancel.cancelled() => {
                debug!(channel = %channel, generation, "retry cancelled");
                entry.finish_run(generation).await;
                return;
            },
            () = tokio::time::sleep(delay) => {},
        }

        match restart(&shared, &entry, generation, &cancel).await {
            Some((next_generation, next)) => {
                generation = next_generation;
                resolved = next;
            },
            None => {
                entry.finish_run(generation).await;
                return;
            },
        }
    }
}

/// `Backoff → Resolving → Running`. Returns the new generation and context,
/// or `None` when the stream should go idle instead.
async fn restart(
    shared: &Shared,
    entry: &SupervisorEntry,
    generation: u64,
    cancel: &CancellationToken,
) -> Option<(u64, ResolvedStream)> {
    match shared.presence.subscriber_count(&entry.channel).await {
        Ok(0) => {
            info!(channel = %entry.channel, generation, "no subscribers left, not restarting stream");
            return None;
        },
        Ok(_) => {},
        Err(e) => {
            warn!(channel = %entry.channel, error = %e, "presence lookup failed, assuming subscribers remain");
        },
    }

    let mut slot = entry.slot.lock().await;
    let owned = slot
        .handle
        .as_ref()
        .is_some_and(|h| h.generation == generation);
    if !owned || cancel.is_cancelled() {
        return None;
    }

    entry.set_state(StreamState::Resolving);
    let resolved = match shared.resolve(&entry.channel, cancel).await {
        Ok(resolved) => resolved,
        Err(_) if cancel.is_cancelled() => return None,
        Err(e) => {
            error!(channel = %entry.channel, error = %e, "plugin context unavailable, not retrying stream");
            entry.record_error(&e);
            if let Some(handle) = slot.take_handle() {
                entry.advance_generation();
                slot.stopping.push(handle.task);
            }
            entry.set_state(StreamState::Idle);
            return None;
        },
    };

    let next_generation = entry.advance_generation();
    if let Some(handle) = slot.handle.as_mut() {
        handle.generation = next_generation;
        handle.context = resolved.context.clone();
    }
    entry.mark_restarted(&resolved.context);
    #[cfg(feature = "metrics")]
    counter!(stream_metrics::RESTARTS_TOTAL, labels::PLUGIN => resolved.context.plugin_id.clone())
        .increment(1);
    info!(channel = %entry.channel, generation = next_generation, "restarting stream");

    Some((next_generation, resolved))
}

/// One runner invocation. Forwards packets until the runner returns, then
/// hands back its result.
async fn run_once(
    shared: &Shared,
    entry: &SupervisorEntry,
    resolved: &ResolvedStream,
    generation: u64,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::channel(shared.config.packet_queue_capacity.max(1));
    let sender = PacketSender::new(
        entry.channel.clone(),
        generation,
        entry.generation_counter(),
        tx,
    );
    let request = StreamRequest {
        channel: entry.channel.clone(),
        path: resolved.path.clone(),
        plugin_context: resolved.context.clone(),
    };
    let forwarder = Forwarder::new(
        entry.channel.clone(),
        entry.generation_counter(),
        Arc::clone(&shared.sink),
    );

    debug!(
        channel = %entry.channel,
        generation,
        plugin_id = %resolved.context.plugin_id,
        "invoking stream runner"
    );
    #[cfg(feature = "metrics")]
    counter!(stream_metrics::RUNS_STARTED_TOTAL, labels::PLUGIN => resolved.context.plugin_id.clone())
        .increment(1);
    #[cfg(feature = "metrics")]
    let started = tokio::time::Instant::now();

    let runner = Arc::clone(&resolved.runner);
    let run_cancel = cancel.clone();
    let mut run =
        tokio::spawn(async move { runner.run_stream(request, sender, run_cancel).await });

    let result = loop {
        tokio::select! {
            joined = &mut run => {
                break joined.unwrap_or_else(|e| Err(anyhow::anyhow!("stream runner task failed: {e}")));
            },
            Some(packet) = rx.recv() => {
                if forwarder.forward(packet).await == Forwarded::Delivered {
                    backoff.reset();
                }
            },
        }
    };

    // Packets queued right before the runner returned.
    while let Ok(packet) = rx.try_recv() {
        if forwarder.forward(packet).await == Forwarded::Delivered {
            backoff.reset();
        }
    }

    #[cfg(feature = "metrics")]
    histogram!(stream_metrics::RUN_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

    result
}
