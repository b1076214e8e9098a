use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use {
    tokio::{task::JoinHandle, time::Instant},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use livewire_config::StreamsConfig;

#[cfg(feature = "metrics")]
use livewire_metrics::{
    counter, gauge, histogram, labels, resolve as resolve_metrics, streams as stream_metrics,
};

use crate::{
    channel::ChannelKey,
    error::{Error, Result},
    plugin::{ChannelSink, PluginContextResolver, PresenceTracker},
    registry::RunnerRegistry,
    supervisor::{
        PendingTeardown, ResolvedStream, Slot, StreamHandle, StreamInfo, StreamState,
        SupervisorEntry, supervise,
    },
    watcher,
};

/// Outcome of [`StreamOrchestrator::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Channels whose runs exited before the deadline.
    pub stopped: Vec<ChannelKey>,
    /// Channels still running at the deadline; left to finish on their own.
    pub abandoned: Vec<ChannelKey>,
}

/// State shared between the orchestrator facade and its background tasks.
pub(crate) struct Shared {
    pub(crate) config: StreamsConfig,
    resolver: Arc<dyn PluginContextResolver>,
    pub(crate) presence: Arc<dyn PresenceTracker>,
    pub(crate) sink: Arc<dyn ChannelSink>,
    runners: RunnerRegistry,
    registry: RwLock<HashMap<ChannelKey, Arc<SupervisorEntry>>>,
    /// Supervisor tasks of entries removed from the registry while their run
    /// was still winding down. Shutdown waits on these too.
    detached: Mutex<Vec<(Arc<SupervisorEntry>, JoinHandle<()>)>>,
    pub(crate) root: CancellationToken,
}

impl Shared {
    pub(crate) fn entry(&self, channel: &str) -> Option<Arc<SupervisorEntry>> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        registry.get(channel).cloned()
    }

    pub(crate) fn entries(&self) -> Vec<Arc<SupervisorEntry>> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        registry.values().cloned().collect()
    }

    fn entry_or_insert(&self, channel: &ChannelKey) -> Arc<SupervisorEntry> {
        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            registry
                .entry(channel.clone())
                .or_insert_with(|| Arc::new(SupervisorEntry::new(channel.clone()))),
        )
    }

    /// Look up the plugin context and runner for `channel`, bounded by the
    /// resolve timeout and abandoned as soon as `cancel` fires.
    pub(crate) async fn resolve(
        &self,
        channel: &ChannelKey,
        cancel: &CancellationToken,
    ) -> Result<ResolvedStream> {
        let address = channel.address()?;
        let timeout = self.config.resolve_timeout();
        #[cfg(feature = "metrics")]
        let started = Instant::now();

        let lookup = self
            .resolver
            .resolve_plugin_context(address.plugin_id(), address.datasource_uid());
        let outcome = tokio::select! {
            () = cancel.cancelled() => return Err(Error::ShuttingDown),
            outcome = tokio::time::timeout(timeout, lookup) => outcome,
        };

        #[cfg(feature = "metrics")]
        histogram!(resolve_metrics::DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        let result = match outcome {
            Err(_) => Err(Error::ResolveTimeout {
                channel: channel.clone(),
                timeout,
            }),
            Ok(Err(e)) => Err(Error::Resolve {
                channel: channel.clone(),
                source: e.into(),
            }),
            Ok(Ok(None)) => Err(Error::PluginNotFound {
                channel: channel.clone(),
                plugin_id: address.plugin_id().to_string(),
                datasource_uid: address.datasource_uid().to_string(),
            }),
            Ok(Ok(Some(context))) => match self.runners.get(&context.plugin_id) {
                Some(runner) => Ok(ResolvedStream {
                    context,
                    runner,
                    path: address.path,
                }),
                None => Err(Error::RunnerNotFound {
                    plugin_id: context.plugin_id,
                }),
            },
        };

        #[cfg(feature = "metrics")]
        if let Err(e) = &result {
            let reason = match e {
                Error::ResolveTimeout { .. } => "timeout",
                Error::PluginNotFound { .. } => "not_found",
                Error::RunnerNotFound { .. } => "no_runner",
                _ => "error",
            };
            counter!(resolve_metrics::FAILURES_TOTAL, labels::REASON => reason).increment(1);
        }
        result
    }

    async fn ensure(self: &Arc<Self>, channel: &ChannelKey) -> Result<()> {
        loop {
            if self.root.is_cancelled() {
                return Err(Error::ShuttingDown);
            }
            let entry = self.entry_or_insert(channel);
            let mut slot = entry.slot.lock().await;
            if slot.retired {
                continue;
            }
            if let Some(pending) = slot.teardown.take() {
                pending.cancel.cancel();
                debug!(channel = %channel, "pending teardown cancelled by new subscriber");
            }
            if slot.handle.is_some() {
                return Ok(());
            }

            entry.set_state(StreamState::Resolving);
            return match self.resolve(channel, &self.root).await {
                Ok(resolved) => {
                    self.start_locked(&entry, &mut slot, resolved);
                    Ok(())
                },
                Err(e) => {
                    warn!(channel = %channel, error = %e, "cannot start stream");
                    entry.record_error(&e);
                    entry.set_state(StreamState::Idle);
                    self.retire_locked(&entry, &mut slot);
                    Err(e)
                },
            };
        }
    }

    fn start_locked(
        self: &Arc<Self>,
        entry: &Arc<SupervisorEntry>,
        slot: &mut Slot,
        resolved: ResolvedStream,
    ) {
        let generation = entry.advance_generation();
        let cancel = self.root.child_token();
        let context = resolved.context.clone();
        entry.mark_started(&context);
        info!(
            channel = %entry.channel,
            generation,
            plugin_id = %context.plugin_id,
            "stream started"
        );

        let task = tokio::spawn(supervise(
            Arc::clone(self),
            Arc::clone(entry),
            resolved,
            generation,
            cancel.clone(),
        ));
        slot.prune_stopping();
        slot.handle = Some(StreamHandle {
            generation,
            context,
            cancel,
            task,
        });
        #[cfg(feature = "metrics")]
        gauge!(stream_metrics::ACTIVE).increment(1.0);
    }

    /// Signal the current run to stop and invalidate its packets. Returns
    /// `false` when nothing was running.
    fn stop_locked(&self, entry: &SupervisorEntry, slot: &mut Slot) -> bool {
        if let Some(pending) = slot.teardown.take() {
            pending.cancel.cancel();
        }
        let Some(handle) = slot.take_handle() else {
            return false;
        };
        entry.advance_generation();
        handle.cancel.cancel();
        entry.set_state(StreamState::Stopping);
        slot.stopping.push(handle.task);
        true
    }

    /// Drop the entry from the registry. Later callers create a fresh one.
    pub(crate) fn retire_locked(&self, entry: &Arc<SupervisorEntry>, slot: &mut Slot) {
        slot.retired = true;
        let winding_down: Vec<_> = slot
            .stopping
            .drain(..)
            .filter(|task| !task.is_finished())
            .map(|task| (Arc::clone(entry), task))
            .collect();
        if !winding_down.is_empty() {
            let mut detached = self.detached.lock().unwrap_or_else(|e| e.into_inner());
            detached.retain(|(_, task)| !task.is_finished());
            detached.extend(winding_down);
        }

        let mut registry = self.registry.write().unwrap_or_else(|e| e.into_inner());
        if registry
            .get(&entry.channel)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            registry.remove(&entry.channel);
        }
    }

    /// Forget detached supervisor tasks that have exited.
    pub(crate) fn prune_detached(&self) {
        self.detached
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(_, task)| !task.is_finished());
    }

    /// Stop a channel that is waiting out a retry delay. Nothing is running
    /// there, so there is no grace period. Returns `false` if the channel is
    /// not in backoff.
    pub(crate) async fn stop_backoff(&self, entry: &SupervisorEntry) -> bool {
        let mut slot = entry.slot.lock().await;
        if entry.state() != StreamState::Backoff || !self.stop_locked(entry, &mut slot) {
            return false;
        }
        entry.set_state(StreamState::Idle);
        info!(channel = %entry.channel, "no subscribers, dropping stream retry");
        #[cfg(feature = "metrics")]
        counter!(stream_metrics::TEARDOWNS_TOTAL).increment(1);
        true
    }

    async fn release(self: &Arc<Self>, channel: &ChannelKey) {
        let Some(entry) = self.entry(channel.as_str()) else {
            debug!(channel = %channel, "release for channel without stream");
            return;
        };
        match self.presence.subscriber_count(channel).await {
            Ok(0) => {
                if !self.stop_backoff(&entry).await {
                    self.schedule_teardown(&entry).await;
                }
            },
            Ok(subscribers) => {
                debug!(channel = %channel, subscribers, "channel still has subscribers");
            },
            Err(e) => {
                warn!(channel = %channel, error = %e, "presence lookup failed, keeping stream");
            },
        }
    }

    /// Arm the grace timer for `entry`. Returns `false` if there is nothing
    /// to tear down or a teardown is already pending.
    pub(crate) async fn schedule_teardown(self: &Arc<Self>, entry: &Arc<SupervisorEntry>) -> bool {
        let mut slot = entry.slot.lock().await;
        if slot.handle.is_none() || slot.teardown.is_some() {
            return false;
        }
        slot.next_teardown_id += 1;
        let id = slot.next_teardown_id;
        let cancel = self.root.child_token();
        slot.teardown = Some(PendingTeardown {
            id,
            cancel: cancel.clone(),
        });
        drop(slot);

        let grace = self.config.grace_period();
        debug!(
            channel = %entry.channel,
            grace_ms = grace.as_millis() as u64,
            "no subscribers, scheduling teardown"
        );

        let shared = Arc::clone(self);
        let entry = Arc::clone(entry);
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {},
                () = tokio::time::sleep(grace) => shared.finish_teardown(&entry, id).await,
            }
        });
        true
    }

    /// Grace window elapsed: check presence once more and stop if still zero.
    async fn finish_teardown(&self, entry: &SupervisorEntry, id: u64) {
        let presence = self.presence.subscriber_count(&entry.channel).await;

        let mut slot = entry.slot.lock().await;
        if slot.teardown.as_ref().is_none_or(|pending| pending.id != id) {
            return;
        }
        slot.teardown = None;

        match presence {
            Ok(0) => {
                if self.stop_locked(entry, &mut slot) {
                    info!(channel = %entry.channel, "no subscribers after grace period, stopping stream");
                    #[cfg(feature = "metrics")]
                    counter!(stream_metrics::TEARDOWNS_TOTAL).increment(1);
                }
            },
            Ok(subscribers) => {
                debug!(channel = %entry.channel, subscribers, "subscribers returned during grace period");
            },
            Err(e) => {
                warn!(channel = %entry.channel, error = %e, "presence lookup failed, keeping stream");
            },
        }
    }

    async fn restart_datasource(self: &Arc<Self>, datasource_uid: &str) -> usize {
        let mut restarted = 0;
        for entry in self.entries() {
            let mut slot = entry.slot.lock().await;
            let bound = slot
                .handle
                .as_ref()
                .is_some_and(|h| h.serves_datasource(datasource_uid));
            if !bound {
                continue;
            }

            self.stop_locked(&entry, &mut slot);
            entry.set_state(StreamState::Resolving);
            match self.resolve(&entry.channel, &self.root).await {
                Ok(resolved) => {
                    self.start_locked(&entry, &mut slot, resolved);
                    restarted += 1;
                },
                Err(e) => {
                    warn!(
                        channel = %entry.channel,
                        datasource_uid,
                        error = %e,
                        "stream not restarted after datasource update"
                    );
                    entry.record_error(&e);
                    entry.set_state(StreamState::Idle);
                },
            }
        }
        restarted
    }

    async fn remove_datasource(&self, datasource_uid: &str) -> usize {
        let mut removed = 0;
        for entry in self.entries() {
            let mut slot = entry.slot.lock().await;
            let bound = slot
                .handle
                .as_ref()
                .is_some_and(|h| h.serves_datasource(datasource_uid));
            if !bound {
                continue;
            }
            self.stop_locked(&entry, &mut slot);
            self.retire_locked(&entry, &mut slot);
            info!(channel = %entry.channel, datasource_uid, "datasource deleted, stream stopped");
            removed += 1;
        }
        removed
    }

    async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        let deadline_at = Instant::now() + deadline;
        self.root.cancel();

        let entries = self.entries();
        info!(
            streams = entries.len(),
            deadline_ms = deadline.as_millis() as u64,
            "shutting down stream orchestrator"
        );

        let mut tasks: Vec<(Arc<SupervisorEntry>, JoinHandle<()>)> =
            std::mem::take(&mut *self.detached.lock().unwrap_or_else(|e| e.into_inner()))
                .into_iter()
                .filter(|(_, task)| !task.is_finished())
                .collect();
        let mut finished: BTreeMap<ChannelKey, bool> = BTreeMap::new();

        for entry in entries {
            match tokio::time::timeout_at(deadline_at, entry.slot.lock()).await {
                Ok(mut slot) => {
                    self.stop_locked(&entry, &mut slot);
                    tasks.extend(
                        slot.stopping
                            .drain(..)
                            .filter(|task| !task.is_finished())
                            .map(|task| (Arc::clone(&entry), task)),
                    );
                },
                Err(_) => {
                    finished.insert(entry.channel.clone(), false);
                    entry.mark_abandoned();
                },
            }
        }

        let waiting = futures::future::join_all(tasks.iter_mut().map(|(_, task)| task));
        if tokio::time::timeout_at(deadline_at, waiting).await.is_err() {
            debug!("shutdown deadline reached with streams still running");
        }

        for (entry, task) in &tasks {
            let done = task.is_finished();
            let all_done = finished.entry(entry.channel.clone()).or_insert(true);
            *all_done &= done;
            if !done {
                entry.mark_abandoned();
            }
        }

        let mut report = ShutdownReport::default();
        for (channel, done) in finished {
            if done {
                report.stopped.push(channel);
            } else {
                warn!(channel = %channel, "stream did not stop before shutdown deadline, abandoning");
                #[cfg(feature = "metrics")]
                counter!(stream_metrics::ABANDONED_TOTAL).increment(1);
                report.abandoned.push(channel);
            }
        }
        info!(
            stopped = report.stopped.len(),
            abandoned = report.abandoned.len(),
            "stream orchestrator shut down"
        );
        report
    }
}

/// Runs plugin streams for channels that have subscribers.
///
/// Call [`ensure_stream`](Self::ensure_stream) when a subscriber joins a
/// channel and [`release_stream`](Self::release_stream) when one leaves. The
/// orchestrator starts at most one run per channel, forwards its packets to
/// the [`ChannelSink`], restarts it with backoff when it ends unexpectedly,
/// and stops it once the channel has had no subscribers for the grace period.
pub struct StreamOrchestrator {
    shared: Arc<Shared>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl StreamOrchestrator {
    pub fn new(
        config: StreamsConfig,
        resolver: Arc<dyn PluginContextResolver>,
        presence: Arc<dyn PresenceTracker>,
        sink: Arc<dyn ChannelSink>,
        runners: RunnerRegistry,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                resolver,
                presence,
                sink,
                runners,
                registry: RwLock::new(HashMap::new()),
                detached: Mutex::new(Vec::new()),
                root: CancellationToken::new(),
            }),
            watcher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &StreamsConfig {
        &self.shared.config
    }

    /// Make sure a stream runs for `channel`.
    ///
    /// Returns once the run has been scheduled. Fails only when the channel
    /// cannot be served (bad key, unknown plugin or datasource, resolver
    /// error or timeout); failures after that are retried in the background.
    ///
    /// The channel's transition lock is held while the plugin context is
    /// resolved, so this call and any concurrent release or datasource
    /// handler for the same channel can wait up to the resolve timeout.
    pub async fn ensure_stream(&self, channel: &ChannelKey) -> Result<()> {
        self.shared.ensure(channel).await
    }

    /// A subscriber left `channel`. If nobody is listening any more the
    /// stream stops after the grace period, unless someone subscribes again.
    pub async fn release_stream(&self, channel: &ChannelKey) {
        self.shared.release(channel).await;
    }

    /// Stop every stream and wait up to `deadline` for the runs to exit.
    ///
    /// Runs that ignore cancellation are not waited for past the deadline;
    /// they are reported as abandoned. New streams are refused afterwards.
    pub async fn shutdown(&self, deadline: Duration) -> ShutdownReport {
        self.shared.shutdown(deadline).await
    }

    /// Spawn the periodic presence sweep, if configured and not yet running.
    pub fn start_presence_watcher(&self) -> bool {
        let Some(interval) = self.shared.config.presence_check_interval() else {
            return false;
        };
        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if watcher.as_ref().is_some_and(|task| !task.is_finished()) {
            return false;
        }
        *watcher = Some(tokio::spawn(watcher::run_presence_watcher(
            Arc::clone(&self.shared),
            interval,
        )));
        true
    }

    /// Run one presence sweep now. Returns the number of channels whose
    /// teardown was scheduled, or that were stopped at once while in backoff.
    pub async fn check_presence(&self) -> usize {
        watcher::sweep_presence(&self.shared).await
    }

    /// A datasource's settings changed: restart its streams with a freshly
    /// resolved context. Returns the number of streams restarted.
    pub async fn handle_datasource_update(&self, datasource_uid: &str) -> usize {
        self.shared.restart_datasource(datasource_uid).await
    }

    /// A datasource was deleted: stop its streams immediately and forget
    /// their channels. Returns the number of streams stopped.
    pub async fn handle_datasource_delete(&self, datasource_uid: &str) -> usize {
        self.shared.remove_datasource(datasource_uid).await
    }

    /// Snapshot of every tracked channel, sorted by key.
    pub fn streams(&self) -> Vec<StreamInfo> {
        let mut streams: Vec<StreamInfo> =
            self.shared.entries().iter().map(|e| e.info()).collect();
        streams.sort_by(|a, b| a.channel.cmp(&b.channel));
        streams
    }

    pub fn stream(&self, channel: &str) -> Option<StreamInfo> {
        self.shared.entry(channel).map(|e| e.info())
    }

    pub fn state(&self, channel: &str) -> Option<StreamState> {
        self.shared.entry(channel).map(|e| e.state())
    }
}

impl Drop for StreamOrchestrator {
    fn drop(&mut self) {
        self.shared.root.cancel();
    }
}
