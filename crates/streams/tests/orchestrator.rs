#![allow(clippy::unwrap_used, clippy::expect_used)]
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    bytes::Bytes,
    livewire_config::StreamsConfig,
    livewire_streams::{
        ChannelKey, ChannelSink, Error, ErrorKind, PacketSender, PluginContext,
        PluginContextResolver, PresenceTracker, RunnerRegistry, StreamOrchestrator, StreamRequest,
        StreamRunner, StreamState,
    },
    tokio::time::{Instant, sleep},
    tokio_util::sync::CancellationToken,
};

// ── Mocks ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MockResolver {
    contexts: Mutex<HashMap<String, PluginContext>>,
    delay: Option<Duration>,
}

impl MockResolver {
    fn with_datasource(self, uid: &str, plugin_id: &str) -> Self {
        self.put(uid, context(plugin_id, Some(uid), serde_json::json!({})));
        self
    }

    fn put(&self, key: &str, ctx: PluginContext) {
        self.contexts.lock().unwrap().insert(key.to_string(), ctx);
    }

    fn remove(&self, key: &str) {
        self.contexts.lock().unwrap().remove(key);
    }
}

#[async_trait]
impl PluginContextResolver for MockResolver {
    async fn resolve_plugin_context(
        &self,
        plugin_id: &str,
        datasource_uid: &str,
    ) -> anyhow::Result<Option<PluginContext>> {
        if let Some(delay) = self.delay {
            sleep(delay).await;
        }
        let key = if datasource_uid.is_empty() {
            plugin_id
        } else {
            datasource_uid
        };
        Ok(self.contexts.lock().unwrap().get(key).cloned())
    }
}

#[derive(Default)]
struct MockPresence {
    counts: Mutex<HashMap<String, usize>>,
}

impl MockPresence {
    fn set(&self, channel: &str, count: usize) {
        self.counts.lock().unwrap().insert(channel.to_string(), count);
    }
}

#[async_trait]
impl PresenceTracker for MockPresence {
    async fn subscriber_count(&self, channel: &ChannelKey) -> anyhow::Result<usize> {
        Ok(self
            .counts
            .lock()
            .unwrap()
            .get(channel.as_str())
            .copied()
            .unwrap_or(0))
    }
}

#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<(ChannelKey, Bytes)>>,
    reject: AtomicBool,
}

impl RecordingSink {
    fn payloads(&self) -> Vec<Bytes> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    fn count(&self) -> usize {
        self.published.lock().unwrap().len()
    }
}

#[async_trait]
impl ChannelSink for RecordingSink {
    async fn publish(&self, channel: &ChannelKey, payload: Bytes) -> anyhow::Result<()> {
        if self.reject.load(Ordering::SeqCst) {
            anyhow::bail!("client buffer full");
        }
        self.published.lock().unwrap().push((channel.clone(), payload));
        Ok(())
    }
}

/// Emits a packet every 100ms until cancelled.
#[derive(Default)]
struct TickerRunner {
    invocations: AtomicUsize,
    active: AtomicUsize,
    requests: Mutex<Vec<StreamRequest>>,
}

#[async_trait]
impl StreamRunner for TickerRunner {
    async fn run_stream(
        &self,
        request: StreamRequest,
        sender: PacketSender,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.active.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        let mut n = 0u64;
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = sleep(Duration::from_millis(100)) => {
                    n += 1;
                    if sender.send(format!("tick-{n}")).await.is_err() {
                        break;
                    }
                },
            }
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Returns an error right away, optionally after one packet.
#[derive(Default)]
struct FailingRunner {
    emit_first: bool,
    started: Mutex<Vec<Instant>>,
}

impl FailingRunner {
    fn invocations(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    fn gaps(&self) -> Vec<Duration> {
        let started = self.started.lock().unwrap();
        started.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl StreamRunner for FailingRunner {
    async fn run_stream(
        &self,
        _request: StreamRequest,
        sender: PacketSender,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        self.started.lock().unwrap().push(Instant::now());
        if self.emit_first {
            sender.send("hello").await?;
        }
        anyhow::bail!("upstream connection reset")
    }
}

/// Ignores cancellation and keeps going for five seconds.
struct StubbornRunner;

#[async_trait]
impl StreamRunner for StubbornRunner {
    async fn run_stream(
        &self,
        _request: StreamRequest,
        _sender: PacketSender,
        _cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        sleep(Duration::from_secs(5)).await;
        Ok(())
    }
}

/// First run keeps going for a while after cancellation and then tries to
/// send "A"; later runs send "B" once and wait to be cancelled.
#[derive(Default)]
struct LaggardRunner {
    invocations: AtomicUsize,
    late_send_superseded: AtomicBool,
}

#[async_trait]
impl StreamRunner for LaggardRunner {
    async fn run_stream(
        &self,
        _request: StreamRequest,
        sender: PacketSender,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        if self.invocations.fetch_add(1, Ordering::SeqCst) == 0 {
            cancel.cancelled().await;
            sleep(Duration::from_millis(500)).await;
            if let Err(Error::Superseded) = sender.send("A").await {
                self.late_send_superseded.store(true, Ordering::SeqCst);
            }
            return Ok(());
        }
        sender.send("B").await?;
        cancel.cancelled().await;
        Ok(())
    }
}

fn context(plugin_id: &str, datasource_uid: Option<&str>, settings: serde_json::Value) -> PluginContext {
    PluginContext {
        org_id: 1,
        plugin_id: plugin_id.to_string(),
        datasource_uid: datasource_uid.map(str::to_string),
        settings,
        updated_at_ms: 0,
    }
}

struct Harness {
    orchestrator: StreamOrchestrator,
    resolver: Arc<MockResolver>,
    presence: Arc<MockPresence>,
    sink: Arc<RecordingSink>,
}

fn harness(config: StreamsConfig, resolver: MockResolver, runner: Arc<dyn StreamRunner>) -> Harness {
    let resolver = Arc::new(resolver);
    let presence = Arc::new(MockPresence::default());
    let sink = Arc::new(RecordingSink::default());
    let orchestrator = StreamOrchestrator::new(
        config,
        Arc::clone(&resolver) as Arc<dyn PluginContextResolver>,
        Arc::clone(&presence) as Arc<dyn PresenceTracker>,
        Arc::clone(&sink) as Arc<dyn ChannelSink>,
        RunnerRegistry::new().with_runner("loki", runner),
    );
    Harness {
        orchestrator,
        resolver,
        presence,
        sink,
    }
}

fn logs() -> ChannelKey {
    ChannelKey::from("ds/abc/logs")
}

fn loki() -> MockResolver {
    MockResolver::default().with_datasource("abc", "loki")
}

fn assert_gaps(actual: &[Duration], expected_secs: &[u64]) {
    assert!(
        actual.len() >= expected_secs.len(),
        "only {} restarts observed",
        actual.len()
    );
    for (gap, secs) in actual.iter().zip(expected_secs) {
        let expected = Duration::from_secs(*secs);
        let diff = gap.abs_diff(expected);
        assert!(
            diff < Duration::from_millis(50),
            "gap {gap:?}, expected {expected:?} (all gaps: {actual:?})"
        );
    }
}

// ── ensure / release ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn double_ensure_starts_one_run() {
    let runner = Arc::new(TickerRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.presence.set("ds/abc/logs", 1);

    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    sleep(Duration::from_millis(350)).await;

    assert_eq!(runner.invocations.load(Ordering::SeqCst), 1);
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Running));
    assert!(h.sink.count() >= 3);
}

#[tokio::test(start_paused = true)]
async fn concurrent_ensure_starts_one_run() {
    let runner = Arc::new(TickerRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());

    let key = logs();
    let (a, b, c) = tokio::join!(
        h.orchestrator.ensure_stream(&key),
        h.orchestrator.ensure_stream(&key),
        h.orchestrator.ensure_stream(&key),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();
    sleep(Duration::from_millis(50)).await;

    assert_eq!(runner.invocations.load(Ordering::SeqCst), 1);
    assert_eq!(h.orchestrator.streams().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn release_without_subscribers_stops_after_grace() {
    let runner = Arc::new(TickerRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.presence.set("ds/abc/logs", 1);
    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    sleep(Duration::from_millis(250)).await;

    h.presence.set("ds/abc/logs", 0);
    h.orchestrator.release_stream(&logs()).await;

    // Still running inside the grace window.
    sleep(Duration::from_secs(2)).await;
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Running));

    sleep(Duration::from_millis(1500)).await;
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Idle));
    assert_eq!(runner.active.load(Ordering::SeqCst), 0);

    let delivered = h.sink.count();
    sleep(Duration::from_secs(2)).await;
    assert_eq!(h.sink.count(), delivered);
}

#[tokio::test(start_paused = true)]
async fn release_with_subscribers_left_keeps_stream() {
    let runner = Arc::new(TickerRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.presence.set("ds/abc/logs", 2);
    h.orchestrator.ensure_stream(&logs()).await.unwrap();

    h.orchestrator.release_stream(&logs()).await;
    sleep(Duration::from_secs(10)).await;

    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Running));
    assert_eq!(runner.invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn ensure_during_grace_cancels_teardown() {
    let runner = Arc::new(TickerRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    h.orchestrator.release_stream(&logs()).await;

    sleep(Duration::from_secs(1)).await;
    h.presence.set("ds/abc/logs", 1);
    h.orchestrator.ensure_stream(&logs()).await.unwrap();

    sleep(Duration::from_secs(5)).await;
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Running));
    assert_eq!(runner.invocations.load(Ordering::SeqCst), 1);
    assert_eq!(runner.active.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn grace_expiry_rechecks_presence() {
    let runner = Arc::new(TickerRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    h.orchestrator.release_stream(&logs()).await;

    // Subscriber shows up without going through ensure_stream.
    sleep(Duration::from_secs(1)).await;
    h.presence.set("ds/abc/logs", 1);

    sleep(Duration::from_secs(4)).await;
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Running));
    assert_eq!(runner.active.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn ensure_after_teardown_starts_fresh_run() {
    let runner = Arc::new(TickerRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    let first = h.orchestrator.stream("ds/abc/logs").unwrap().generation;

    h.orchestrator.release_stream(&logs()).await;
    sleep(Duration::from_secs(4)).await;
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Idle));

    h.presence.set("ds/abc/logs", 1);
    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    sleep(Duration::from_millis(50)).await;

    let info = h.orchestrator.stream("ds/abc/logs").unwrap();
    assert_eq!(info.state, StreamState::Running);
    assert!(info.generation > first);
    assert_eq!(runner.invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn release_of_unknown_channel_is_a_no_op() {
    let h = harness(StreamsConfig::default(), loki(), Arc::new(TickerRunner::default()));
    h.orchestrator.release_stream(&ChannelKey::from("ds/zzz/logs")).await;
    assert!(h.orchestrator.streams().is_empty());
}

// ── configuration errors ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unknown_datasource_is_a_configuration_error() {
    let runner = Arc::new(TickerRunner::default());
    let h = harness(StreamsConfig::default(), MockResolver::default(), runner.clone());

    let err = h.orchestrator.ensure_stream(&logs()).await.unwrap_err();
    assert!(matches!(err, Error::PluginNotFound { .. }), "{err}");
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(h.orchestrator.state("ds/abc/logs").is_none());
    assert!(h.orchestrator.streams().is_empty());
    assert_eq!(runner.invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn malformed_channels_are_rejected() {
    let h = harness(StreamsConfig::default(), loki(), Arc::new(TickerRunner::default()));

    for key in ["grafana/dashboard/abc", "ds/abc", "ds//logs", "plugin/loki/"] {
        let err = h
            .orchestrator
            .ensure_stream(&ChannelKey::from(key))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidChannel { .. }), "{key}: {err}");
        assert!(err.is_configuration());
    }
    assert!(h.orchestrator.streams().is_empty());
}

#[tokio::test(start_paused = true)]
async fn plugin_without_runner_is_a_configuration_error() {
    let resolver = loki().with_datasource("xyz", "tempo");
    let h = harness(StreamsConfig::default(), resolver, Arc::new(TickerRunner::default()));

    let err = h
        .orchestrator
        .ensure_stream(&ChannelKey::from("ds/xyz/traces"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RunnerNotFound { ref plugin_id } if plugin_id == "tempo"));
    assert!(h.orchestrator.state("ds/xyz/traces").is_none());
}

#[tokio::test(start_paused = true)]
async fn plugin_scoped_channels_resolve_by_plugin_id() {
    let runner = Arc::new(TickerRunner::default());
    let resolver = MockResolver::default();
    resolver.put("loki", context("loki", None, serde_json::json!({ "tail": true })));
    let h = harness(StreamsConfig::default(), resolver, runner.clone());

    h.orchestrator
        .ensure_stream(&ChannelKey::from("plugin/loki/tail/app"))
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    let requests = runner.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "tail/app");
    assert!(requests[0].plugin_context.datasource_uid.is_none());
}

#[tokio::test(start_paused = true)]
async fn slow_resolver_times_out() {
    let resolver = MockResolver {
        delay: Some(Duration::from_secs(20)),
        ..loki()
    };
    let config = StreamsConfig {
        resolve_timeout_ms: 10_000,
        ..StreamsConfig::default()
    };
    let h = harness(config, resolver, Arc::new(TickerRunner::default()));

    let started = Instant::now();
    let err = h.orchestrator.ensure_stream(&logs()).await.unwrap_err();
    assert!(matches!(err, Error::ResolveTimeout { .. }), "{err}");
    assert!(started.elapsed() < Duration::from_secs(11));
    assert!(h.orchestrator.state("ds/abc/logs").is_none());
}

// ── restarts and backoff ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn backoff_doubles_up_to_the_cap() {
    let runner = Arc::new(FailingRunner::default());
    let config = StreamsConfig {
        backoff_base_ms: 1_000,
        backoff_max_ms: 8_000,
        ..StreamsConfig::default()
    };
    let h = harness(config, loki(), runner.clone());
    h.presence.set("ds/abc/logs", 1);

    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    sleep(Duration::from_secs(40)).await;

    assert_gaps(&runner.gaps(), &[1, 2, 4, 8, 8]);
    let info = h.orchestrator.stream("ds/abc/logs").unwrap();
    assert!(info.restarts >= 5);
    assert!(
        info.last_error
            .as_deref()
            .is_some_and(|e| e.contains("upstream connection reset"))
    );
}

#[tokio::test(start_paused = true)]
async fn delivery_resets_backoff() {
    let runner = Arc::new(FailingRunner {
        emit_first: true,
        ..FailingRunner::default()
    });
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.presence.set("ds/abc/logs", 1);

    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    sleep(Duration::from_millis(4500)).await;

    assert_gaps(&runner.gaps(), &[1, 1, 1, 1]);
    assert!(h.sink.count() >= 4);
}

#[tokio::test(start_paused = true)]
async fn unexpected_end_without_subscribers_goes_idle() {
    let runner = Arc::new(FailingRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());

    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    sleep(Duration::from_secs(10)).await;

    assert_eq!(runner.invocations(), 1);
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Idle));
}

#[tokio::test(start_paused = true)]
async fn failed_re_resolution_stops_retrying() {
    let runner = Arc::new(FailingRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.presence.set("ds/abc/logs", 1);

    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    h.resolver.remove("abc");
    sleep(Duration::from_secs(10)).await;

    assert_eq!(runner.invocations(), 1);
    let info = h.orchestrator.stream("ds/abc/logs").unwrap();
    assert_eq!(info.state, StreamState::Idle);
    assert!(info.last_error.unwrap().contains("not found"));
}

#[tokio::test(start_paused = true)]
async fn release_during_backoff_stops_without_grace() {
    let runner = Arc::new(FailingRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.presence.set("ds/abc/logs", 1);

    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Backoff));

    h.presence.set("ds/abc/logs", 0);
    h.orchestrator.release_stream(&logs()).await;
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Idle));

    // Past the 1s retry delay and the 3s grace period.
    sleep(Duration::from_millis(1500)).await;
    assert_eq!(runner.invocations(), 1);
    sleep(Duration::from_secs(30)).await;
    assert_eq!(runner.invocations(), 1);
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Idle));
}

#[tokio::test(start_paused = true)]
async fn retry_rechecks_presence_before_restarting() {
    let runner = Arc::new(FailingRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.presence.set("ds/abc/logs", 1);

    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Backoff));

    // Subscriber gone without a release call.
    h.presence.set("ds/abc/logs", 0);
    sleep(Duration::from_millis(1500)).await;

    assert_eq!(runner.invocations(), 1);
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Idle));
}

#[tokio::test(start_paused = true)]
async fn sweep_stops_backoff_channels_at_once() {
    let runner = Arc::new(FailingRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.presence.set("ds/abc/logs", 1);

    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    h.presence.set("ds/abc/logs", 0);
    assert_eq!(h.orchestrator.check_presence().await, 1);
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Idle));

    sleep(Duration::from_secs(5)).await;
    assert_eq!(runner.invocations(), 1);
}

// ── packets ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn superseded_run_cannot_deliver() {
    let runner = Arc::new(LaggardRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    h.orchestrator.release_stream(&logs()).await;

    // Grace expires at 3s; the first run lingers until 3.5s.
    sleep(Duration::from_millis(3100)).await;
    h.presence.set("ds/abc/logs", 1);
    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    sleep(Duration::from_secs(1)).await;

    assert_eq!(runner.invocations.load(Ordering::SeqCst), 2);
    assert!(runner.late_send_superseded.load(Ordering::SeqCst));
    assert_eq!(h.sink.payloads(), vec![Bytes::from_static(b"B")]);
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Running));
}

#[tokio::test(start_paused = true)]
async fn sink_errors_do_not_stop_the_stream() {
    let runner = Arc::new(TickerRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.presence.set("ds/abc/logs", 1);
    h.sink.reject.store(true, Ordering::SeqCst);

    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.sink.count(), 0);
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Running));

    h.sink.reject.store(false, Ordering::SeqCst);
    sleep(Duration::from_millis(550)).await;
    assert!(h.sink.count() >= 4);
    assert_eq!(runner.invocations.load(Ordering::SeqCst), 1);
}

// ── presence sweep ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn check_presence_tears_down_and_prunes() {
    let runner = Arc::new(TickerRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.presence.set("ds/abc/logs", 1);
    h.orchestrator.ensure_stream(&logs()).await.unwrap();

    assert_eq!(h.orchestrator.check_presence().await, 0);

    // Last subscriber vanished without a release call.
    h.presence.set("ds/abc/logs", 0);
    assert_eq!(h.orchestrator.check_presence().await, 1);
    // Already pending.
    assert_eq!(h.orchestrator.check_presence().await, 0);

    sleep(Duration::from_secs(4)).await;
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Idle));

    h.orchestrator.check_presence().await;
    assert!(h.orchestrator.state("ds/abc/logs").is_none());
}

#[tokio::test(start_paused = true)]
async fn presence_watcher_sweeps_periodically() {
    let runner = Arc::new(TickerRunner::default());
    let config = StreamsConfig {
        presence_check_interval_ms: 5_000,
        ..StreamsConfig::default()
    };
    let h = harness(config, loki(), runner.clone());
    h.presence.set("ds/abc/logs", 1);
    h.orchestrator.ensure_stream(&logs()).await.unwrap();

    assert!(h.orchestrator.start_presence_watcher());
    assert!(!h.orchestrator.start_presence_watcher());

    h.presence.set("ds/abc/logs", 0);
    // Sweep at 5s schedules, grace ends at 8s, sweep at 10s prunes.
    sleep(Duration::from_secs(12)).await;

    assert_eq!(runner.active.load(Ordering::SeqCst), 0);
    assert!(h.orchestrator.state("ds/abc/logs").is_none());
}

#[tokio::test(start_paused = true)]
async fn presence_watcher_can_be_disabled() {
    let config = StreamsConfig {
        presence_check_interval_ms: 0,
        ..StreamsConfig::default()
    };
    let h = harness(config, loki(), Arc::new(TickerRunner::default()));
    assert!(!h.orchestrator.start_presence_watcher());
}

// ── datasource lifecycle ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn datasource_update_restarts_with_new_settings() {
    let runner = Arc::new(TickerRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.presence.set("ds/abc/logs", 1);
    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    let before = h.orchestrator.stream("ds/abc/logs").unwrap().generation;

    h.resolver.put(
        "abc",
        context("loki", Some("abc"), serde_json::json!({ "url": "http://loki:3100" })),
    );
    assert_eq!(h.orchestrator.handle_datasource_update("abc").await, 1);
    assert_eq!(h.orchestrator.handle_datasource_update("other").await, 0);
    sleep(Duration::from_millis(50)).await;

    let info = h.orchestrator.stream("ds/abc/logs").unwrap();
    assert_eq!(info.state, StreamState::Running);
    assert!(info.generation > before);
    assert_eq!(runner.invocations.load(Ordering::SeqCst), 2);
    assert_eq!(runner.active.load(Ordering::SeqCst), 1);

    let requests = runner.requests.lock().unwrap();
    assert_eq!(
        requests.last().unwrap().plugin_context.settings["url"],
        "http://loki:3100"
    );
}

#[tokio::test(start_paused = true)]
async fn datasource_delete_stops_streams_immediately() {
    let runner = Arc::new(TickerRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.presence.set("ds/abc/logs", 1);
    h.presence.set("ds/abc/metrics", 1);
    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    h.orchestrator
        .ensure_stream(&ChannelKey::from("ds/abc/metrics"))
        .await
        .unwrap();

    h.resolver.remove("abc");
    assert_eq!(h.orchestrator.handle_datasource_delete("abc").await, 2);
    sleep(Duration::from_millis(50)).await;

    assert!(h.orchestrator.streams().is_empty());
    assert_eq!(runner.active.load(Ordering::SeqCst), 0);
}

// ── shutdown ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn shutdown_abandons_runs_that_ignore_cancellation() {
    let h = harness(StreamsConfig::default(), loki(), Arc::new(StubbornRunner));
    h.presence.set("ds/abc/logs", 1);
    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let report = h.orchestrator.shutdown(Duration::from_secs(2)).await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(2), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(2500), "{elapsed:?}");
    assert_eq!(report.abandoned, vec![logs()]);
    assert!(report.stopped.is_empty());
    assert!(h.orchestrator.stream("ds/abc/logs").unwrap().abandoned);
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_cooperative_runs() {
    let runner = Arc::new(TickerRunner::default());
    let h = harness(StreamsConfig::default(), loki(), runner.clone());
    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    sleep(Duration::from_millis(250)).await;

    let started = Instant::now();
    let report = h.orchestrator.shutdown(Duration::from_secs(5)).await;

    assert!(started.elapsed() < Duration::from_millis(100));
    assert_eq!(report.stopped, vec![logs()]);
    assert!(report.abandoned.is_empty());
    assert_eq!(runner.active.load(Ordering::SeqCst), 0);
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Idle));
}

#[tokio::test(start_paused = true)]
async fn ensure_after_shutdown_is_refused() {
    let h = harness(StreamsConfig::default(), loki(), Arc::new(TickerRunner::default()));
    let report = h.orchestrator.shutdown(Duration::from_secs(1)).await;
    assert!(report.stopped.is_empty() && report.abandoned.is_empty());

    let err = h.orchestrator.ensure_stream(&logs()).await.unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
    assert_eq!(err.kind(), ErrorKind::Cancellation);
}

#[tokio::test(start_paused = true)]
async fn shutdown_after_teardown_reports_nothing() {
    let h = harness(StreamsConfig::default(), loki(), Arc::new(TickerRunner::default()));
    h.orchestrator.ensure_stream(&logs()).await.unwrap();
    h.orchestrator.release_stream(&logs()).await;
    sleep(Duration::from_secs(4)).await;
    assert_eq!(h.orchestrator.state("ds/abc/logs"), Some(StreamState::Idle));

    let report = h.orchestrator.shutdown(Duration::from_secs(1)).await;
    assert!(report.stopped.is_empty(), "{report:?}");
    assert!(report.abandoned.is_empty(), "{report:?}");
}
