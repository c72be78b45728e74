//! Stream Worker (spec §4.5): the per-stream state machine. Three
//! cooperating tasks — Read, Transform, Write — connected by two bounded
//! `tokio::mpsc` queues, generalized from `fc-router`'s pool/manager split
//! (there: consumer poll loop → per-group worker task; here: source poll
//! loop → transform → fan-out write, one pipeline per stream instead of
//! per message group).

mod circuit_breaker;

pub use circuit_breaker::{backoff_delay, BreakerState, CircuitBreaker};

use chrono::Utc;
use rc_checkpoint::CheckpointStore;
use rc_common::{
    Checkpoint, ReplicatorError, RetryPolicy, StreamConfig, StreamMetrics, StreamState, StreamStatus,
    UnresumablePolicy,
};
use rc_sink::SinkWriter;
use rc_source::{NextOutcome, SourceReader};
use rc_transform::{TransformEngine, TransformOutcome};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

const HEARTBEAT_DEADLINE: Duration = Duration::from_secs(1);
const BREAKER_CLOSED_RETRY_WAIT: Duration = Duration::from_millis(500);

/// Shared, concurrently-readable state a worker's tasks all touch.
struct Shared {
    name: String,
    state: RwLock<StreamState>,
    metrics: RwLock<StreamMetrics>,
    paused: AtomicBool,
    pause_notify: Notify,
    stop_requested: AtomicBool,
}

impl Shared {
    fn new(name: String) -> Self {
        Self {
            state: RwLock::new(StreamState::new(name.clone())),
            metrics: RwLock::new(StreamMetrics::default()),
            paused: AtomicBool::new(false),
            pause_notify: Notify::new(),
            stop_requested: AtomicBool::new(false),
            name,
        }
    }

    async fn set_status(&self, status: StreamStatus) {
        self.state.write().await.status = status;
    }

    async fn set_error(&self, message: String) {
        let mut state = self.state.write().await;
        state.status = StreamStatus::Error;
        state.error_count += 1;
        state.last_error = Some(message);
    }
}

struct RunningTasks {
    read: JoinHandle<()>,
    transform: JoinHandle<()>,
    write: JoinHandle<()>,
}

pub struct StreamWorker {
    config: StreamConfig,
    shared: Arc<Shared>,
    running: tokio::sync::Mutex<Option<RunningTasks>>,
}

impl StreamWorker {
    pub fn new(config: StreamConfig) -> Self {
        let shared = Arc::new(Shared::new(config.name.clone()));
        Self { config, shared, running: tokio::sync::Mutex::new(None) }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub async fn snapshot(&self) -> StreamState {
        self.shared.state.read().await.clone()
    }

    pub async fn metrics(&self) -> StreamMetrics {
        self.shared.metrics.read().await.clone()
    }

    /// Starts the three-task pipeline. `source` is exclusively owned by the
    /// Read task for its lifetime; `sinks` are fanned out to by the Write
    /// task in declaration order.
    pub async fn start(
        &self,
        mut source: Box<dyn SourceReader>,
        sinks: Vec<Arc<dyn SinkWriter>>,
        checkpoint_store: Arc<dyn CheckpointStore>,
    ) -> rc_common::Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ReplicatorError::fatal("worker already started"));
        }

        self.shared.set_status(StreamStatus::Starting).await;
        self.shared.stop_requested.store(false, Ordering::SeqCst);
        self.shared.paused.store(false, Ordering::SeqCst);

        let resume_position = checkpoint_store
            .load(&self.config.name)
            .await?
            .map(|checkpoint| checkpoint.position);

        match source.open(resume_position.clone()).await {
            Ok(()) => {}
            Err(ReplicatorError::Unresumable(reason)) => {
                match self.config.on_unresumable {
                    UnresumablePolicy::Tail => {
                        warn!(stream = %self.config.name, reason = %reason, "resume position unresumable, restarting from tail");
                        source.open(None).await?;
                    }
                    UnresumablePolicy::Fail => {
                        self.shared.set_error(format!("unresumable: {reason}")).await;
                        return Err(ReplicatorError::Unresumable(reason));
                    }
                }
            }
            Err(e) => {
                self.shared.set_error(e.to_string()).await;
                return Err(e);
            }
        }

        let transform = TransformEngine::new(&self.config.transform_rules, self.config.transform_policy);
        let breakers: Vec<Arc<CircuitBreaker>> =
            sinks.iter().map(|_| Arc::new(CircuitBreaker::new(self.config.circuit_breaker))).collect();

        let (tx1, rx1) = mpsc::channel(self.config.queue_capacity);
        let (tx2, rx2) = mpsc::channel(self.config.queue_capacity);

        let read_shared = self.shared.clone_ref();
        let read_handle = tokio::spawn(read_task(read_shared, source, tx1));

        let transform_shared = self.shared.clone_ref();
        let transform_handle = tokio::spawn(transform_task(transform_shared, rx1, tx2, transform));

        let write_shared = self.shared.clone_ref();
        let write_handle = tokio::spawn(write_task(
            write_shared,
            rx2,
            sinks,
            breakers,
            self.config.retry_policy.clone(),
            checkpoint_store,
            Duration::from_millis(self.config.checkpoint_interval_ms),
        ));

        *running = Some(RunningTasks { read: read_handle, transform: transform_handle, write: write_handle });
        drop(running);

        let mut state = self.shared.state.write().await;
        state.status = StreamStatus::Running;
        state.started_at = Some(Utc::now());
        Ok(())
    }

    pub async fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        self.shared.set_status(StreamStatus::Paused).await;
    }

    pub async fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.pause_notify.notify_waiters();
        self.shared.set_status(StreamStatus::Running).await;
    }

    /// Requests a controlled stop and waits up to `deadline` for the
    /// pipeline to drain. In-flight work is abandoned (tasks aborted,
    /// nothing further checkpointed) if the deadline elapses.
    pub async fn stop(&self, deadline: Duration) -> rc_common::Result<()> {
        self.shared.set_status(StreamStatus::Stopping).await;
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.pause_notify.notify_waiters();

        let tasks = self.running.lock().await.take();
        let Some(tasks) = tasks else {
            self.shared.set_status(StreamStatus::Stopped).await;
            return Ok(());
        };

        let (read_abort, transform_abort, write_abort) =
            (tasks.read.abort_handle(), tasks.transform.abort_handle(), tasks.write.abort_handle());

        let drained = tokio::time::timeout(deadline, async {
            let _ = tasks.read.await;
            let _ = tasks.transform.await;
            let _ = tasks.write.await;
        })
        .await;

        if drained.is_err() {
            warn!(stream = %self.config.name, "stop deadline elapsed, abandoning in-flight work");
            read_abort.abort();
            transform_abort.abort();
            write_abort.abort();
        }

        self.shared.set_status(StreamStatus::Stopped).await;
        Ok(())
    }
}

impl Shared {
    fn clone_ref(self: &Arc<Self>) -> Arc<Self> {
        Arc::clone(self)
    }
}

async fn read_task(shared: Arc<Shared>, mut source: Box<dyn SourceReader>, tx: mpsc::Sender<rc_common::ChangeEvent>) {
    loop {
        if shared.stop_requested.load(Ordering::SeqCst) {
            break;
        }
        if shared.paused.load(Ordering::SeqCst) {
            shared.pause_notify.notified().await;
            continue;
        }

        match source.next(HEARTBEAT_DEADLINE).await {
            Ok(NextOutcome::Event(event)) => {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Ok(NextOutcome::Idle) => {
                shared.state.write().await.last_heartbeat_at = Some(Utc::now());
            }
            Ok(NextOutcome::Closed) => {
                debug!(stream = %shared.name, "source closed, initiating controlled stop");
                break;
            }
            Err(ReplicatorError::Unresumable(reason)) => {
                warn!(stream = %shared.name, reason = %reason, "source became unresumable mid-stream, restarting from tail");
                if let Err(e) = source.open(None).await {
                    shared.set_error(e.to_string()).await;
                    break;
                }
            }
            Err(e) if e.is_fatal() => {
                error!(stream = %shared.name, error = %e, "read task hit fatal error");
                shared.set_error(e.to_string()).await;
                break;
            }
            Err(e) => {
                warn!(stream = %shared.name, error = %e, "transient read error, retrying");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    let _ = source.close().await;
    drop(tx);
}

async fn transform_task(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<rc_common::ChangeEvent>,
    tx: mpsc::Sender<rc_common::ChangeEvent>,
    transform: TransformEngine,
) {
    while let Some(mut event) = rx.recv().await {
        if event.is_data_missing() {
            let mut metrics = shared.metrics.write().await;
            metrics.events_data_missing_total += 1;
            metrics::counter!("replicator_events_data_missing_total", "stream" => shared.name.clone()).increment(1);
            continue;
        }

        match transform.transform(&mut event) {
            Ok(TransformOutcome::Applied(warnings)) => {
                for warning in warnings {
                    warn!(stream = %shared.name, warning = %warning, "transform applied with warning");
                }
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Ok(TransformOutcome::Skipped(reason)) => {
                warn!(stream = %shared.name, event = %event.id, reason = %reason, "dropping event: transform rule failed under skip policy");
                let mut metrics = shared.metrics.write().await;
                metrics.events_failed_total += 1;
                metrics::counter!("replicator_events_failed_total", "stream" => shared.name.clone()).increment(1);
            }
            Err(e) => {
                error!(stream = %shared.name, error = %e, "transform failed stream under fail policy");
                shared.set_error(e.to_string()).await;
                shared.metrics.write().await.events_failed_total += 1;
                metrics::counter!("replicator_events_failed_total", "stream" => shared.name.clone()).increment(1);
                break;
            }
        }
    }
    drop(tx);
}

async fn write_task(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<rc_common::ChangeEvent>,
    sinks: Vec<Arc<dyn SinkWriter>>,
    breakers: Vec<Arc<CircuitBreaker>>,
    retry_policy: RetryPolicy,
    checkpoint_store: Arc<dyn CheckpointStore>,
    checkpoint_interval: Duration,
) {
    let mut last_checkpoint_at = tokio::time::Instant::now();
    let mut dirty_position: Option<Vec<u8>> = None;

    while let Some(event) = rx.recv().await {
        let mut fan_out_ok = true;
        for (sink, breaker) in sinks.iter().zip(breakers.iter()) {
            if let Err(e) = apply_to_sink(sink.as_ref(), breaker, &event, &retry_policy).await {
                error!(stream = %shared.name, error = %e, "sink write failed fatally, stream entering error state");
                shared.set_error(e.to_string()).await;
                shared.metrics.write().await.events_failed_total += 1;
                metrics::counter!("replicator_events_failed_total", "stream" => shared.name.clone()).increment(1);
                fan_out_ok = false;
                break;
            }
        }
        let open_breakers = count_open_breakers(&breakers).await;
        if !fan_out_ok {
            shared.state.write().await.open_sink_breakers = open_breakers;
            break;
        }

        {
            let mut state = shared.state.write().await;
            state.last_position = Some(event.position.clone());
            state.events_processed += 1;
            state.open_sink_breakers = open_breakers;
        }
        {
            let mut metrics = shared.metrics.write().await;
            metrics.events_processed_total += 1;
        }
        metrics::counter!("replicator_events_processed_total", "stream" => shared.name.clone()).increment(1);
        if let Some(after) = &event.after {
            let bytes = after.to_string().len() as u64;
            let mut metrics = shared.metrics.write().await;
            metrics.bytes_processed_total += bytes;
            metrics::counter!("replicator_bytes_processed_total", "stream" => shared.name.clone()).increment(bytes);
        }
        let lag = (Utc::now() - event.source_ts).num_milliseconds().max(0) as f64 / 1000.0;
        metrics::histogram!("replicator_replication_lag_seconds", "stream" => shared.name.clone()).record(lag);
        dirty_position = Some(event.position);

        if last_checkpoint_at.elapsed() >= checkpoint_interval {
            checkpoint_now(&shared, &checkpoint_store, &mut dirty_position).await;
            last_checkpoint_at = tokio::time::Instant::now();
        }
    }

    // Controlled drain finished (or the stream errored out): commit a final
    // checkpoint for whatever was fully acknowledged, then release sinks.
    checkpoint_now(&shared, &checkpoint_store, &mut dirty_position).await;

    for sink in &sinks {
        if let Err(e) = sink.close().await {
            warn!(stream = %shared.name, error = %e, "sink close failed");
        }
    }
}

async fn count_open_breakers(breakers: &[Arc<CircuitBreaker>]) -> u32 {
    let mut open = 0;
    for breaker in breakers {
        if breaker.is_open().await {
            open += 1;
        }
    }
    open
}

async fn checkpoint_now(shared: &Shared, store: &Arc<dyn CheckpointStore>, dirty_position: &mut Option<Vec<u8>>) {
    let Some(position) = dirty_position.take() else { return };
    let checkpoint = Checkpoint { stream_name: shared.name.clone(), position, committed_at: Utc::now() };
    if let Err(e) = store.save(checkpoint).await {
        warn!(stream = %shared.name, error = %e, "checkpoint save failed, will retry at next interval");
    }
}

async fn apply_to_sink(
    sink: &dyn SinkWriter,
    breaker: &CircuitBreaker,
    event: &rc_common::ChangeEvent,
    retry_policy: &RetryPolicy,
) -> rc_common::Result<()> {
    let mut attempt = 0u32;
    loop {
        if !breaker.allow().await {
            tokio::time::sleep(BREAKER_CLOSED_RETRY_WAIT).await;
            continue;
        }

        attempt += 1;
        match sink.write(event).await {
            Ok(()) => {
                breaker.record_success().await;
                return Ok(());
            }
            Err(e) if e.is_fatal() => {
                return Err(e);
            }
            Err(e) => {
                breaker.record_failure().await;
                warn!(attempt = attempt, error = %e, "sink write retryable failure");
                tokio::time::sleep(backoff_delay(retry_policy, attempt.min(retry_policy.max_attempts))).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rc_checkpoint::CheckpointStore;
    use rc_common::{CircuitBreakerConfig, Namespace, Op, SourceSpec, TransformPolicy};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::Mutex as AsyncMutex;

    fn sample_event(id: &str, after: Option<serde_json::Value>) -> rc_common::ChangeEvent {
        rc_common::ChangeEvent {
            id: id.to_string(),
            stream: "orders".to_string(),
            op: Op::Update,
            namespace: Namespace { database: "db".into(), collection: "orders".into() },
            key: Default::default(),
            before: None,
            after,
            position: id.as_bytes().to_vec(),
            source_ts: Utc::now(),
            metadata: Default::default(),
        }
    }

    /// Yields a fixed queue of events, then `Closed`.
    struct FakeSourceReader {
        events: AsyncMutex<VecDeque<rc_common::ChangeEvent>>,
    }

    impl FakeSourceReader {
        fn new(events: Vec<rc_common::ChangeEvent>) -> Self {
            Self { events: AsyncMutex::new(events.into()) }
        }
    }

    #[async_trait]
    impl SourceReader for FakeSourceReader {
        async fn open(&mut self, _resume_position: Option<Vec<u8>>) -> rc_common::Result<()> {
            Ok(())
        }

        async fn next(&mut self, _deadline: Duration) -> rc_common::Result<NextOutcome> {
            match self.events.lock().await.pop_front() {
                Some(event) => Ok(NextOutcome::Event(event)),
                None => Ok(NextOutcome::Closed),
            }
        }

        async fn close(&mut self) -> rc_common::Result<()> {
            Ok(())
        }
    }

    /// Fails its first `fail_times` writes with a transient error, then
    /// records every write that succeeds.
    struct FlakySinkWriter {
        fail_remaining: AtomicU32,
        writes: AsyncMutex<Vec<rc_common::ChangeEvent>>,
    }

    impl FlakySinkWriter {
        fn new(fail_times: u32) -> Self {
            Self { fail_remaining: AtomicU32::new(fail_times), writes: AsyncMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl SinkWriter for FlakySinkWriter {
        async fn write(&self, event: &rc_common::ChangeEvent) -> rc_common::Result<()> {
            if self.fail_remaining.load(Ordering::SeqCst) > 0 {
                self.fail_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(ReplicatorError::transient("simulated transient sink failure"));
            }
            self.writes.lock().await.push(event.clone());
            Ok(())
        }

        async fn flush(&self) -> rc_common::Result<()> {
            Ok(())
        }

        async fn close(&self) -> rc_common::Result<()> {
            Ok(())
        }
    }

    struct InMemoryCheckpointStore {
        saved: AsyncMutex<Vec<Checkpoint>>,
    }

    impl InMemoryCheckpointStore {
        fn new() -> Self {
            Self { saved: AsyncMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl CheckpointStore for InMemoryCheckpointStore {
        async fn save(&self, checkpoint: Checkpoint) -> rc_common::Result<()> {
            self.saved.lock().await.push(checkpoint);
            Ok(())
        }

        async fn load(&self, _stream_name: &str) -> rc_common::Result<Option<Checkpoint>> {
            Ok(self.saved.lock().await.last().cloned())
        }

        async fn delete(&self, _stream_name: &str) -> rc_common::Result<()> {
            Ok(())
        }

        async fn list(&self) -> rc_common::Result<Vec<Checkpoint>> {
            Ok(self.saved.lock().await.clone())
        }
    }

    fn test_config(name: &str) -> StreamConfig {
        StreamConfig {
            name: name.to_string(),
            enabled: true,
            source: SourceSpec::Mongo {
                uri: "mongodb://unused".into(),
                database: "db".into(),
                collection: "coll".into(),
                watch_operations: vec!["insert".into(), "update".into(), "replace".into(), "delete".into()],
            },
            targets: vec![],
            transform_rules: vec![],
            transform_policy: TransformPolicy::Fail,
            retry_policy: RetryPolicy { max_attempts: 5, initial_delay_ms: 1, max_delay_ms: 5, multiplier: 1.0 },
            circuit_breaker: CircuitBreakerConfig { failure_threshold: 5, recovery_timeout_ms: 50, half_open_probes: 1 },
            checkpoint_interval_ms: 60_000,
            queue_capacity: 16,
            on_unresumable: UnresumablePolicy::Fail,
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // S2: an update event with no post-image is counted as data-missing and
    // dropped before it ever reaches a sink, instead of failing the stream.
    #[tokio::test]
    async fn empty_payload_event_is_skipped_without_reaching_sink() {
        let worker = StreamWorker::new(test_config("s2-empty-payload"));
        let source = Box::new(FakeSourceReader::new(vec![sample_event("evt-1", None)]));
        let sink = Arc::new(FlakySinkWriter::new(0));
        let checkpoint_store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());

        worker.start(source, vec![sink.clone()], checkpoint_store).await.unwrap();

        let done = wait_for(
            || {
                let metrics = metrics_snapshot(&worker);
                metrics.events_data_missing_total == 1
            },
            Duration::from_secs(2),
        )
        .await;
        assert!(done, "event was never counted as data-missing");

        let metrics = worker.metrics().await;
        assert_eq!(metrics.events_processed_total, 0);
        assert_eq!(sink.writes.lock().await.len(), 0);

        worker.stop(Duration::from_secs(1)).await.unwrap();
    }

    // S3: a sink write that fails twice with a transient error and succeeds
    // on its third attempt must still end up processed and checkpointed,
    // without the stream entering an error state.
    #[tokio::test]
    async fn sink_retries_transient_failures_then_succeeds() {
        let worker = StreamWorker::new(test_config("s3-retry-then-success"));
        let source =
            Box::new(FakeSourceReader::new(vec![sample_event("evt-1", Some(serde_json::json!({"a": 1})))]));
        let sink = Arc::new(FlakySinkWriter::new(2));
        let checkpoint_store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());

        worker.start(source, vec![sink.clone()], checkpoint_store).await.unwrap();

        let done = wait_for(|| sink.writes.try_lock().map(|w| w.len()).unwrap_or(0) == 1, Duration::from_secs(2)).await;
        assert!(done, "sink never received the write after retrying");

        let metrics = worker.metrics().await;
        assert_eq!(metrics.events_processed_total, 1);
        assert_eq!(metrics.events_failed_total, 0);

        let state = worker.snapshot().await;
        assert_eq!(state.status, StreamStatus::Running);
        assert_eq!(state.open_sink_breakers, 0);

        worker.stop(Duration::from_secs(1)).await.unwrap();
    }

    fn metrics_snapshot(worker: &StreamWorker) -> StreamMetrics {
        // Tests run on a current-thread or multi-thread runtime either way;
        // `try_read` lets the polling loop above stay synchronous.
        worker.shared.metrics.try_read().map(|m| m.clone()).unwrap_or_default()
    }
}
