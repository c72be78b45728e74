//! Stream Supervisor (spec §4.6): a registry of Stream Workers with
//! lifecycle fan-out and aggregated health, generalized from
//! `fc-router::manager::QueueManager`'s `DashMap<String, Arc<ProcessPool>>`
//! pool registry — here, one entry per configured stream instead of per
//! pool code.

mod factory;

use dashmap::DashMap;
use rc_checkpoint::CheckpointStore;
use rc_common::{
    CheckResult, HealthReport, HealthStatus, ReplicatorError, StreamAction, StreamConfig, StreamState, StreamStatus,
};
use rc_worker::StreamWorker;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

struct Entry {
    worker: Arc<StreamWorker>,
    config: StreamConfig,
}

pub struct StreamSupervisor {
    entries: DashMap<String, Arc<Entry>>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    started_at: Instant,
}

impl StreamSupervisor {
    pub fn new(checkpoint_store: Arc<dyn CheckpointStore>) -> Self {
        Self { entries: DashMap::new(), checkpoint_store, started_at: Instant::now() }
    }

    /// Registers a stream. Does not start it — callers drive lifecycle
    /// explicitly via `start_all`/`execute_action`.
    pub fn create(&self, config: StreamConfig) -> rc_common::Result<()> {
        if self.entries.contains_key(&config.name) {
            return Err(ReplicatorError::Config(format!("stream '{}' already exists", config.name)));
        }
        let worker = Arc::new(StreamWorker::new(config.clone()));
        self.entries.insert(config.name.clone(), Arc::new(Entry { worker, config }));
        Ok(())
    }

    pub async fn delete(&self, name: &str, deadline: Duration) -> rc_common::Result<()> {
        let Some((_, entry)) = self.entries.remove(name) else {
            return Err(ReplicatorError::Config(format!("stream '{name}' not found")));
        };
        entry.worker.stop(deadline).await?;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<StreamState> {
        let entry = self.entries.get(name)?.clone();
        Some(entry.worker.snapshot().await)
    }

    pub async fn list(&self) -> Vec<StreamState> {
        let entries: Vec<Arc<Entry>> = self.entries.iter().map(|e| e.value().clone()).collect();
        let mut states = Vec::with_capacity(entries.len());
        for entry in entries {
            states.push(entry.worker.snapshot().await);
        }
        states
    }

    pub async fn start_all(&self) -> rc_common::Result<()> {
        let entries: Vec<Arc<Entry>> = self.entries.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            if !entry.config.enabled {
                continue;
            }
            if let Err(e) = self.start_one(&entry).await {
                error!(stream = %entry.config.name, error = %e, "failed to start stream");
            }
        }
        Ok(())
    }

    pub async fn stop_all(&self, deadline: Duration) -> rc_common::Result<()> {
        let entries: Vec<Arc<Entry>> = self.entries.iter().map(|e| e.value().clone()).collect();
        for entry in entries {
            if let Err(e) = entry.worker.stop(deadline).await {
                warn!(stream = %entry.config.name, error = %e, "error stopping stream");
            }
        }
        self.refresh_active_streams_gauge().await;
        Ok(())
    }

    pub async fn execute_action(&self, name: &str, action: StreamAction) -> rc_common::Result<()> {
        let entry = self
            .entries
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| ReplicatorError::Config(format!("stream '{name}' not found")))?;

        match action {
            StreamAction::Start => self.start_one(&entry).await,
            StreamAction::Stop => entry.worker.stop(Duration::from_secs(30)).await,
            StreamAction::Pause => {
                entry.worker.pause().await;
                Ok(())
            }
            StreamAction::Resume => {
                entry.worker.resume().await;
                Ok(())
            }
            StreamAction::Restart => {
                entry.worker.stop(Duration::from_secs(30)).await?;
                self.start_one(&entry).await
            }
        }
    }

    async fn start_one(&self, entry: &Entry) -> rc_common::Result<()> {
        let source = factory::build_source(&entry.config).await?;
        let sinks = factory::build_sinks(&entry.config).await?;
        entry.worker.start(source, sinks, self.checkpoint_store.clone()).await?;
        info!(stream = %entry.config.name, "stream started");
        self.refresh_active_streams_gauge().await;
        Ok(())
    }

    async fn refresh_active_streams_gauge(&self) {
        let mut running = 0u32;
        for entry in self.entries.iter() {
            if entry.value().worker.snapshot().await.status == StreamStatus::Running {
                running += 1;
            }
        }
        metrics::gauge!("replicator_active_streams").set(running as f64);
    }

    pub async fn health(&self) -> HealthReport {
        let entries: Vec<Arc<Entry>> = self.entries.iter().map(|e| e.value().clone()).collect();
        let mut checks = HashMap::new();
        let mut overall = HealthStatus::Healthy;

        for entry in &entries {
            let state = entry.worker.snapshot().await;
            let (status, message) = if !entry.config.enabled {
                (HealthStatus::Healthy, "disabled".to_string())
            } else {
                match state.status {
                    StreamStatus::Running if state.open_sink_breakers > 0 => (
                        HealthStatus::Degraded,
                        format!("{} sink circuit breaker(s) open", state.open_sink_breakers),
                    ),
                    StreamStatus::Running => (HealthStatus::Healthy, "running".to_string()),
                    StreamStatus::Error => (HealthStatus::Unhealthy, state.last_error.clone().unwrap_or_default()),
                    StreamStatus::Paused | StreamStatus::Created | StreamStatus::Starting => {
                        (HealthStatus::Degraded, format!("{:?}", state.status))
                    }
                    StreamStatus::Stopping | StreamStatus::Stopped => {
                        (HealthStatus::Degraded, format!("{:?}", state.status))
                    }
                }
            };

            overall = worse(overall, status);
            checks.insert(
                entry.config.name.clone(),
                CheckResult { status, message, duration_ms: 0 },
            );
        }

        HealthReport {
            status: overall,
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
            checks,
        }
    }
}

fn worse(a: HealthStatus, b: HealthStatus) -> HealthStatus {
    use HealthStatus::*;
    match (a, b) {
        (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
        (Degraded, _) | (_, Degraded) => Degraded,
        _ => Healthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use rc_common::{CircuitBreakerConfig, Namespace, Op, RetryPolicy, SourceSpec, TransformPolicy, UnresumablePolicy};
    use rc_sink::SinkWriter;
    use rc_source::{NextOutcome, SourceReader};
    use std::collections::VecDeque;
    use tokio::sync::Mutex as AsyncMutex;

    fn sample_event(id: &str) -> rc_common::ChangeEvent {
        rc_common::ChangeEvent {
            id: id.to_string(),
            stream: "orders".to_string(),
            op: Op::Insert,
            namespace: Namespace { database: "db".into(), collection: "orders".into() },
            key: Default::default(),
            before: None,
            after: Some(serde_json::json!({"a": 1})),
            position: id.as_bytes().to_vec(),
            source_ts: Utc::now(),
            metadata: Default::default(),
        }
    }

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

    /// Always refuses the write with a fatal error, the way a sink rejects a
    /// document it can never apply (e.g. a schema mismatch).
    struct FatalSinkWriter;

    #[async_trait]
    impl SinkWriter for FatalSinkWriter {
        async fn write(&self, _event: &rc_common::ChangeEvent) -> rc_common::Result<()> {
            Err(ReplicatorError::fatal("sink permanently rejects this document"))
        }

        async fn flush(&self) -> rc_common::Result<()> {
            Ok(())
        }

        async fn close(&self) -> rc_common::Result<()> {
            Ok(())
        }
    }

    struct InMemoryCheckpointStore {
        saved: AsyncMutex<Vec<rc_common::Checkpoint>>,
    }

    impl InMemoryCheckpointStore {
        fn new() -> Self {
            Self { saved: AsyncMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl CheckpointStore for InMemoryCheckpointStore {
        async fn save(&self, checkpoint: rc_common::Checkpoint) -> rc_common::Result<()> {
            self.saved.lock().await.push(checkpoint);
            Ok(())
        }

        async fn load(&self, _stream_name: &str) -> rc_common::Result<Option<rc_common::Checkpoint>> {
            Ok(self.saved.lock().await.last().cloned())
        }

        async fn delete(&self, _stream_name: &str) -> rc_common::Result<()> {
            Ok(())
        }

        async fn list(&self) -> rc_common::Result<Vec<rc_common::Checkpoint>> {
            Ok(self.saved.lock().await.clone())
        }
    }

    fn test_config(name: &str, enabled: bool) -> StreamConfig {
        StreamConfig {
            name: name.to_string(),
            enabled,
            source: SourceSpec::Mongo {
                uri: "mongodb://unused".into(),
                database: "db".into(),
                collection: "coll".into(),
                watch_operations: vec!["insert".into(), "update".into(), "replace".into(), "delete".into()],
            },
            targets: vec![],
            transform_rules: vec![],
            transform_policy: TransformPolicy::Fail,
            retry_policy: RetryPolicy { max_attempts: 3, initial_delay_ms: 1, max_delay_ms: 2, multiplier: 1.0 },
            circuit_breaker: CircuitBreakerConfig { failure_threshold: 5, recovery_timeout_ms: 50, half_open_probes: 1 },
            checkpoint_interval_ms: 60_000,
            queue_capacity: 16,
            on_unresumable: UnresumablePolicy::Fail,
        }
    }

    async fn wait_until_error(worker: &StreamWorker, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if worker.snapshot().await.status == StreamStatus::Error {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Starts a worker directly (bypassing `factory`, which needs live
    /// backend connections) and registers it the same way `create`/
    /// `start_one` would. Returns the worker handle for direct polling.
    async fn register_started_stream(
        supervisor: &StreamSupervisor,
        config: StreamConfig,
        source: Box<dyn SourceReader>,
        sink: Arc<dyn SinkWriter>,
    ) -> Arc<StreamWorker> {
        let worker = Arc::new(StreamWorker::new(config.clone()));
        let checkpoint_store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
        worker.start(source, vec![sink], checkpoint_store).await.unwrap();
        supervisor.entries.insert(config.name.clone(), Arc::new(Entry { worker: worker.clone(), config }));
        worker
    }

    #[tokio::test]
    async fn health_reports_unhealthy_when_a_stream_errors_on_a_fatal_sink_failure() {
        let checkpoint_store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
        let supervisor = StreamSupervisor::new(checkpoint_store);

        let config = test_config("s3-fatal-sink", true);
        let source = Box::new(FakeSourceReader::new(vec![sample_event("evt-1")]));
        let worker = register_started_stream(&supervisor, config, source, Arc::new(FatalSinkWriter)).await;

        let done = wait_until_error(&worker, Duration::from_secs(2)).await;
        assert!(done, "stream never entered the error state after a fatal sink failure");

        let report = supervisor.health().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert_eq!(report.checks["s3-fatal-sink"].status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn health_is_degraded_for_a_paused_stream_and_healthy_for_a_disabled_one() {
        let checkpoint_store: Arc<dyn CheckpointStore> = Arc::new(InMemoryCheckpointStore::new());
        let supervisor = StreamSupervisor::new(checkpoint_store);

        let paused_config = test_config("paused-stream", true);
        let source = Box::new(FakeSourceReader::new(vec![]));
        let worker = register_started_stream(&supervisor, paused_config, source, Arc::new(FatalSinkWriter)).await;
        worker.pause().await;

        let disabled_config = test_config("disabled-stream", false);
        supervisor.create(disabled_config).unwrap();

        let report = supervisor.health().await;
        assert_eq!(report.checks["paused-stream"].status, HealthStatus::Degraded);
        assert_eq!(report.checks["disabled-stream"].status, HealthStatus::Healthy);
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[test]
    fn worse_escalates_to_the_least_healthy_status() {
        assert_eq!(worse(HealthStatus::Healthy, HealthStatus::Degraded), HealthStatus::Degraded);
        assert_eq!(worse(HealthStatus::Degraded, HealthStatus::Unhealthy), HealthStatus::Unhealthy);
        assert_eq!(worse(HealthStatus::Unhealthy, HealthStatus::Healthy), HealthStatus::Unhealthy);
        assert_eq!(worse(HealthStatus::Healthy, HealthStatus::Healthy), HealthStatus::Healthy);
    }
}
