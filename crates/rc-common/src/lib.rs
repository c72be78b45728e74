//! Shared data model for the replication engine.
//!
//! Every crate in the workspace depends on this one for the `ChangeEvent`
//! wire shape, stream configuration, and the error taxonomy that the
//! pipeline classifies failures against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// Change Event
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Insert,
    Update,
    Replace,
    Delete,
}

impl Op {
    /// Insert/update/replace require a post-image; delete does not.
    pub fn requires_after(&self) -> bool {
        !matches!(self, Op::Delete)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

/// The common in-flight record produced by every Source Reader and consumed
/// by every Sink Writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: String,
    pub stream: String,
    pub op: Op,
    pub namespace: Namespace,
    pub key: HashMap<String, serde_json::Value>,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    /// Opaque resume token, advances monotonically within one source shard.
    pub position: Vec<u8>,
    pub source_ts: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

impl ChangeEvent {
    /// An actionable op (insert/update/replace) with no post-image. Counted
    /// and skipped rather than failing the stream (spec §3, §4.5 step 2).
    pub fn is_data_missing(&self) -> bool {
        self.op.requires_after() && self.after.is_none()
    }
}

// ============================================================================
// Stream configuration
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SqlKind {
    Postgres,
    MySql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    Mongo {
        uri: String,
        database: String,
        collection: String,
        #[serde(default = "default_watch_operations")]
        watch_operations: Vec<String>,
    },
    Sql {
        kind: SqlKind,
        url: String,
        table: String,
        key_columns: Vec<String>,
        watermark_column: String,
    },
    Kafka {
        brokers: String,
        topic: String,
        group_id: String,
    },
}

fn default_watch_operations() -> Vec<String> {
    vec!["insert".into(), "update".into(), "replace".into(), "delete".into()]
}

fn default_batch_max() -> usize {
    100
}

fn default_batch_interval_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetSpec {
    Mongo {
        uri: String,
        database: String,
        collection: String,
    },
    Sql {
        kind: SqlKind,
        url: String,
        table: String,
        key_columns: Vec<String>,
    },
    Search {
        base_url: String,
        index: String,
        auth_token: Option<String>,
        #[serde(default = "default_batch_max")]
        batch_max: usize,
        #[serde(default = "default_batch_interval_ms")]
        batch_interval_ms: u64,
    },
    Kafka {
        brokers: String,
        topic: String,
    },
}

/// One transform rule. Operations are described in spec §4.4.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum TransformRule {
    /// `out path -> in path`. Paths are dot-delimited, `[*]` selects all array elements.
    Shift { spec: HashMap<String, String> },
    /// `field -> default value`, applied when the field is missing or null.
    Default { spec: HashMap<String, serde_json::Value> },
    Concat {
        sources: Vec<String>,
        delimiter: String,
        target_path: String,
    },
    Coalesce {
        sources: Vec<String>,
        target_path: String,
    },
    Pass,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransformPolicy {
    Skip,
    Fail,
    Partial,
}

impl Default for TransformPolicy {
    fn default() -> Self {
        TransformPolicy::Fail
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnresumablePolicy {
    Tail,
    Fail,
}

impl Default for UnresumablePolicy {
    fn default() -> Self {
        UnresumablePolicy::Fail
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_probes: 1,
        }
    }
}

/// Declarative definition of one replication stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub source: SourceSpec,
    pub targets: Vec<TargetSpec>,
    #[serde(default)]
    pub transform_rules: Vec<TransformRule>,
    #[serde(default)]
    pub transform_policy: TransformPolicy,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default = "default_checkpoint_interval_ms")]
    pub checkpoint_interval_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub on_unresumable: UnresumablePolicy,
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_interval_ms() -> u64 {
    5_000
}

fn default_queue_capacity() -> usize {
    1024
}

// ============================================================================
// Stream runtime state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Created,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl StreamStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamStatus::Stopped | StreamStatus::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamState {
    pub name: String,
    pub status: StreamStatus,
    pub last_position: Option<Vec<u8>>,
    pub events_processed: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Number of this stream's sink circuit breakers currently `Open`
    /// (spec §4.5: the breaker "surfaces degraded health").
    pub open_sink_breakers: u32,
}

impl StreamState {
    pub fn new(name: String) -> Self {
        Self {
            name,
            status: StreamStatus::Created,
            last_position: None,
            events_processed: 0,
            error_count: 0,
            last_error: None,
            started_at: None,
            last_heartbeat_at: None,
            open_sink_breakers: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamAction {
    Start,
    Stop,
    Pause,
    Resume,
    Restart,
}

// ============================================================================
// Checkpoint
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stream_name: String,
    pub position: Vec<u8>,
    pub committed_at: DateTime<Utc>,
}

// ============================================================================
// Credential Provider types
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl CachedToken {
    /// Serve only if `now + skew < expires_at` (spec §3).
    pub fn is_valid(&self, now: DateTime<Utc>, skew_seconds: i64) -> bool {
        now + chrono::Duration::seconds(skew_seconds) < self.expires_at
    }

    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CredentialMetrics {
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub issued: u64,
    pub avg_latency_ms: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl CredentialMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.successes as f64 / self.total as f64
    }
}

// ============================================================================
// Health & metrics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub status: HealthStatus,
    pub message: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub checks: HashMap<String, CheckResult>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub events_processed_total: u64,
    pub events_failed_total: u64,
    pub events_data_missing_total: u64,
    pub bytes_processed_total: u64,
    pub fallback_used_total: u64,
    pub fallback_failed_total: u64,
    pub replication_lag_seconds: f64,
    pub events_per_second: f64,
}

// ============================================================================
// Error taxonomy (spec §7)
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ReplicatorError {
    #[error("transient error: {0}")]
    Transient(String),
    #[error("retryable error: {0}")]
    Retryable(String),
    #[error("fatal error: {0}")]
    Fatal(String),
    #[error("source position unresumable: {0}")]
    Unresumable(String),
    #[error("event data dropped: {0}")]
    DataDrop(String),
    #[error("transform rule failed: {0}")]
    TransformError(String),
    #[error("credential error: {0}")]
    CredentialError(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReplicatorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Retryable(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Config(_))
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ReplicatorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_missing_only_for_actionable_ops() {
        let mut ev = sample_event(Op::Update);
        ev.after = None;
        assert!(ev.is_data_missing());

        let mut del = sample_event(Op::Delete);
        del.after = None;
        assert!(!del.is_data_missing());
    }

    #[test]
    fn cached_token_expiry_skew() {
        let now = Utc::now();
        let token = CachedToken {
            access_token: "tok".into(),
            expires_at: now + chrono::Duration::seconds(120),
            scopes: vec!["scope".into()],
        };
        assert!(token.is_valid(now, 60));
        assert!(!token.is_valid(now, 300));
    }

    fn sample_event(op: Op) -> ChangeEvent {
        ChangeEvent {
            id: "e1".into(),
            stream: "s1".into(),
            op,
            namespace: Namespace { database: "db".into(), collection: "coll".into() },
            key: HashMap::new(),
            before: None,
            after: Some(serde_json::json!({"v": 1})),
            position: vec![1],
            source_ts: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}
