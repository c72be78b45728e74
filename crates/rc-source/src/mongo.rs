//! Document-store change-stream backend, generalized from
//! `fc-stream::watcher::MongoStreamWatcher`'s reconnect loop into the
//! `SourceReader` contract: `open`/`next`/`close` instead of an
//! owns-its-own-retry-loop `watch()`. Reconnection and backoff now live in
//! the Stream Worker's Read task, which calls `next` in a loop and treats a
//! transient error as its own retry signal.

use crate::{FallbackCounters, NextOutcome, SourceReader};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use futures::stream::StreamExt as _;
use mongodb::change_stream::event::ChangeStreamEvent;
use mongodb::change_stream::ChangeStream;
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::{Client, Collection};
use rc_common::{ChangeEvent, Namespace, Op, ReplicatorError, RetryPolicy};
use std::collections::HashMap;
use std::time::Duration;

pub struct MongoSourceReader {
    client: Client,
    stream_name: String,
    database: String,
    collection_name: String,
    watch_operations: Vec<String>,
    collection: Collection<Document>,
    stream: Option<ChangeStream<ChangeStreamEvent<Document>>>,
    counters: FallbackCounters,
    fallback_retry_policy: RetryPolicy,
}

impl MongoSourceReader {
    pub fn new(
        client: Client,
        stream_name: String,
        database: String,
        collection_name: String,
        watch_operations: Vec<String>,
        fallback_retry_policy: RetryPolicy,
    ) -> Self {
        let collection = client.database(&database).collection(&collection_name);
        Self {
            client,
            stream_name,
            database,
            collection_name,
            watch_operations,
            collection,
            stream: None,
            counters: FallbackCounters::default(),
            fallback_retry_policy,
        }
    }

    pub fn counters(&self) -> &FallbackCounters {
        &self.counters
    }

    async fn resolve_full_document(&mut self, event: &ChangeStreamEvent<Document>) -> Option<Document> {
        if let Some(doc) = &event.full_document {
            self.counters.normal += 1;
            metrics::counter!("replicator_mongodb_events_full_document_total", "stream" => self.stream_name.clone())
                .increment(1);
            return Some(doc.clone());
        }

        let Some(key) = &event.document_key else {
            self.counters.empty += 1;
            metrics::counter!("replicator_mongodb_events_empty_payload_total", "stream" => self.stream_name.clone())
                .increment(1);
            return None;
        };

        let filter = doc! { "_id": key.get("_id").cloned() };
        let max_attempts = self.fallback_retry_policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.collection.find_one(filter.clone(), None).await {
                Ok(Some(doc)) => {
                    self.counters.fallback += 1;
                    metrics::counter!("replicator_mongodb_events_fallback_used_total", "stream" => self.stream_name.clone())
                        .increment(1);
                    return Some(doc);
                }
                Ok(None) => {
                    self.counters.empty += 1;
                    metrics::counter!("replicator_mongodb_events_empty_payload_total", "stream" => self.stream_name.clone())
                        .increment(1);
                    return None;
                }
                Err(_) if attempt < max_attempts => {
                    tokio::time::sleep(fallback_backoff_delay(&self.fallback_retry_policy, attempt)).await;
                }
                Err(_) => {
                    self.counters.fallback_failed += 1;
                    metrics::counter!("replicator_mongodb_events_fallback_failed_total", "stream" => self.stream_name.clone())
                        .increment(1);
                    return None;
                }
            }
        }
    }
}

fn fallback_backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = policy.multiplier.powi(attempt.saturating_sub(1) as i32);
    let delay_ms = (policy.initial_delay_ms as f64 * exp).min(policy.max_delay_ms as f64);
    Duration::from_millis(delay_ms.max(0.0) as u64)
}

#[async_trait]
impl SourceReader for MongoSourceReader {
    async fn open(&mut self, resume_position: Option<Vec<u8>>) -> rc_common::Result<()> {
        let mut options = ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .build();

        if let Some(bytes) = resume_position {
            let token = bson::from_slice(&bytes)
                .map_err(|e| ReplicatorError::fatal(format!("malformed resume position: {e}")))?;
            options.resume_after = Some(token);
        }

        let pipeline = vec![doc! { "$match": { "operationType": { "$in": &self.watch_operations } } }];

        let stream = self.collection.watch(pipeline, options).await.map_err(|e| {
            if is_stale_resume_token_error(&e) {
                ReplicatorError::Unresumable(format!("change stream resume position expired: {e}"))
            } else {
                ReplicatorError::transient(format!("failed to open change stream: {e}"))
            }
        })?;

        self.stream = Some(stream);
        Ok(())
    }

    async fn next(&mut self, deadline: Duration) -> rc_common::Result<NextOutcome> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(ReplicatorError::fatal("next called before open"));
        };

        let outcome = match tokio::time::timeout(deadline, stream.next()).await {
            Err(_) => return Ok(NextOutcome::Idle),
            Ok(None) => return Ok(NextOutcome::Closed),
            Ok(Some(Err(e))) => {
                return Err(if is_stale_resume_token_error(&e) {
                    ReplicatorError::Unresumable(format!("change stream invalidated: {e}"))
                } else {
                    ReplicatorError::transient(format!("change stream error: {e}"))
                });
            }
            Ok(Some(Ok(event))) => event,
        };

        let op = match map_operation_type(&outcome.operation_type) {
            Some(op) => op,
            None => return Ok(NextOutcome::Idle),
        };

        let key = outcome
            .document_key
            .as_ref()
            .map(document_to_json_map)
            .unwrap_or_default();

        let before = outcome.full_document_before_change.as_ref().map(document_to_json_value);
        let position = self
            .stream
            .as_ref()
            .and_then(|s| s.resume_token())
            .and_then(|token| bson::to_vec(&token).ok())
            .unwrap_or_default();

        let after = if op.requires_after() {
            self.resolve_full_document(&outcome).await.map(|d| document_to_json_value(&d))
        } else {
            None
        };

        Ok(NextOutcome::Event(ChangeEvent {
            id: uuid::Uuid::new_v4().to_string(),
            stream: self.stream_name.clone(),
            op,
            namespace: Namespace { database: self.database.clone(), collection: self.collection_name.clone() },
            key,
            before,
            after,
            position,
            source_ts: chrono::Utc::now(),
            metadata: HashMap::new(),
        }))
    }

    async fn close(&mut self) -> rc_common::Result<()> {
        self.stream = None;
        Ok(())
    }
}

fn map_operation_type(operation_type: &str) -> Option<Op> {
    match operation_type {
        "insert" => Some(Op::Insert),
        "update" => Some(Op::Update),
        "replace" => Some(Op::Replace),
        "delete" => Some(Op::Delete),
        _ => None,
    }
}

fn document_to_json_value(doc: &Document) -> serde_json::Value {
    serde_json::to_value(Bson::Document(doc.clone())).unwrap_or(serde_json::Value::Null)
}

fn document_to_json_map(doc: &Document) -> HashMap<String, serde_json::Value> {
    doc.iter()
        .map(|(k, v)| (k.clone(), serde_json::to_value(v.clone()).unwrap_or(serde_json::Value::Null)))
        .collect()
}

fn is_stale_resume_token_error<E: std::fmt::Display>(e: &E) -> bool {
    let msg = e.to_string().to_lowercase();
    (msg.contains("changestream") && msg.contains("history"))
        || msg.contains("resume token")
        || msg.contains("oplog")
        || msg.contains("invalidate")
}
