//! Search-index sink. Batches events and flushes them through an
//! Elasticsearch/OpenSearch-style Bulk API, grounded in
//! `fc-outbox::http_dispatcher`'s per-item status classification (there:
//! per-message HTTP status; here: per-action `error` block in the Bulk
//! response).

use crate::SinkWriter;
use async_trait::async_trait;
use rc_common::{ChangeEvent, Op, ReplicatorError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::interval;
use tracing::warn;

struct PendingAction {
    line_meta: String,
    line_doc: Option<String>,
    done: oneshot::Sender<rc_common::Result<()>>,
}

struct Buffer {
    actions: Vec<PendingAction>,
}

pub struct SearchSinkWriter {
    client: reqwest::Client,
    base_url: String,
    index: String,
    auth_token: Option<String>,
    batch_max: usize,
    buffer: Arc<Mutex<Buffer>>,
    ticker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for SearchSinkWriter {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.ticker.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[derive(serde::Deserialize)]
struct BulkResponse {
    errors: bool,
    items: Vec<std::collections::HashMap<String, BulkItemResult>>,
}

#[derive(serde::Deserialize)]
struct BulkItemResult {
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

impl SearchSinkWriter {
    pub async fn new(base_url: String, index: String, auth_token: Option<String>, batch_max: usize, batch_interval_ms: u64) -> Arc<Self> {
        let client = reqwest::Client::new();
        let buffer = Arc::new(Mutex::new(Buffer { actions: Vec::new() }));

        let writer = Arc::new(Self {
            client,
            base_url,
            index,
            auth_token,
            batch_max,
            buffer: buffer.clone(),
            ticker: Mutex::new(None),
        });

        let ticker_writer = writer.clone();
        let handle = tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(batch_interval_ms.max(1)));
            loop {
                tick.tick().await;
                if let Err(e) = ticker_writer.flush().await {
                    warn!(error = %e, "search sink periodic flush failed");
                }
            }
        });
        *writer.ticker.lock().await = Some(handle);

        writer
    }

    /// Buffers `line_meta`/`line_doc` and, once the buffer reaches
    /// `batch_max`, flushes inline. Either way this does not return until
    /// the action's own batch has actually been sent and acked by the
    /// bulk endpoint — the caller (`write`) must not see `Ok(())` before
    /// the event is durable, per the batching-writer contract.
    async fn push(&self, line_meta: String, line_doc: Option<String>) -> rc_common::Result<()> {
        let (done, recv) = oneshot::channel();
        let should_flush = {
            let mut buf = self.buffer.lock().await;
            buf.actions.push(PendingAction { line_meta, line_doc, done });
            buf.actions.len() >= self.batch_max
        };
        if should_flush {
            self.flush().await?;
        }
        recv.await.unwrap_or_else(|_| Err(ReplicatorError::transient("search sink flush dropped before completion")))
    }

    async fn send_bulk(&self, body: String) -> rc_common::Result<()> {
        let url = format!("{}/_bulk", self.base_url);
        let mut request = self.client.post(&url).header("Content-Type", "application/x-ndjson").body(body);
        if let Some(ref token) = self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ReplicatorError::transient(format!("search sink bulk request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text));
        }

        let parsed: BulkResponse = response
            .json()
            .await
            .map_err(|e| ReplicatorError::transient(format!("search sink bulk response parse failed: {e}")))?;

        if parsed.errors {
            for item in &parsed.items {
                for result in item.values() {
                    if let Some(ref err) = result.error {
                        if is_retryable_status(result.status) {
                            return Err(ReplicatorError::transient(format!("bulk item retryable: {err}")));
                        }
                        return Err(ReplicatorError::fatal(format!("bulk item rejected: {err}")));
                    }
                }
            }
        }

        Ok(())
    }

    fn op_action(event: &ChangeEvent, index: &str) -> rc_common::Result<(String, Option<String>)> {
        let doc_id = doc_id(event)?;
        match event.op {
            Op::Delete => {
                let meta = serde_json::json!({ "delete": { "_index": index, "_id": doc_id } });
                Ok((meta.to_string(), None))
            }
            _ => {
                let after = event
                    .after
                    .as_ref()
                    .ok_or_else(|| ReplicatorError::fatal("index requires a post-image"))?;
                let meta = serde_json::json!({ "index": { "_index": index, "_id": doc_id } });
                Ok((meta.to_string(), Some(after.to_string())))
            }
        }
    }
}

fn duplicate_error(e: &ReplicatorError) -> ReplicatorError {
    match e {
        ReplicatorError::Transient(s) => ReplicatorError::Transient(s.clone()),
        ReplicatorError::Retryable(s) => ReplicatorError::Retryable(s.clone()),
        ReplicatorError::Fatal(s) => ReplicatorError::Fatal(s.clone()),
        ReplicatorError::Unresumable(s) => ReplicatorError::Unresumable(s.clone()),
        ReplicatorError::DataDrop(s) => ReplicatorError::DataDrop(s.clone()),
        ReplicatorError::TransformError(s) => ReplicatorError::TransformError(s.clone()),
        ReplicatorError::CredentialError(s) => ReplicatorError::CredentialError(s.clone()),
        ReplicatorError::Config(s) => ReplicatorError::Config(s.clone()),
        other => ReplicatorError::Fatal(other.to_string()),
    }
}

fn doc_id(event: &ChangeEvent) -> rc_common::Result<String> {
    let parts: Vec<String> = event
        .key
        .values()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect();
    if parts.is_empty() {
        return Err(ReplicatorError::fatal("index requires a non-empty key"));
    }
    Ok(parts.join(":"))
}

#[async_trait]
impl SinkWriter for SearchSinkWriter {
    async fn write(&self, event: &ChangeEvent) -> rc_common::Result<()> {
        let (line_meta, line_doc) = Self::op_action(event, &self.index)?;
        self.push(line_meta, line_doc).await
    }

    async fn flush(&self) -> rc_common::Result<()> {
        let actions = {
            let mut buf = self.buffer.lock().await;
            std::mem::take(&mut buf.actions)
        };
        if actions.is_empty() {
            return Ok(());
        }

        let mut body = String::new();
        for action in &actions {
            body.push_str(&action.line_meta);
            body.push('\n');
            if let Some(ref doc) = action.line_doc {
                body.push_str(doc);
                body.push('\n');
            }
        }

        let result = self.send_bulk(body).await;
        for action in actions {
            let _ = action.done.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(duplicate_error(e)),
            });
        }
        result
    }

    async fn close(&self) -> rc_common::Result<()> {
        self.flush().await
    }

    fn supports_batching(&self) -> bool {
        true
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn classify_status(status: u16, body: &str) -> ReplicatorError {
    if is_retryable_status(status) {
        ReplicatorError::transient(format!("search sink bulk failed ({status}): {body}"))
    } else {
        ReplicatorError::fatal(format!("search sink bulk rejected ({status}): {body}"))
    }
}
