//! Logical `(updated_at, id)` watermark poller, the resolved answer to the
//! SQL source Open Question in SPEC_FULL.md §4.2: it keeps the same
//! `SourceReader` contract as the Mongo change-stream backend (batches of
//! `ChangeEvent` behind an opaque resumable position) without depending on
//! a database-specific logical-replication client.
//!
//! Postgres only for now; `SqlKind::MySql` is rejected at construction
//! (see DESIGN.md).

use crate::{NextOutcome, SourceReader};
use async_trait::async_trait;
use rc_common::{ChangeEvent, Namespace, Op, ReplicatorError, SqlKind};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

const PAGE_SIZE: i64 = 200;
const EPOCH_WATERMARK: &str = "0001-01-01 00:00:00";

#[derive(Serialize, Deserialize)]
struct Position {
    watermark: String,
    key: String,
}

pub struct SqlSourceReader {
    pool: PgPool,
    stream_name: String,
    database_label: String,
    table: String,
    key_column: String,
    watermark_column: String,
    cursor: Position,
    buffer: VecDeque<(serde_json::Value, Position)>,
}

impl SqlSourceReader {
    pub fn new(
        pool: PgPool,
        stream_name: String,
        database_label: String,
        kind: SqlKind,
        table: String,
        key_columns: Vec<String>,
        watermark_column: String,
    ) -> rc_common::Result<Self> {
        if kind != SqlKind::Postgres {
            return Err(ReplicatorError::fatal("SQL source backend currently supports kind = postgres only"));
        }
        let key_column = key_columns
            .into_iter()
            .next()
            .ok_or_else(|| ReplicatorError::Config("sql source requires at least one key column".into()))?;
        Ok(Self {
            pool,
            stream_name,
            database_label,
            table,
            key_column,
            watermark_column,
            cursor: Position { watermark: EPOCH_WATERMARK.to_string(), key: String::new() },
            buffer: VecDeque::new(),
        })
    }

    async fn poll_page(&self) -> rc_common::Result<Vec<(serde_json::Value, Position)>> {
        let sql = format!(
            "SELECT row_to_json(t)::text AS doc, t.{wm}::text AS wm, t.{key}::text AS key_val \
             FROM (SELECT * FROM {table} WHERE ({wm}::text > $1) OR ({wm}::text = $1 AND {key}::text > $2) \
             ORDER BY {wm}, {key} LIMIT $3) t",
            wm = self.watermark_column,
            key = self.key_column,
            table = self.table,
        );

        let rows: Vec<(String, String, String)> = sqlx::query_as(&sql)
            .bind(&self.cursor.watermark)
            .bind(&self.cursor.key)
            .bind(PAGE_SIZE)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ReplicatorError::transient(format!("watermark poll failed: {e}")))?;

        let mut page = Vec::with_capacity(rows.len());
        for (doc, wm, key) in rows {
            let value: serde_json::Value = serde_json::from_str(&doc)?;
            page.push((value, Position { watermark: wm, key }));
        }
        Ok(page)
    }
}

#[async_trait]
impl SourceReader for SqlSourceReader {
    async fn open(&mut self, resume_position: Option<Vec<u8>>) -> rc_common::Result<()> {
        if let Some(bytes) = resume_position {
            self.cursor = serde_json::from_slice(&bytes)
                .map_err(|e| ReplicatorError::fatal(format!("malformed resume position: {e}")))?;
        }
        Ok(())
    }

    async fn next(&mut self, deadline: Duration) -> rc_common::Result<NextOutcome> {
        if self.buffer.is_empty() {
            let page = self.poll_page().await?;
            if page.is_empty() {
                tokio::time::sleep(deadline).await;
                return Ok(NextOutcome::Idle);
            }
            self.buffer.extend(page);
        }

        let Some((doc, position)) = self.buffer.pop_front() else {
            return Ok(NextOutcome::Idle);
        };

        let key_value = doc.get(&self.key_column).cloned().unwrap_or(serde_json::Value::Null);
        let mut key = HashMap::new();
        key.insert(self.key_column.clone(), key_value);

        self.cursor = position.clone();
        let position_bytes = serde_json::to_vec(&position)?;

        Ok(NextOutcome::Event(ChangeEvent {
            id: uuid::Uuid::new_v4().to_string(),
            stream: self.stream_name.clone(),
            op: Op::Update,
            namespace: Namespace { database: self.database_label.clone(), collection: self.table.clone() },
            key,
            before: None,
            after: Some(doc),
            position: position_bytes,
            source_ts: chrono::Utc::now(),
            metadata: HashMap::new(),
        }))
    }

    async fn close(&mut self) -> rc_common::Result<()> {
        Ok(())
    }
}
