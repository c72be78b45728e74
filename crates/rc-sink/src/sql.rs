//! Relational sink. Applies `insert/update/replace` as a delete-then-insert
//! inside one transaction using Postgres's `jsonb_populate_record`, which
//! lets the writer build a row matching the target table's existing
//! column types without static knowledge of its schema (table/column
//! identifiers come from trusted deployment configuration, not event
//! payloads — interpolated directly, values always bound).

use crate::SinkWriter;
use async_trait::async_trait;
use rc_common::{ChangeEvent, Op, ReplicatorError, SqlKind};
use sqlx::PgPool;

pub struct SqlSinkWriter {
    pool: PgPool,
    table: String,
    key_columns: Vec<String>,
}

impl SqlSinkWriter {
    pub fn new(pool: PgPool, kind: SqlKind, table: String, key_columns: Vec<String>) -> rc_common::Result<Self> {
        if kind != SqlKind::Postgres {
            return Err(ReplicatorError::fatal("SQL sink backend currently supports kind = postgres only"));
        }
        if key_columns.is_empty() {
            return Err(ReplicatorError::Config("sql sink requires at least one key column".into()));
        }
        Ok(Self { pool, table, key_columns })
    }

}

#[async_trait]
impl SinkWriter for SqlSinkWriter {
    async fn write(&self, event: &ChangeEvent) -> rc_common::Result<()> {
        // Bound as text and cast in SQL: the workspace's sqlx build omits
        // the `json` feature, so `serde_json::Value` has no `Encode` impl —
        // the same constraint rc-source's watermark poller works around on
        // the decode side with `row_to_json(t)::text`.
        let key_text = serde_json::to_string(&event.key)?;

        let delete_sql = format!(
            "DELETE FROM {table} WHERE ({cols}) = (SELECT {selects} FROM jsonb_populate_record(null::{table}, $1::jsonb))",
            table = self.table,
            cols = self.key_columns.join(", "),
            selects = self.key_columns.join(", "),
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| ReplicatorError::transient(format!("sql sink begin failed: {e}")))?;

        sqlx::query(&delete_sql)
            .bind(&key_text)
            .execute(&mut *tx)
            .await
            .map_err(|e| ReplicatorError::transient(format!("sql sink delete failed: {e}")))?;

        if event.op != Op::Delete {
            let after = event
                .after
                .as_ref()
                .ok_or_else(|| ReplicatorError::fatal("upsert requires a post-image"))?;
            let after_text = serde_json::to_string(after)?;

            let insert_sql = format!(
                "INSERT INTO {table} SELECT * FROM jsonb_populate_record(null::{table}, $1::jsonb)",
                table = self.table,
            );
            sqlx::query(&insert_sql)
                .bind(&after_text)
                .execute(&mut *tx)
                .await
                .map_err(|e| ReplicatorError::transient(format!("sql sink insert failed: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| ReplicatorError::transient(format!("sql sink commit failed: {e}")))?;

        Ok(())
    }

    async fn flush(&self) -> rc_common::Result<()> {
        Ok(())
    }

    async fn close(&self) -> rc_common::Result<()> {
        Ok(())
    }
}
