//! Sink Writer (spec §4.3): idempotent by-key apply to one target backend.
//! `Ack` is modeled as `Ok(())`; `RetryableError`/`FatalError` are the
//! corresponding `ReplicatorError::Retryable`/`Fatal` variant.

mod kafka;
mod mongo;
mod search;
mod sql;

pub use kafka::KafkaSinkWriter;
pub use mongo::MongoSinkWriter;
pub use search::SearchSinkWriter;
pub use sql::SqlSinkWriter;

use async_trait::async_trait;
use rc_common::ChangeEvent;

#[async_trait]
pub trait SinkWriter: Send + Sync {
    async fn write(&self, event: &ChangeEvent) -> rc_common::Result<()>;
    /// For batching writers: returns only once every buffered ack lands.
    async fn flush(&self) -> rc_common::Result<()>;
    async fn close(&self) -> rc_common::Result<()>;
    fn supports_batching(&self) -> bool {
        false
    }
}
