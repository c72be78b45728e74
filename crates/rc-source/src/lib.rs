//! Source Reader (spec §4.2): one implementation per backend, behind a
//! single trait so the Stream Worker's Read task never sees backend
//! specifics.

mod kafka;
mod mongo;
mod sql;

pub use kafka::KafkaSourceReader;
pub use mongo::MongoSourceReader;
pub use sql::SqlSourceReader;

use async_trait::async_trait;
use rc_common::ChangeEvent;
use std::time::Duration;

#[derive(Debug)]
pub enum NextOutcome {
    Event(ChangeEvent),
    Idle,
    Closed,
}

/// Counts of how `update` events without a full post-image were resolved
/// (spec §4.2 fallback-fetch outcomes). `fallback_failed` is only reached
/// after the backend's own bounded retry/backoff around the fallback fetch
/// is exhausted; the event is then forwarded with `after: None` (skip with
/// counter), not retried again by the caller.
#[derive(Debug, Clone, Default)]
pub struct FallbackCounters {
    pub normal: u64,
    pub fallback: u64,
    pub empty: u64,
    pub fallback_failed: u64,
}

#[async_trait]
pub trait SourceReader: Send + Sync {
    /// `None` starts from the provider's notion of tail; `Some(position)`
    /// resumes strictly after it. Returns `Unresumable` if the source has
    /// truncated the log past `position`.
    async fn open(&mut self, resume_position: Option<Vec<u8>>) -> rc_common::Result<()>;
    async fn next(&mut self, deadline: Duration) -> rc_common::Result<NextOutcome>;
    async fn close(&mut self) -> rc_common::Result<()>;
}
