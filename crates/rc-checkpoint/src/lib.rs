//! Checkpoint Store (spec §4.7): a durable `stream_name -> position`
//! mapping. Writes are serialised per key; reads must observe the latest
//! committed position for a stream, never a stale one.

mod file;
mod mongo;

pub use file::FileCheckpointStore;
pub use mongo::MongoCheckpointStore;

use async_trait::async_trait;
use rc_common::Checkpoint;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: Checkpoint) -> rc_common::Result<()>;
    async fn load(&self, stream_name: &str) -> rc_common::Result<Option<Checkpoint>>;
    async fn delete(&self, stream_name: &str) -> rc_common::Result<()>;
    async fn list(&self) -> rc_common::Result<Vec<Checkpoint>>;
}
