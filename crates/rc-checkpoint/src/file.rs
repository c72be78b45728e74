//! Local-file checkpoint store, for development and single-node
//! deployments that have no Mongo cluster handy (same role fc-queue's
//! SQLite backend plays as a dev-mode substitute for the primary store).

use crate::CheckpointStore;
use async_trait::async_trait;
use dashmap::DashMap;
use rc_common::{Checkpoint, ReplicatorError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Bumped whenever `Record`'s shape changes, so a future version can detect
/// and migrate records written by an older binary (spec §6 persisted state
/// layout).
const RECORD_SCHEMA_VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct Record {
    #[serde(default = "default_schema_version")]
    schema_version: u8,
    position: Vec<u8>,
    committed_at: chrono::DateTime<chrono::Utc>,
}

fn default_schema_version() -> u8 {
    1
}

pub struct FileCheckpointStore {
    dir: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl FileCheckpointStore {
    pub async fn new(dir: impl AsRef<Path>) -> rc_common::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ReplicatorError::fatal(format!("failed to create checkpoint dir {dir:?}: {e}")))?;
        Ok(Self { dir, locks: DashMap::new() })
    }

    fn path_for(&self, stream_name: &str) -> PathBuf {
        self.dir.join(format!("{stream_name}.json"))
    }

    fn lock_for(&self, stream_name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(stream_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> rc_common::Result<()> {
        let lock = self.lock_for(&checkpoint.stream_name);
        let _guard = lock.lock().await;

        let record = Record {
            schema_version: RECORD_SCHEMA_VERSION,
            position: checkpoint.position,
            committed_at: checkpoint.committed_at,
        };
        let bytes = serde_json::to_vec(&record)?;

        let final_path = self.path_for(&checkpoint.stream_name);
        let tmp_path = final_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(())
    }

    async fn load(&self, stream_name: &str) -> rc_common::Result<Option<Checkpoint>> {
        let lock = self.lock_for(stream_name);
        let _guard = lock.lock().await;

        let path = self.path_for(stream_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let record: Record = serde_json::from_slice(&bytes)?;
                if record.schema_version > RECORD_SCHEMA_VERSION {
                    return Err(ReplicatorError::fatal(format!(
                        "checkpoint for {stream_name} was written by a newer schema version ({}, known up to {})",
                        record.schema_version, RECORD_SCHEMA_VERSION
                    )));
                }
                Ok(Some(Checkpoint {
                    stream_name: stream_name.to_string(),
                    position: record.position,
                    committed_at: record.committed_at,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ReplicatorError::Io(e)),
        }
    }

    async fn delete(&self, stream_name: &str) -> rc_common::Result<()> {
        let lock = self.lock_for(stream_name);
        let _guard = lock.lock().await;

        match tokio::fs::remove_file(self.path_for(stream_name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ReplicatorError::Io(e)),
        }
    }

    async fn list(&self) -> rc_common::Result<Vec<Checkpoint>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(checkpoint) = self.load(stem).await? {
                out.push(checkpoint);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).await.unwrap();

        assert!(store.load("orders").await.unwrap().is_none());

        store
            .save(Checkpoint { stream_name: "orders".into(), position: vec![1, 2, 3], committed_at: chrono::Utc::now() })
            .await
            .unwrap();

        let loaded = store.load("orders").await.unwrap().unwrap();
        assert_eq!(loaded.position, vec![1, 2, 3]);

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 1);

        store.delete("orders").await.unwrap();
        assert!(store.load("orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_save_wins_on_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).await.unwrap();

        store
            .save(Checkpoint { stream_name: "s".into(), position: vec![1], committed_at: chrono::Utc::now() })
            .await
            .unwrap();
        store
            .save(Checkpoint { stream_name: "s".into(), position: vec![2], committed_at: chrono::Utc::now() })
            .await
            .unwrap();

        let loaded = store.load("s").await.unwrap().unwrap();
        assert_eq!(loaded.position, vec![2]);
    }

    #[tokio::test]
    async fn rejects_record_from_a_newer_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path()).await.unwrap();

        let future_record = serde_json::json!({
            "schema_version": RECORD_SCHEMA_VERSION + 1,
            "position": [1, 2, 3],
            "committed_at": chrono::Utc::now(),
        });
        tokio::fs::write(dir.path().join("s.json"), serde_json::to_vec(&future_record).unwrap())
            .await
            .unwrap();

        let err = store.load("s").await.unwrap_err();
        assert!(matches!(err, ReplicatorError::Fatal(_)));
    }
}
