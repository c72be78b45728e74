use crate::CheckpointStore;
use async_trait::async_trait;
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Document};
use chrono::{DateTime, Utc};
use mongodb::Collection;
use rc_common::{Checkpoint, ReplicatorError};

/// Bumped whenever the persisted document shape changes (spec §6 persisted
/// state layout: "survive restart and schema bumps via a version byte").
const DOCUMENT_SCHEMA_VERSION: i32 = 1;

pub struct MongoCheckpointStore {
    collection: Collection<Document>,
}

impl MongoCheckpointStore {
    pub fn new(client: mongodb::Client, db_name: &str, collection_name: &str) -> Self {
        let db = client.database(db_name);
        Self {
            collection: db.collection(collection_name),
        }
    }

    fn to_document(checkpoint: &Checkpoint) -> Document {
        doc! {
            "_id": &checkpoint.stream_name,
            "schema_version": DOCUMENT_SCHEMA_VERSION,
            "position": Binary { subtype: BinarySubtype::Generic, bytes: checkpoint.position.clone() },
            "committed_at": bson::DateTime::from_chrono(checkpoint.committed_at),
        }
    }

    fn from_document(doc: Document) -> rc_common::Result<Checkpoint> {
        let schema_version = doc.get_i32("schema_version").unwrap_or(1);
        if schema_version > DOCUMENT_SCHEMA_VERSION {
            return Err(ReplicatorError::fatal(format!(
                "checkpoint document written by a newer schema version ({schema_version}, known up to {DOCUMENT_SCHEMA_VERSION})"
            )));
        }
        let stream_name = doc
            .get_str("_id")
            .map_err(|e| ReplicatorError::fatal(format!("checkpoint document missing _id: {e}")))?
            .to_string();
        let position = doc
            .get_binary_generic("position")
            .map_err(|e| ReplicatorError::fatal(format!("checkpoint document missing position: {e}")))?
            .to_vec();
        let committed_at: DateTime<Utc> = doc
            .get_datetime("committed_at")
            .map_err(|e| ReplicatorError::fatal(format!("checkpoint document missing committed_at: {e}")))?
            .to_chrono();
        Ok(Checkpoint { stream_name, position, committed_at })
    }
}

#[async_trait]
impl CheckpointStore for MongoCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> rc_common::Result<()> {
        let filter = doc! { "_id": &checkpoint.stream_name };
        let update = doc! { "$set": Self::to_document(&checkpoint) };
        let options = mongodb::options::UpdateOptions::builder().upsert(true).build();
        self.collection
            .update_one(filter, update, options)
            .await
            .map_err(|e| ReplicatorError::transient(format!("checkpoint save failed: {e}")))?;
        Ok(())
    }

    async fn load(&self, stream_name: &str) -> rc_common::Result<Option<Checkpoint>> {
        let filter = doc! { "_id": stream_name };
        let doc = self
            .collection
            .find_one(filter, None)
            .await
            .map_err(|e| ReplicatorError::transient(format!("checkpoint load failed: {e}")))?;
        doc.map(Self::from_document).transpose()
    }

    async fn delete(&self, stream_name: &str) -> rc_common::Result<()> {
        let filter = doc! { "_id": stream_name };
        self.collection
            .delete_one(filter, None)
            .await
            .map_err(|e| ReplicatorError::transient(format!("checkpoint delete failed: {e}")))?;
        Ok(())
    }

    async fn list(&self) -> rc_common::Result<Vec<Checkpoint>> {
        use futures::stream::TryStreamExt;
        let mut cursor = self
            .collection
            .find(None, None)
            .await
            .map_err(|e| ReplicatorError::transient(format!("checkpoint list failed: {e}")))?;
        let mut out = Vec::new();
        while let Some(doc) = cursor
            .try_next()
            .await
            .map_err(|e| ReplicatorError::transient(format!("checkpoint list cursor failed: {e}")))?
        {
            out.push(Self::from_document(doc)?);
        }
        Ok(out)
    }
}
