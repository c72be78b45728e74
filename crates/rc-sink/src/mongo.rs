//! Document-store sink, generalized from `fc-outbox::mongo`'s
//! filter-then-`$set`-with-upsert pattern to a by-key upsert/delete writer.

use crate::SinkWriter;
use async_trait::async_trait;
use bson::{doc, Document};
use mongodb::options::UpdateOptions;
use mongodb::Collection;
use rc_common::{ChangeEvent, Op, ReplicatorError};

pub struct MongoSinkWriter {
    collection: Collection<Document>,
}

impl MongoSinkWriter {
    pub fn new(client: mongodb::Client, database: &str, collection: &str) -> Self {
        Self { collection: client.database(database).collection(collection) }
    }

    fn key_filter(key: &std::collections::HashMap<String, serde_json::Value>) -> rc_common::Result<Document> {
        if key.is_empty() {
            return Err(ReplicatorError::fatal("upsert/delete requires a non-empty key"));
        }
        let mut filter = Document::new();
        for (field, value) in key {
            let bson_value = bson::to_bson(value)
                .map_err(|e| ReplicatorError::fatal(format!("invalid key field {field}: {e}")))?;
            filter.insert(field, bson_value);
        }
        Ok(filter)
    }
}

#[async_trait]
impl SinkWriter for MongoSinkWriter {
    async fn write(&self, event: &ChangeEvent) -> rc_common::Result<()> {
        let filter = Self::key_filter(&event.key)?;

        match event.op {
            Op::Delete => {
                self.collection
                    .delete_one(filter, None)
                    .await
                    .map_err(|e| ReplicatorError::transient(format!("mongo delete failed: {e}")))?;
            }
            _ => {
                let after = event
                    .after
                    .as_ref()
                    .ok_or_else(|| ReplicatorError::fatal("upsert requires a post-image"))?;
                let body = bson::to_document(after)
                    .map_err(|e| ReplicatorError::fatal(format!("invalid post-image: {e}")))?;
                let update = doc! { "$set": body };
                let options = UpdateOptions::builder().upsert(true).build();
                self.collection
                    .update_one(filter, update, options)
                    .await
                    .map_err(|e| ReplicatorError::transient(format!("mongo upsert failed: {e}")))?;
            }
        }
        Ok(())
    }

    async fn flush(&self) -> rc_common::Result<()> {
        Ok(())
    }

    async fn close(&self) -> rc_common::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn rejects_empty_key() {
        let err = MongoSinkWriter::key_filter(&HashMap::new()).unwrap_err();
        assert!(matches!(err, ReplicatorError::Fatal(_)));
    }

    #[test]
    fn builds_filter_from_key_fields() {
        let key = HashMap::from([("_id".to_string(), serde_json::json!("abc"))]);
        let filter = MongoSinkWriter::key_filter(&key).unwrap();
        assert_eq!(filter.get_str("_id").unwrap(), "abc");
    }
}
