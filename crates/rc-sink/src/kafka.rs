//! Topic sink. A delete is published as a tombstone (null payload) under the
//! record's key, following Kafka's log-compaction convention; inserts,
//! updates, and replaces publish the post-image.

use crate::SinkWriter;
use async_trait::async_trait;
use rc_common::{ChangeEvent, Op, ReplicatorError};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::time::Duration;

pub struct KafkaSinkWriter {
    producer: FutureProducer,
    topic: String,
}

impl KafkaSinkWriter {
    pub fn new(producer: FutureProducer, topic: String) -> Self {
        Self { producer, topic }
    }

    fn record_key(event: &ChangeEvent) -> rc_common::Result<String> {
        let value = serde_json::to_value(&event.key)?;
        Ok(value.to_string())
    }
}

#[async_trait]
impl SinkWriter for KafkaSinkWriter {
    async fn write(&self, event: &ChangeEvent) -> rc_common::Result<()> {
        let key = Self::record_key(event)?;

        let payload = match event.op {
            Op::Delete => None,
            _ => Some(
                serde_json::to_string(
                    event
                        .after
                        .as_ref()
                        .ok_or_else(|| ReplicatorError::fatal("publish requires a post-image"))?,
                )?,
            ),
        };

        let mut record = FutureRecord::to(&self.topic).key(&key);
        if let Some(ref body) = payload {
            record = record.payload(body);
        }

        self.producer
            .send(record, Timeout::After(Duration::from_secs(10)))
            .await
            .map_err(|(e, _)| ReplicatorError::transient(format!("kafka sink publish failed: {e}")))?;

        Ok(())
    }

    async fn flush(&self) -> rc_common::Result<()> {
        self.producer
            .flush(Duration::from_secs(10))
            .map_err(|e| ReplicatorError::transient(format!("kafka sink flush failed: {e}")))
    }

    async fn close(&self) -> rc_common::Result<()> {
        self.flush().await
    }
}
