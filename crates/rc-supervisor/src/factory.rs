//! Connects a `StreamConfig`'s declarative `source`/`targets` to live
//! backend handles, the way `fc-secrets::create_provider` dispatches on an
//! `AuthMethod` tag to build one concrete provider.

use rc_common::{ReplicatorError, SourceSpec, StreamConfig, TargetSpec};
use rc_sink::{KafkaSinkWriter, MongoSinkWriter, SearchSinkWriter, SinkWriter, SqlSinkWriter};
use rc_source::{KafkaSourceReader, MongoSourceReader, SourceReader, SqlSourceReader};
use std::sync::Arc;

pub async fn build_source(config: &StreamConfig) -> rc_common::Result<Box<dyn SourceReader>> {
    match &config.source {
        SourceSpec::Mongo { uri, database, collection, watch_operations } => {
            let client = mongodb::Client::with_uri_str(uri)
                .await
                .map_err(|e| ReplicatorError::fatal(format!("mongo source connect failed: {e}")))?;
            Ok(Box::new(MongoSourceReader::new(
                client,
                config.name.clone(),
                database.clone(),
                collection.clone(),
                watch_operations.clone(),
                config.retry_policy.clone(),
            )))
        }
        SourceSpec::Sql { kind, url, table, key_columns, watermark_column } => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .map_err(|e| ReplicatorError::fatal(format!("sql source connect failed: {e}")))?;
            let reader = SqlSourceReader::new(
                pool,
                config.name.clone(),
                "postgres".to_string(),
                *kind,
                table.clone(),
                key_columns.clone(),
                watermark_column.clone(),
            )?;
            Ok(Box::new(reader))
        }
        SourceSpec::Kafka { brokers, topic, group_id } => {
            let consumer: rdkafka::consumer::StreamConsumer = rdkafka::ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .set("group.id", group_id)
                .set("enable.auto.commit", "false")
                .create()
                .map_err(|e| ReplicatorError::fatal(format!("kafka source connect failed: {e}")))?;
            Ok(Box::new(KafkaSourceReader::new(consumer, config.name.clone(), brokers.clone(), topic.clone())))
        }
    }
}

pub async fn build_sinks(config: &StreamConfig) -> rc_common::Result<Vec<Arc<dyn SinkWriter>>> {
    let mut sinks: Vec<Arc<dyn SinkWriter>> = Vec::with_capacity(config.targets.len());
    for target in &config.targets {
        sinks.push(build_sink(target).await?);
    }
    Ok(sinks)
}

async fn build_sink(target: &TargetSpec) -> rc_common::Result<Arc<dyn SinkWriter>> {
    match target {
        TargetSpec::Mongo { uri, database, collection } => {
            let client = mongodb::Client::with_uri_str(uri)
                .await
                .map_err(|e| ReplicatorError::fatal(format!("mongo sink connect failed: {e}")))?;
            Ok(Arc::new(MongoSinkWriter::new(client, database, collection)))
        }
        TargetSpec::Sql { kind, url, table, key_columns } => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .map_err(|e| ReplicatorError::fatal(format!("sql sink connect failed: {e}")))?;
            Ok(Arc::new(SqlSinkWriter::new(pool, *kind, table.clone(), key_columns.clone())?))
        }
        TargetSpec::Search { base_url, index, auth_token, batch_max, batch_interval_ms } => {
            Ok(SearchSinkWriter::new(base_url.clone(), index.clone(), auth_token.clone(), *batch_max, *batch_interval_ms).await)
        }
        TargetSpec::Kafka { brokers, topic } => {
            let producer: rdkafka::producer::FutureProducer = rdkafka::ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .create()
                .map_err(|e| ReplicatorError::fatal(format!("kafka sink connect failed: {e}")))?;
            Ok(Arc::new(KafkaSinkWriter::new(producer, topic.clone())))
        }
    }
}
