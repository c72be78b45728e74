//! Configuration document for the replication engine.
//!
//! Loads and validates the single structured document described in spec §6:
//! `global`, `streams[]`, `auth`, `telemetry`, `server`. This crate only
//! parses and validates the shape — the HTTP surface for editing it
//! (`/api/v1/config`, backups, hot validation endpoints) is out of scope.

use rc_common::StreamConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlobalConfig {
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
}

fn default_shutdown_deadline_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    ClientSecret,
    Certificate,
    ManagedIdentity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub method: AuthMethod,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub cert_path: Option<String>,
    pub scopes: Vec<String>,
    pub authority: String,
    #[serde(default = "default_refresh_before_secs")]
    pub refresh_before_secs: i64,
    #[serde(default = "default_skew_secs")]
    pub skew_secs: i64,
}

fn default_refresh_before_secs() -> i64 {
    300
}

fn default_skew_secs() -> i64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
    #[serde(default)]
    pub log_json: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointBackend {
    File,
    Mongo,
}

impl Default for CheckpointBackend {
    fn default() -> Self {
        CheckpointBackend::File
    }
}

/// Selects and configures the durable Checkpoint Store (spec §4.7). Not
/// part of the original admin-surface config schema; added because a
/// running process must pick one backend somewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub backend: CheckpointBackend,
    #[serde(default = "default_checkpoint_dir")]
    pub dir: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub collection: Option<String>,
}

fn default_checkpoint_dir() -> String {
    "./data/checkpoints".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            backend: CheckpointBackend::default(),
            dir: default_checkpoint_dir(),
            uri: None,
            database: None,
            collection: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub enable_cors: bool,
    #[serde(default)]
    pub cors_origins: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    90
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            enable_cors: false,
            cors_origins: Vec::new(),
            read_timeout_secs: default_timeout_secs(),
            write_timeout_secs: default_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

/// The top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    pub streams: Vec<StreamConfig>,
    pub auth: AuthConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

impl ReplicatorConfig {
    pub fn from_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_str(&contents)
    }

    /// Structural validation only — no reachability checks against the
    /// configured backends (that is left to each Source/Sink's own `open`).
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for stream in &self.streams {
            if stream.name.is_empty() {
                return Err(ConfigError::Validation("stream name must not be empty".into()));
            }
            if !seen.insert(stream.name.clone()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate stream name: {}",
                    stream.name
                )));
            }
            if stream.targets.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "stream {} has no targets configured",
                    stream.name
                )));
            }
        }

        if self.auth.method == AuthMethod::ClientSecret && self.auth.client_secret.is_none() {
            return Err(ConfigError::Validation(
                "auth.method = client_secret requires auth.client_secret".into(),
            ));
        }
        if self.auth.method == AuthMethod::Certificate && self.auth.cert_path.is_none() {
            return Err(ConfigError::Validation(
                "auth.method = certificate requires auth.cert_path".into(),
            ));
        }

        if self.checkpoint.backend == CheckpointBackend::Mongo
            && (self.checkpoint.uri.is_none() || self.checkpoint.database.is_none() || self.checkpoint.collection.is_none())
        {
            return Err(ConfigError::Validation(
                "checkpoint.backend = mongo requires uri, database and collection".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [auth]
        method = "client_secret"
        tenant_id = "tenant"
        client_id = "client"
        client_secret = "secret"
        scopes = ["https://example.com/.default"]
        authority = "https://login.example.com/tenant"

        [[streams]]
        name = "orders"
        transform_rules = []

        [streams.source]
        type = "mongo"
        uri = "mongodb://localhost:27017"
        database = "app"
        collection = "orders"

        [[streams.targets]]
        type = "mongo"
        uri = "mongodb://localhost:27018"
        database = "replica"
        collection = "orders"
    "#;

    #[test]
    fn parses_minimal_document() {
        let config = ReplicatorConfig::from_str(SAMPLE).expect("parses");
        assert_eq!(config.streams.len(), 1);
        assert_eq!(config.streams[0].name, "orders");
    }

    #[test]
    fn rejects_duplicate_stream_names() {
        let doubled = format!(
            "{}\n[[streams]]\nname = \"orders\"\n[streams.source]\ntype = \"mongo\"\nuri = \"m\"\ndatabase = \"d\"\ncollection = \"c\"\n[[streams.targets]]\ntype = \"mongo\"\nuri = \"m\"\ndatabase = \"d\"\ncollection = \"c\"\n",
            SAMPLE
        );
        let err = ReplicatorConfig::from_str(&doubled).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn rejects_missing_client_secret() {
        let bad = SAMPLE.replace("client_secret = \"secret\"", "");
        let err = ReplicatorConfig::from_str(&bad).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn checkpoint_defaults_to_file_backend() {
        let config = ReplicatorConfig::from_str(SAMPLE).expect("parses");
        assert_eq!(config.checkpoint.backend, CheckpointBackend::File);
    }

    #[test]
    fn rejects_mongo_checkpoint_backend_without_connection_details() {
        let with_mongo_checkpoint = format!("{SAMPLE}\n[checkpoint]\nbackend = \"mongo\"\n");
        let err = ReplicatorConfig::from_str(&with_mongo_checkpoint).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
