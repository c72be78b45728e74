//! `managed_identity` auth method: tokens are issued by the host's instance
//! metadata service rather than an explicit secret or certificate.

use crate::cache::{cache_key, TokenCache};
use crate::{validate_scopes, CredentialProvider};
use async_trait::async_trait;
use rc_common::{CachedToken, CredentialMetrics, ReplicatorError};
use rc_config::AuthConfig;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/identity/oauth2/token";

pub struct ManagedIdentityProvider {
    http: reqwest::Client,
    config: AuthConfig,
    imds_endpoint: String,
    cache: TokenCache,
}

#[derive(Deserialize)]
struct ImdsTokenResponse {
    access_token: String,
    expires_in: String,
}

impl ManagedIdentityProvider {
    pub fn new(config: AuthConfig) -> rc_common::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ReplicatorError::fatal(format!("failed to build http client: {e}")))?;
        Ok(Self {
            http,
            cache: TokenCache::new(config.skew_secs),
            config,
            imds_endpoint: DEFAULT_IMDS_ENDPOINT.to_string(),
        })
    }

    async fn fetch(&self, scopes: &[String]) -> rc_common::Result<CachedToken> {
        let resource = scopes
            .first()
            .ok_or_else(|| ReplicatorError::Config("managed identity requires at least one scope".into()))?
            .trim_end_matches("/.default")
            .to_string();

        let response = self
            .http
            .get(&self.imds_endpoint)
            .header("Metadata", "true")
            .query(&[("api-version", "2018-02-01"), ("resource", resource.as_str())])
            .send()
            .await
            .map_err(|e| ReplicatorError::transient(format!("instance metadata request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReplicatorError::CredentialError(format!(
                "instance metadata service refused request ({status}): {body}"
            )));
        }

        let parsed: ImdsTokenResponse = response
            .json()
            .await
            .map_err(|e| ReplicatorError::CredentialError(format!("malformed instance metadata response: {e}")))?;

        let expires_in: i64 = parsed
            .expires_in
            .parse()
            .map_err(|_| ReplicatorError::CredentialError("non-numeric expires_in from instance metadata".into()))?;

        Ok(CachedToken {
            access_token: parsed.access_token,
            expires_at: chrono::Utc::now() + chrono::Duration::seconds(expires_in),
            scopes: scopes.to_vec(),
        })
    }
}

#[async_trait]
impl CredentialProvider for ManagedIdentityProvider {
    async fn get_token(&self, scopes: &[String]) -> rc_common::Result<CachedToken> {
        validate_scopes(&self.config, scopes)?;
        let key = cache_key(&self.config.client_id, scopes);
        let scopes = scopes.to_vec();
        self.cache.get_or_refresh(&key, || self.fetch(&scopes)).await
    }

    async fn refresh_if_due(&self, scopes: &[String]) -> rc_common::Result<()> {
        validate_scopes(&self.config, scopes)?;
        let key = cache_key(&self.config.client_id, scopes);
        let scopes = scopes.to_vec();
        self.cache.refresh_if_due(&key, self.config.refresh_before_secs, || self.fetch(&scopes)).await
    }

    fn clear_cache(&self) {
        self.cache.clear();
    }

    async fn metrics(&self) -> CredentialMetrics {
        self.cache.metrics().await
    }
}
