//! `client_secret` auth method: OAuth2 client_credentials grant against an
//! OIDC token authority (spec §4.1).

use crate::cache::{cache_key, TokenCache};
use crate::{validate_scopes, CredentialProvider};
use async_trait::async_trait;
use rc_common::{CachedToken, CredentialMetrics, ReplicatorError};
use rc_config::AuthConfig;
use serde::Deserialize;
use std::time::Duration;

pub struct ClientSecretProvider {
    http: reqwest::Client,
    config: AuthConfig,
    token_endpoint: String,
    cache: TokenCache,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

impl ClientSecretProvider {
    pub fn new(config: AuthConfig) -> rc_common::Result<Self> {
        if config.client_secret.is_none() {
            return Err(ReplicatorError::Config("client_secret auth requires client_secret".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ReplicatorError::fatal(format!("failed to build http client: {e}")))?;
        let token_endpoint = format!("{}/oauth2/v2.0/token", config.authority.trim_end_matches('/'));
        Ok(Self {
            http,
            cache: TokenCache::new(config.skew_secs),
            config,
            token_endpoint,
        })
    }

    async fn fetch(&self, scopes: &[String]) -> rc_common::Result<CachedToken> {
        let secret = self
            .config
            .client_secret
            .as_deref()
            .ok_or_else(|| ReplicatorError::Config("missing client_secret".into()))?;
        let scope = scopes.join(" ");
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", secret),
            ("scope", scope.as_str()),
        ];

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ReplicatorError::transient(format!("token request timed out: {e}"))
                } else {
                    ReplicatorError::transient(format!("token request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReplicatorError::CredentialError(format!(
                "authority refused token request ({status}): {body}"
            )));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| ReplicatorError::CredentialError(format!("malformed token response: {e}")))?;

        Ok(CachedToken {
            access_token: parsed.access_token,
            expires_at: chrono::Utc::now() + chrono::Duration::seconds(parsed.expires_in),
            scopes: scopes.to_vec(),
        })
    }
}

#[async_trait]
impl CredentialProvider for ClientSecretProvider {
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
