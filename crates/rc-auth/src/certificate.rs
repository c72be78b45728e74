//! `certificate` auth method: client_credentials grant using a signed JWT
//! client assertion (RFC 7523) instead of a shared secret.

use crate::cache::{cache_key, TokenCache};
use crate::{validate_scopes, CredentialProvider};
use async_trait::async_trait;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rc_common::{CachedToken, CredentialMetrics, ReplicatorError};
use rc_config::AuthConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

pub struct CertificateProvider {
    http: reqwest::Client,
    config: AuthConfig,
    token_endpoint: String,
    encoding_key: EncodingKey,
    cache: TokenCache,
}

#[derive(Serialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    aud: String,
    jti: String,
    nbf: i64,
    exp: i64,
    iat: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

impl CertificateProvider {
    pub fn new(config: AuthConfig) -> rc_common::Result<Self> {
        let cert_path = config
            .cert_path
            .clone()
            .ok_or_else(|| ReplicatorError::Config("certificate auth requires cert_path".into()))?;
        let pem = std::fs::read(&cert_path)
            .map_err(|e| ReplicatorError::Config(format!("failed to read {cert_path}: {e}")))?;
        let encoding_key = EncodingKey::from_rsa_pem(&pem)
            .map_err(|e| ReplicatorError::Config(format!("invalid certificate key at {cert_path}: {e}")))?;
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
            encoding_key,
        })
    }

    fn build_assertion(&self) -> rc_common::Result<String> {
        let now = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: self.config.client_id.clone(),
            sub: self.config.client_id.clone(),
            aud: self.token_endpoint.clone(),
            jti: uuid::Uuid::new_v4().to_string(),
            nbf: now,
            exp: now + 300,
            iat: now,
        };
        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| ReplicatorError::CredentialError(format!("failed to sign client assertion: {e}")))
    }

    async fn fetch(&self, scopes: &[String]) -> rc_common::Result<CachedToken> {
        let assertion = self.build_assertion()?;
        let scope = scopes.join(" ");
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_assertion_type", ASSERTION_TYPE),
            ("client_assertion", assertion.as_str()),
            ("scope", scope.as_str()),
        ];

        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|e| ReplicatorError::transient(format!("token request failed: {e}")))?;

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
impl CredentialProvider for CertificateProvider {
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
