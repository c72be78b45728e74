//! Credential Provider (spec §4.1): issues bearer tokens against an OIDC
//! identity authority for database-scope audiences, with single-flight
//! refresh, pre-expiry proactive renewal, and a scope allowlist.

use async_trait::async_trait;
use rc_common::{CredentialMetrics, ReplicatorError};
use rc_config::{AuthConfig, AuthMethod};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

mod cache;
mod certificate;
mod client_secret;
mod managed_identity;

pub use certificate::CertificateProvider;
pub use client_secret::ClientSecretProvider;
pub use managed_identity::ManagedIdentityProvider;
pub use rc_common::CachedToken;

/// Implemented by every auth method backend. `scopes` is the set of
/// audience URIs the caller needs; the scope allowlist in `AuthConfig` is
/// enforced before any upstream call is made.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn get_token(&self, scopes: &[String]) -> rc_common::Result<CachedToken>;
    /// Called periodically by `spawn_background_refresh`: refreshes the
    /// cached token for `scopes` only if it is missing or within its
    /// configured `refresh_before_secs` window of expiry, otherwise no-op.
    async fn refresh_if_due(&self, scopes: &[String]) -> rc_common::Result<()>;
    /// Testing hook (spec §4.1): forces the next `get_token` to refresh.
    fn clear_cache(&self);
    async fn metrics(&self) -> CredentialMetrics;
}

/// Rejects any requested scope outside the configured allowlist
/// (spec §4.1 — validated before the upstream request, not after).
pub(crate) fn validate_scopes(config: &AuthConfig, scopes: &[String]) -> rc_common::Result<()> {
    if scopes.is_empty() {
        return Err(ReplicatorError::Config("get_token requires at least one scope".into()));
    }
    for scope in scopes {
        if !config.scopes.iter().any(|allowed| allowed == scope) {
            return Err(ReplicatorError::Config(format!(
                "scope {scope} is not in the configured allowlist"
            )));
        }
    }
    Ok(())
}

/// Builds the configured auth method's provider.
pub fn create_provider(config: AuthConfig) -> rc_common::Result<Arc<dyn CredentialProvider>> {
    match config.method {
        AuthMethod::ClientSecret => Ok(Arc::new(ClientSecretProvider::new(config)?)),
        AuthMethod::Certificate => Ok(Arc::new(CertificateProvider::new(config)?)),
        AuthMethod::ManagedIdentity => Ok(Arc::new(ManagedIdentityProvider::new(config)?)),
    }
}

/// Spawns a background task that periodically calls `refresh_if_due`,
/// which is a no-op against the cache until the token is within its
/// `refresh_before_secs` window. This is how pre-expiry proactive renewal
/// happens without the foreground read/transform/write path ever blocking
/// on a refresh. `check_interval` should be no coarser than
/// `refresh_before_secs` itself, or a token could sit past its renewal
/// window for a full tick before this task notices.
pub fn spawn_background_refresh(
    provider: Arc<dyn CredentialProvider>,
    scopes: Vec<String>,
    check_interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = provider.refresh_if_due(&scopes).await {
                        warn!(error = %err, "background credential refresh failed");
                    }
                }
                _ = shutdown.recv() => {
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AuthConfig {
        AuthConfig {
            method: AuthMethod::ClientSecret,
            tenant_id: "tenant".into(),
            client_id: "client".into(),
            client_secret: Some("secret".into()),
            cert_path: None,
            scopes: vec!["https://example.com/.default".into()],
            authority: "https://login.example.com/tenant".into(),
            refresh_before_secs: 300,
            skew_secs: 300,
        }
    }

    #[test]
    fn rejects_empty_scope_list() {
        let err = validate_scopes(&config(), &[]).unwrap_err();
        assert!(matches!(err, ReplicatorError::Config(_)));
    }

    #[test]
    fn accepts_allowlisted_scope() {
        assert!(validate_scopes(&config(), &["https://example.com/.default".to_string()]).is_ok());
    }

    #[test]
    fn factory_dispatches_on_method() {
        let provider = create_provider(config());
        assert!(provider.is_ok());
    }
}
