use axum::http::{HeaderMap, header};

use crate::AppState;
use crate::error::GatewayError;
use crate::keys::rate_limit::retry_after_secs;
use crate::keys::{Admission, ApiKey};

/// Extract API key from Authorization: Bearer header
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

/// Extract API key from either X-API-Key or Authorization header
fn extract_api_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(key) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(key);
    }

    extract_bearer_token(headers)
}

/// Resolve the caller's credential. Fails before the rate limiter is ever
/// consulted; a revoked key is rejected distinctly from an unknown one.
pub async fn authenticate(
    headers: &HeaderMap,
    state: &AppState,
) -> Result<ApiKey, GatewayError> {
    let secret = extract_api_key(headers).ok_or(GatewayError::MissingApiKey)?;

    let key = state
        .api_keys
        .resolve(secret)
        .await?
        .ok_or(GatewayError::InvalidApiKey)?;

    if !key.is_active {
        tracing::warn!("Revoked API key used: {}...", key.key_prefix);
        return Err(GatewayError::KeyRevoked);
    }

    // Touch last-used off the request path; a failed touch never fails the
    // caller
    let store = state.api_keys.clone();
    let id = key.id.clone();
    tokio::spawn(async move {
        if let Err(e) = store.touch_last_used(&id).await {
            tracing::warn!("Failed to update last-used for key {id}: {e}");
        }
    });

    Ok(key)
}

/// Ask the rate limiter for admission under the key's own budget (or the
/// gateway default). Rejection carries the retry hint.
pub fn admit(state: &AppState, key: &ApiKey) -> Result<(), GatewayError> {
    let limit = key
        .rate_limit_per_minute
        .unwrap_or(state.default_rate_limit);

    match state.rate_limiter.admit(&key.id, limit) {
        Admission::Admitted => Ok(()),
        Admission::Rejected { retry_after } => Err(GatewayError::RateLimitExceeded {
            retry_after_secs: retry_after_secs(retry_after),
        }),
    }
}

/// Full pre-dispatch pipeline: authenticate, then admit
pub async fn authorize(headers: &HeaderMap, state: &AppState) -> Result<ApiKey, GatewayError> {
    let key = authenticate(headers, state).await?;
    admit(state, &key)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResponseCache;
    use crate::keys::{ApiKeyStore, RateLimiter};
    use crate::provider::{Completion, CompletionProvider, CompletionRequest, StreamEvent};
    use crate::usage::UsageLedger;
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct StubProvider;

    #[async_trait]
    impl CompletionProvider for StubProvider {
        async fn complete(&self, _: CompletionRequest) -> Result<Completion, GatewayError> {
            Err(GatewayError::Upstream("stub".into()))
        }

        async fn stream_complete(
            &self,
            _: CompletionRequest,
        ) -> Result<mpsc::Receiver<StreamEvent>, GatewayError> {
            Err(GatewayError::Upstream("stub".into()))
        }
    }

    async fn test_state() -> Arc<AppState> {
        let db = crate::db::open_in_memory().await.unwrap();
        Arc::new(AppState {
            db: db.clone(),
            api_keys: Arc::new(ApiKeyStore::new(db.clone())),
            rate_limiter: Arc::new(RateLimiter::new(Duration::from_secs(60))),
            ledger: UsageLedger::new(db),
            provider: Arc::new(StubProvider),
            cache: Arc::new(ResponseCache::new(Duration::from_secs(60))),
            default_rate_limit: 10,
            default_model: "gpt-3.5-turbo".into(),
            admin_credentials: ("admin".into(), "admin".into()),
            disable_auth: true,
        })
    }

    fn headers_with_key(secret: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(secret).unwrap());
        headers
    }

    #[tokio::test]
    async fn test_missing_header_rejected() {
        let state = test_state().await;
        let result = authenticate(&HeaderMap::new(), &state).await;
        assert!(matches!(result, Err(GatewayError::MissingApiKey)));
    }

    #[tokio::test]
    async fn test_unknown_secret_rejected() {
        let state = test_state().await;
        let result = authenticate(&headers_with_key("ak_not-a-real-key"), &state).await;
        assert!(matches!(result, Err(GatewayError::InvalidApiKey)));
    }

    #[tokio::test]
    async fn test_valid_secret_authenticates() {
        let state = test_state().await;
        let (created, secret) = state.api_keys.create("test".into(), None).await.unwrap();

        let key = authenticate(&headers_with_key(&secret), &state).await.unwrap();
        assert_eq!(key.id, created.id);
    }

    #[tokio::test]
    async fn test_bearer_header_also_accepted() {
        let state = test_state().await;
        let (_, secret) = state.api_keys.create("test".into(), None).await.unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {secret}")).unwrap(),
        );
        assert!(authenticate(&headers, &state).await.is_ok());
    }

    #[tokio::test]
    async fn test_revoked_key_never_authenticates() {
        let state = test_state().await;
        let (created, secret) = state.api_keys.create("test".into(), None).await.unwrap();
        state.api_keys.revoke(&created.id).await.unwrap();

        let result = authenticate(&headers_with_key(&secret), &state).await;
        assert!(matches!(result, Err(GatewayError::KeyRevoked)));
    }

    #[tokio::test]
    async fn test_limit_two_admits_two_rejects_third() {
        let state = test_state().await;
        let (_, secret) = state.api_keys.create("test".into(), Some(2)).await.unwrap();
        let headers = headers_with_key(&secret);

        assert!(authorize(&headers, &state).await.is_ok());
        assert!(authorize(&headers, &state).await.is_ok());

        match authorize(&headers, &state).await {
            Err(GatewayError::RateLimitExceeded { retry_after_secs }) => {
                assert!(retry_after_secs > 0);
            }
            other => panic!("expected rate limit rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_default_limit_applies_without_per_key_limit() {
        let state = test_state().await;
        let (_, secret) = state.api_keys.create("test".into(), None).await.unwrap();
        let headers = headers_with_key(&secret);

        // default_rate_limit is 10 in the test state
        for _ in 0..10 {
            assert!(authorize(&headers, &state).await.is_ok());
        }
        assert!(matches!(
            authorize(&headers, &state).await,
            Err(GatewayError::RateLimitExceeded { .. })
        ));
    }
}
