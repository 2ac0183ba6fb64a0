//! In-process TTL cache for buffered completion responses.
//!
//! Keys are derived from a SHA-256 digest of the canonical request JSON, so
//! identical requests hit the same entry regardless of caller. A miss or any
//! internal inconsistency just means the request goes upstream; the cache can
//! never fail a request.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tokio::time::Instant;

struct CacheEntry {
    body: String,
    stored_at: Instant,
}

pub struct ResponseCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

fn cache_key(namespace: &str, request: &Value) -> String {
    let canonical = request.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest: String = hasher
        .finalize()
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect();
    format!("{namespace}:{digest}")
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, namespace: &str, request: &Value) -> Option<String> {
        let key = cache_key(namespace, request);
        let entries = self.entries.read().await;
        let entry = entries.get(&key)?;
        if entry.stored_at.elapsed() >= self.ttl {
            return None;
        }
        Some(entry.body.clone())
    }

    pub async fn put(&self, namespace: &str, request: &Value, body: String) {
        let key = cache_key(namespace, request);
        let mut entries = self.entries.write().await;
        // Expired entries ride along until the next write touches the map
        entries.retain(|_, e| e.stored_at.elapsed() < self.ttl);
        entries.insert(
            key,
            CacheEntry {
                body,
                stored_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_hit_returns_stored_body() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let request = json!({ "text": "hello" });

        assert!(cache.get("chat", &request).await.is_none());
        cache.put("chat", &request, "response".into()).await;
        assert_eq!(cache.get("chat", &request).await.as_deref(), Some("response"));
    }

    #[tokio::test]
    async fn test_distinct_requests_do_not_collide() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        cache.put("chat", &json!({ "text": "a" }), "A".into()).await;
        cache.put("chat", &json!({ "text": "b" }), "B".into()).await;

        assert_eq!(cache.get("chat", &json!({ "text": "a" })).await.as_deref(), Some("A"));
        assert_eq!(cache.get("chat", &json!({ "text": "b" })).await.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let cache = ResponseCache::new(Duration::from_secs(60));
        let request = json!({ "text": "same" });
        cache.put("chat", &request, "chat-body".into()).await;

        assert!(cache.get("summarize", &request).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = ResponseCache::new(Duration::from_secs(10));
        let request = json!({ "text": "hello" });
        cache.put("chat", &request, "response".into()).await;

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get("chat", &request).await.is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("chat", &request).await.is_none());
    }
}
