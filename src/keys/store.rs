use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use turso::Database;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::constants::{KEY_PREFIX_LEN, SECRET_PREFIX};
use crate::db::{self, opt_u64, timestamp_millis};
use crate::error::GatewayError;

/// A client credential. The secret hash stays in the database and is never
/// part of this type, so no read path can leak it.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    /// First characters of the plaintext secret, for display and lookup
    pub key_prefix: String,
    pub is_active: bool,
    /// Per-minute request budget (None = gateway default)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_per_minute: Option<u32>,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<u64>,
}

/// Partial update; None leaves the field unchanged
#[derive(Debug, Default, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct KeyUpdate {
    pub name: Option<String>,
    pub is_active: Option<bool>,
    pub rate_limit_per_minute: Option<u32>,
}

pub struct ApiKeyStore {
    db: Arc<Database>,
}

fn generate_secret() -> String {
    let suffix = {
        let mut rng = rand::rng();
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    };
    format!("{SECRET_PREFIX}{suffix}")
}

fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn secret_prefix(secret: &str) -> String {
    secret.chars().take(KEY_PREFIX_LEN).collect()
}

fn row_to_key(row: &turso::Row) -> Result<ApiKey, GatewayError> {
    Ok(ApiKey {
        id: row
            .get::<String>(0)
            .map_err(|e| GatewayError::Database(format!("Failed to read key row: {e}")))?,
        name: row.get::<String>(1).unwrap_or_default(),
        key_prefix: row.get::<String>(2).unwrap_or_default(),
        is_active: row.get::<i64>(3).unwrap_or(0) != 0,
        rate_limit_per_minute: opt_u64(row, 4).map(|v| v as u32),
        created_at: db::get_u64(row, 5),
        last_used_at: opt_u64(row, 6),
    })
}

const KEY_COLUMNS: &str =
    "id, name, key_prefix, is_active, rate_limit_per_minute, created_at, last_used_at";

impl ApiKeyStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create a new key. Returns the record and the plaintext secret, which
    /// is shown exactly once and unrecoverable afterwards.
    pub async fn create(
        &self,
        name: String,
        rate_limit_per_minute: Option<u32>,
    ) -> Result<(ApiKey, String), GatewayError> {
        let plaintext = generate_secret();
        let key_hash = hash_secret(&plaintext);

        let key = ApiKey {
            id: Uuid::new_v4().to_string(),
            name,
            key_prefix: secret_prefix(&plaintext),
            is_active: true,
            rate_limit_per_minute,
            created_at: timestamp_millis(),
            last_used_at: None,
        };

        let conn = db::connect(&self.db)?;
        conn.execute(
            "INSERT INTO api_keys (id, name, key_prefix, key_hash, is_active, rate_limit_per_minute, created_at) \
             VALUES (?, ?, ?, ?, 1, ?, ?)",
            (
                key.id.as_str(),
                key.name.as_str(),
                key.key_prefix.as_str(),
                key_hash.as_str(),
                key.rate_limit_per_minute.map(|v| v as i64),
                key.created_at as i64,
            ),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to insert key: {e}")))?;

        Ok((key, plaintext))
    }

    /// Look up a key by its plaintext secret. Candidates are narrowed by the
    /// non-secret prefix, then hashes are compared in constant time so the
    /// comparison cost is independent of the presented secret. Revoked keys
    /// are returned as-is; the auth layer decides how to reject them.
    pub async fn resolve(&self, secret: &str) -> Result<Option<ApiKey>, GatewayError> {
        let presented_hash = hash_secret(secret);
        let prefix = secret_prefix(secret);

        let conn = db::connect(&self.db)?;
        let mut rows = conn
            .query(
                &format!("SELECT {KEY_COLUMNS}, key_hash FROM api_keys WHERE key_prefix = ?"),
                [prefix.as_str()],
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to query key: {e}")))?;

        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to read key row: {e}")))?
        {
            let stored_hash = row.get::<String>(7).unwrap_or_default();
            if bool::from(stored_hash.as_bytes().ct_eq(presented_hash.as_bytes())) {
                return Ok(Some(row_to_key(&row)?));
            }
        }

        Ok(None)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ApiKey>, GatewayError> {
        let conn = db::connect(&self.db)?;
        let mut rows = conn
            .query(
                &format!("SELECT {KEY_COLUMNS} FROM api_keys WHERE id = ?"),
                [id],
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to query key: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to read key row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_key(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self, active_only: bool) -> Result<Vec<ApiKey>, GatewayError> {
        let conn = db::connect(&self.db)?;
        let sql = if active_only {
            format!(
                "SELECT {KEY_COLUMNS} FROM api_keys WHERE is_active = 1 ORDER BY created_at DESC"
            )
        } else {
            format!("SELECT {KEY_COLUMNS} FROM api_keys ORDER BY created_at DESC")
        };

        let mut rows = conn
            .query(&sql, ())
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to list keys: {e}")))?;

        let mut keys = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to read key row: {e}")))?
        {
            keys.push(row_to_key(&row)?);
        }
        Ok(keys)
    }

    pub async fn update(
        &self,
        id: &str,
        update: KeyUpdate,
    ) -> Result<Option<ApiKey>, GatewayError> {
        let Some(existing) = self.get(id).await? else {
            return Ok(None);
        };

        let name = update.name.unwrap_or(existing.name);
        let is_active = update.is_active.unwrap_or(existing.is_active);
        let rate_limit = update
            .rate_limit_per_minute
            .or(existing.rate_limit_per_minute);

        let conn = db::connect(&self.db)?;
        conn.execute(
            "UPDATE api_keys SET name = ?, is_active = ?, rate_limit_per_minute = ? WHERE id = ?",
            (
                name.as_str(),
                is_active as i64,
                rate_limit.map(|v| v as i64),
                id,
            ),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to update key: {e}")))?;

        self.get(id).await
    }

    /// Revoke a key (soft delete). History stays queryable; the key can be
    /// re-enabled through update.
    pub async fn revoke(&self, id: &str) -> Result<bool, GatewayError> {
        let conn = db::connect(&self.db)?;
        let affected = conn
            .execute("UPDATE api_keys SET is_active = 0 WHERE id = ?", [id])
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to revoke key: {e}")))?;
        Ok(affected > 0)
    }

    /// Record a successful authentication. The guard keeps last_used_at
    /// monotonically non-decreasing under concurrent touches.
    pub async fn touch_last_used(&self, id: &str) -> Result<(), GatewayError> {
        let now = timestamp_millis();
        let conn = db::connect(&self.db)?;
        conn.execute(
            "UPDATE api_keys SET last_used_at = ? WHERE id = ? \
             AND (last_used_at IS NULL OR last_used_at < ?)",
            (now as i64, id, now as i64),
        )
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to touch key: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> ApiKeyStore {
        let db = crate::db::open_in_memory().await.unwrap();
        ApiKeyStore::new(db)
    }

    #[tokio::test]
    async fn test_create_and_resolve() {
        let store = test_store().await;
        let (key, secret) = store.create("test".into(), Some(20)).await.unwrap();

        assert!(secret.starts_with(SECRET_PREFIX));
        assert_eq!(key.key_prefix, secret_prefix(&secret));
        assert!(key.is_active);
        assert_eq!(key.rate_limit_per_minute, Some(20));

        let resolved = store.resolve(&secret).await.unwrap().unwrap();
        assert_eq!(resolved.id, key.id);
    }

    #[tokio::test]
    async fn test_resolve_unknown_secret() {
        let store = test_store().await;
        store.create("test".into(), None).await.unwrap();

        assert!(store.resolve("ak_does-not-exist").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_twice_distinct_secrets() {
        let store = test_store().await;
        let (key1, secret1) = store.create("one".into(), None).await.unwrap();
        let (key2, secret2) = store.create("two".into(), None).await.unwrap();

        assert_ne!(secret1, secret2);
        assert_ne!(key1.id, key2.id);
    }

    #[tokio::test]
    async fn test_revoked_key_resolves_inactive() {
        let store = test_store().await;
        let (key, secret) = store.create("test".into(), None).await.unwrap();

        assert!(store.revoke(&key.id).await.unwrap());

        // The record is retained for audit but flagged inactive
        let resolved = store.resolve(&secret).await.unwrap().unwrap();
        assert!(!resolved.is_active);
        assert!(store.get(&key.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_revoke_unknown_key() {
        let store = test_store().await;
        assert!(!store.revoke("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_update_fields() {
        let store = test_store().await;
        let (key, _) = store.create("old".into(), None).await.unwrap();

        let updated = store
            .update(
                &key.id,
                KeyUpdate {
                    name: Some("new".into()),
                    rate_limit_per_minute: Some(50),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.name, "new");
        assert_eq!(updated.rate_limit_per_minute, Some(50));
        assert!(updated.is_active);
    }

    #[tokio::test]
    async fn test_list_active_only() {
        let store = test_store().await;
        let (active, _) = store.create("active".into(), None).await.unwrap();
        let (revoked, _) = store.create("revoked".into(), None).await.unwrap();
        store.revoke(&revoked.id).await.unwrap();

        assert_eq!(store.list(false).await.unwrap().len(), 2);

        let active_list = store.list(true).await.unwrap();
        assert_eq!(active_list.len(), 1);
        assert_eq!(active_list[0].id, active.id);
    }

    #[tokio::test]
    async fn test_touch_last_used_monotonic() {
        let store = test_store().await;
        let (key, _) = store.create("test".into(), None).await.unwrap();

        store.touch_last_used(&key.id).await.unwrap();
        let first = store.get(&key.id).await.unwrap().unwrap().last_used_at;
        assert!(first.is_some());

        store.touch_last_used(&key.id).await.unwrap();
        let second = store.get(&key.id).await.unwrap().unwrap().last_used_at;
        assert!(second >= first);
    }

    #[test]
    fn test_hash_is_stable_hex() {
        let h = hash_secret("ak_abc");
        assert_eq!(h.len(), 64);
        assert_eq!(h, hash_secret("ak_abc"));
        assert_ne!(h, hash_secret("ak_abd"));
    }
}
