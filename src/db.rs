use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;
use turso::{Builder, Connection, Database};

use crate::error::GatewayError;

/// Open the database file and create all tables
pub async fn open(path: &Path) -> Result<Arc<Database>, GatewayError> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            GatewayError::Database(format!("Failed to create DB directory: {e}"))
        })?;
    }

    let path_str = path.to_str().unwrap_or("gateway.db");
    let db = Builder::new_local(path_str)
        .build()
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to open database: {e}")))?;

    create_schema(&db).await?;

    info!("Database initialized at {}", path_str);
    Ok(Arc::new(db))
}

/// In-memory database for unit tests
#[cfg(test)]
pub async fn open_in_memory() -> Result<Arc<Database>, GatewayError> {
    let db = Builder::new_local(":memory:")
        .build()
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to open database: {e}")))?;
    create_schema(&db).await?;
    Ok(Arc::new(db))
}

async fn create_schema(db: &Database) -> Result<(), GatewayError> {
    let conn = db
        .connect()
        .map_err(|e| GatewayError::Database(format!("Failed to connect: {e}")))?;

    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS api_keys (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            key_prefix TEXT NOT NULL,
            key_hash TEXT NOT NULL UNIQUE,
            is_active INTEGER NOT NULL DEFAULT 1,
            rate_limit_per_minute INTEGER,
            created_at INTEGER NOT NULL,
            last_used_at INTEGER
        )
        "#,
        (),
    )
    .await
    .map_err(|e| GatewayError::Database(format!("Failed to create api_keys table: {e}")))?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_api_keys_prefix ON api_keys(key_prefix)",
        (),
    )
    .await
    .map_err(|e| GatewayError::Database(format!("Failed to create api_keys index: {e}")))?;

    // Usage rows reference keys but are never cascaded away: revocation is a
    // soft delete, so history always has a referent.
    conn.execute(
        r#"
        CREATE TABLE IF NOT EXISTS usage_records (
            id INTEGER PRIMARY KEY,
            key_id TEXT NOT NULL REFERENCES api_keys(id),
            operation TEXT NOT NULL,
            prompt_tokens INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            total_tokens INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        )
        "#,
        (),
    )
    .await
    .map_err(|e| GatewayError::Database(format!("Failed to create usage_records table: {e}")))?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_usage_records_key_created ON usage_records(key_id, created_at)",
        (),
    )
    .await
    .map_err(|e| GatewayError::Database(format!("Failed to create usage_records index: {e}")))?;

    Ok(())
}

/// Get a fresh connection from a shared database handle
pub fn connect(db: &Database) -> Result<Connection, GatewayError> {
    db.connect()
        .map_err(|e| GatewayError::Database(format!("Failed to get connection: {e}")))
}

pub fn timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Read a non-null integer column as u64 (0 when null or unreadable)
pub fn get_u64(row: &turso::Row, idx: usize) -> u64 {
    row.get::<i64>(idx).unwrap_or(0) as u64
}

/// Read a nullable integer column
pub fn opt_u64(row: &turso::Row, idx: usize) -> Option<u64> {
    row.get::<Option<i64>>(idx).ok().flatten().map(|v| v as u64)
}
