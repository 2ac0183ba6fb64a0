use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};
use turso::Database;
use utoipa::ToSchema;

use crate::db::{self, get_u64, timestamp_millis};
use crate::error::GatewayError;

/// What kind of completion a usage row was billed against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Chat,
    Summarize,
    Translate,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Chat => "chat",
            OperationKind::Summarize => "summarize",
            OperationKind::Translate => "translate",
        }
    }
}

/// One completed (or partially completed) request, ready for insertion
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub key_id: String,
    pub operation: OperationKind,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub created_at: u64,
}

/// A persisted usage row
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: u64,
    pub operation: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub created_at: u64,
}

/// Aggregate over one key and a trailing day window, computed at read time
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub period_start: String,
    pub period_end: String,
}

enum WriterMessage {
    Entry(LedgerEntry),
    Flush(oneshot::Sender<()>),
}

/// Append-only usage store.
///
/// `record` hands the entry to a background writer over an unbounded channel
/// and returns immediately; a storage failure is retried there and can never
/// fail or delay the caller's response. Every call is an independent insert,
/// so concurrent requests never contend on a shared aggregate. Summaries
/// are computed by SQL at read time.
#[derive(Clone)]
pub struct UsageLedger {
    db: Arc<Database>,
    tx: mpsc::UnboundedSender<WriterMessage>,
}

const MAX_WRITE_ATTEMPTS: u32 = 5;
const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(200);

impl UsageLedger {
    pub fn new(db: Arc<Database>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(db.clone(), rx));
        Self { db, tx }
    }

    /// Queue a usage entry. Infallible from the caller's point of view.
    pub fn record(&self, entry: LedgerEntry) {
        if self.tx.send(WriterMessage::Entry(entry)).is_err() {
            error!("Usage writer task is gone, dropping usage record");
        }
    }

    /// Wait until every entry queued so far has been written (or given up
    /// on). Used on shutdown and by tests.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WriterMessage::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Raw usage rows for a key, newest first
    pub async fn records(
        &self,
        key_id: &str,
        since_days: Option<u32>,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<UsageRecord>, GatewayError> {
        let since = since_days
            .map(|days| timestamp_millis().saturating_sub(days as u64 * 86_400_000))
            .unwrap_or(0);

        let conn = db::connect(&self.db)?;
        let mut rows = conn
            .query(
                "SELECT id, operation, prompt_tokens, completion_tokens, total_tokens, created_at \
                 FROM usage_records WHERE key_id = ? AND created_at >= ? \
                 ORDER BY created_at DESC LIMIT ? OFFSET ?",
                (key_id, since as i64, limit as i64, skip as i64),
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to query usage: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to read usage row: {e}")))?
        {
            records.push(UsageRecord {
                id: get_u64(&row, 0),
                operation: row.get::<String>(1).unwrap_or_default(),
                prompt_tokens: get_u64(&row, 2),
                completion_tokens: get_u64(&row, 3),
                total_tokens: get_u64(&row, 4),
                created_at: get_u64(&row, 5),
            });
        }
        Ok(records)
    }

    /// Aggregate usage over the closed interval [now - days, now]. A key
    /// with no matching rows yields all-zero counts.
    pub async fn summarize(&self, key_id: &str, days: u32) -> Result<UsageSummary, GatewayError> {
        let now = timestamp_millis();
        let period_start = now.saturating_sub(days as u64 * 86_400_000);

        let conn = db::connect(&self.db)?;
        let mut rows = conn
            .query(
                "SELECT COUNT(id), COALESCE(SUM(total_tokens), 0), \
                 COALESCE(SUM(prompt_tokens), 0), COALESCE(SUM(completion_tokens), 0) \
                 FROM usage_records WHERE key_id = ? AND created_at >= ?",
                (key_id, period_start as i64),
            )
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to aggregate usage: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| GatewayError::Database(format!("Failed to read aggregate row: {e}")))?;

        let (total_requests, total_tokens, total_prompt_tokens, total_completion_tokens) =
            match &row {
                Some(row) => (
                    get_u64(row, 0),
                    get_u64(row, 1),
                    get_u64(row, 2),
                    get_u64(row, 3),
                ),
                None => (0, 0, 0, 0),
            };

        Ok(UsageSummary {
            total_requests,
            total_tokens,
            total_prompt_tokens,
            total_completion_tokens,
            period_start: rfc3339(period_start),
            period_end: rfc3339(now),
        })
    }
}

fn rfc3339(epoch_ms: u64) -> String {
    DateTime::<Utc>::from_timestamp_millis(epoch_ms as i64)
        .unwrap_or_default()
        .to_rfc3339()
}

async fn writer_task(db: Arc<Database>, mut rx: mpsc::UnboundedReceiver<WriterMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            WriterMessage::Entry(entry) => {
                let mut attempt = 0;
                loop {
                    match insert_entry(&db, &entry).await {
                        Ok(()) => break,
                        Err(e) if attempt + 1 < MAX_WRITE_ATTEMPTS => {
                            attempt += 1;
                            warn!(
                                "Usage write for key {} failed (attempt {attempt}): {e}, retrying",
                                entry.key_id
                            );
                            tokio::time::sleep(WRITE_RETRY_BACKOFF * attempt).await;
                        }
                        Err(e) => {
                            error!(
                                "Giving up on usage write for key {} after {MAX_WRITE_ATTEMPTS} attempts: {e}",
                                entry.key_id
                            );
                            break;
                        }
                    }
                }
            }
            WriterMessage::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

async fn insert_entry(db: &Database, entry: &LedgerEntry) -> Result<(), GatewayError> {
    let conn = db::connect(db)?;
    conn.execute(
        "INSERT INTO usage_records (key_id, operation, prompt_tokens, completion_tokens, total_tokens, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
        (
            entry.key_id.as_str(),
            entry.operation.as_str(),
            entry.prompt_tokens as i64,
            entry.completion_tokens as i64,
            (entry.prompt_tokens + entry.completion_tokens) as i64,
            entry.created_at as i64,
        ),
    )
    .await
    .map_err(|e| GatewayError::Database(format!("Failed to insert usage record: {e}")))?;
    Ok(())
}
