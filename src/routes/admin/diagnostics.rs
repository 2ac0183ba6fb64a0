//! Query-plan diagnostics for the hot credential and ledger queries.

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::ErrorResponse;
use crate::AppState;
use crate::db::{self, timestamp_millis};
use crate::error::GatewayError;

// --- Types ---

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsagePlanQuery {
    /// Key ID to plan the query against
    pub key_id: String,
    pub days: Option<u32>,
}

#[derive(Deserialize, ToSchema)]
pub struct KeyLookupPlanQuery {
    /// Key prefix as used by the authentication lookup
    pub prefix: String,
}

#[derive(Serialize, ToSchema)]
pub struct QueryPlanResponse {
    pub query: String,
    pub plan: Vec<String>,
}

/// Collect the detail column of each EXPLAIN QUERY PLAN row
async fn collect_plan(mut rows: turso::Rows) -> Result<Vec<String>, GatewayError> {
    let mut plan = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| GatewayError::Database(format!("Failed to read plan row: {e}")))?
    {
        if let Ok(detail) = row.get::<String>(3) {
            plan.push(detail);
        }
    }
    Ok(plan)
}

fn internal_error(e: GatewayError) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

fn since_millis(days: Option<u32>) -> u64 {
    timestamp_millis().saturating_sub(days.unwrap_or(30) as u64 * 86_400_000)
}

// --- Handlers ---

/// Plan for the usage records listing (filtered by key + date range)
#[utoipa::path(
    get,
    path = "/diagnostics/usage-records",
    tag = "diagnostics",
    params(
        ("keyId" = String, Query, description = "Key ID"),
        ("days" = Option<u32>, Query, description = "Trailing window in days"),
    ),
    responses(
        (status = 200, body = QueryPlanResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn explain_usage_records(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UsagePlanQuery>,
) -> Result<Json<QueryPlanResponse>, (StatusCode, Json<ErrorResponse>)> {
    let conn = db::connect(&state.db).map_err(internal_error)?;
    let rows = conn
        .query(
            "EXPLAIN QUERY PLAN \
             SELECT id, operation, prompt_tokens, completion_tokens, total_tokens, created_at \
             FROM usage_records WHERE key_id = ? AND created_at >= ? \
             ORDER BY created_at DESC LIMIT 100",
            (query.key_id.as_str(), since_millis(query.days) as i64),
        )
        .await
        .map_err(|e| internal_error(GatewayError::Database(format!("Failed to explain query: {e}"))))?;

    let plan = collect_plan(rows).await.map_err(internal_error)?;
    Ok(Json(QueryPlanResponse {
        query: "usage_records".into(),
        plan,
    }))
}

/// Plan for the usage summary aggregation
#[utoipa::path(
    get,
    path = "/diagnostics/usage-summary",
    tag = "diagnostics",
    params(
        ("keyId" = String, Query, description = "Key ID"),
        ("days" = Option<u32>, Query, description = "Trailing window in days"),
    ),
    responses(
        (status = 200, body = QueryPlanResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn explain_usage_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<UsagePlanQuery>,
) -> Result<Json<QueryPlanResponse>, (StatusCode, Json<ErrorResponse>)> {
    let conn = db::connect(&state.db).map_err(internal_error)?;
    let rows = conn
        .query(
            "EXPLAIN QUERY PLAN \
             SELECT COUNT(id), COALESCE(SUM(total_tokens), 0), \
             COALESCE(SUM(prompt_tokens), 0), COALESCE(SUM(completion_tokens), 0) \
             FROM usage_records WHERE key_id = ? AND created_at >= ?",
            (query.key_id.as_str(), since_millis(query.days) as i64),
        )
        .await
        .map_err(|e| internal_error(GatewayError::Database(format!("Failed to explain query: {e}"))))?;

    let plan = collect_plan(rows).await.map_err(internal_error)?;
    Ok(Json(QueryPlanResponse {
        query: "usage_summary".into(),
        plan,
    }))
}

/// Plan for the per-request credential lookup by prefix
#[utoipa::path(
    get,
    path = "/diagnostics/key-lookup",
    tag = "diagnostics",
    params(("prefix" = String, Query, description = "Key prefix")),
    responses(
        (status = 200, body = QueryPlanResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn explain_key_lookup(
    State(state): State<Arc<AppState>>,
    Query(query): Query<KeyLookupPlanQuery>,
) -> Result<Json<QueryPlanResponse>, (StatusCode, Json<ErrorResponse>)> {
    let conn = db::connect(&state.db).map_err(internal_error)?;
    let rows = conn
        .query(
            "EXPLAIN QUERY PLAN SELECT id, key_hash FROM api_keys WHERE key_prefix = ?",
            [query.prefix.as_str()],
        )
        .await
        .map_err(|e| internal_error(GatewayError::Database(format!("Failed to explain query: {e}"))))?;

    let plan = collect_plan(rows).await.map_err(internal_error)?;
    Ok(Json(QueryPlanResponse {
        query: "key_lookup".into(),
        plan,
    }))
}
