use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::ErrorResponse;
use crate::AppState;
use crate::usage::{UsageRecord, UsageSummary};

// --- Types ---

#[derive(Deserialize, ToSchema)]
pub struct UsageRecordsQuery {
    /// Only include records from the trailing N days
    pub days: Option<u32>,
    pub skip: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Deserialize, ToSchema)]
pub struct UsageSummaryQuery {
    /// Trailing window in days (1..=365, default 30)
    pub days: Option<u32>,
}

#[derive(Serialize, ToSchema)]
pub struct UsageRecordsResponse {
    pub records: Vec<UsageRecord>,
}

const DEFAULT_SUMMARY_DAYS: u32 = 30;
const MAX_SUMMARY_DAYS: u32 = 365;
const DEFAULT_RECORDS_LIMIT: u32 = 100;
const MAX_RECORDS_LIMIT: u32 = 1000;

async fn require_key(
    state: &AppState,
    key_id: &str,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    match state.api_keys.get(key_id).await {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Key not found".into(),
            }),
        )),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )),
    }
}

// --- Handlers ---

/// Raw usage records for a key, newest first
#[utoipa::path(
    get,
    path = "/usage/{id}",
    tag = "usage",
    params(
        ("id" = String, Path, description = "Key ID"),
        ("days" = Option<u32>, Query, description = "Only the trailing N days"),
        ("skip" = Option<u32>, Query, description = "Records to skip"),
        ("limit" = Option<u32>, Query, description = "Max records to return (1..=1000)"),
    ),
    responses(
        (status = 200, body = UsageRecordsResponse),
        (status = 404, body = ErrorResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn get_usage_records(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UsageRecordsQuery>,
) -> Result<Json<UsageRecordsResponse>, (StatusCode, Json<ErrorResponse>)> {
    require_key(&state, &id).await?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_RECORDS_LIMIT)
        .clamp(1, MAX_RECORDS_LIMIT);

    let records = state
        .ledger
        .records(&id, query.days, query.skip.unwrap_or(0), limit)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
        })?;

    Ok(Json(UsageRecordsResponse { records }))
}

/// Aggregated usage summary for a key over a trailing day window
#[utoipa::path(
    get,
    path = "/usage/{id}/summary",
    tag = "usage",
    params(
        ("id" = String, Path, description = "Key ID"),
        ("days" = Option<u32>, Query, description = "Trailing window in days (1..=365)"),
    ),
    responses(
        (status = 200, body = UsageSummary),
        (status = 404, body = ErrorResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn get_usage_summary(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UsageSummaryQuery>,
) -> Result<Json<UsageSummary>, (StatusCode, Json<ErrorResponse>)> {
    require_key(&state, &id).await?;

    let days = query
        .days
        .unwrap_or(DEFAULT_SUMMARY_DAYS)
        .clamp(1, MAX_SUMMARY_DAYS);

    let summary = state.ledger.summarize(&id, days).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })?;

    Ok(Json(summary))
}
