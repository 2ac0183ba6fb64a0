use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use super::{ErrorResponse, SuccessResponse, validate_key_name, validate_rate_limit};
use crate::AppState;
use crate::keys::{ApiKey, KeyUpdate};

// --- Types ---

#[derive(Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateKeyRequest {
    name: String,
    rate_limit_per_minute: Option<u32>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreatedKeyResponse {
    #[serde(flatten)]
    pub api_key: ApiKey,
    /// Full plaintext secret. Returned exactly once; unrecoverable afterwards.
    pub key: String,
}

#[derive(Serialize, ToSchema)]
pub struct ListKeysResponse {
    pub keys: Vec<ApiKey>,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ListKeysQuery {
    pub active_only: Option<bool>,
}

// --- Handlers ---

/// Create a new API key
#[utoipa::path(
    post,
    path = "/keys",
    tag = "keys",
    request_body = CreateKeyRequest,
    responses(
        (status = 201, body = CreatedKeyResponse),
        (status = 400, body = ErrorResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<CreatedKeyResponse>), (StatusCode, Json<ErrorResponse>)> {
    let name = body.name.trim().to_string();

    if let Err(e) = validate_key_name(&name) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        ));
    }
    if let Some(limit) = body.rate_limit_per_minute
        && let Err(e) = validate_rate_limit(limit)
    {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        ));
    }

    match state
        .api_keys
        .create(name, body.rate_limit_per_minute)
        .await
    {
        Ok((api_key, key)) => {
            tracing::info!("API key created: {} ({}...)", api_key.name, api_key.key_prefix);
            Ok((
                StatusCode::CREATED,
                Json(CreatedKeyResponse { api_key, key }),
            ))
        }
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )),
    }
}

/// List all API keys
#[utoipa::path(
    get,
    path = "/keys",
    tag = "keys",
    params(("activeOnly" = Option<bool>, Query, description = "Only include active keys")),
    responses(
        (status = 200, body = ListKeysResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListKeysQuery>,
) -> Result<Json<ListKeysResponse>, (StatusCode, Json<ErrorResponse>)> {
    let keys = state
        .api_keys
        .list(query.active_only.unwrap_or(false))
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
        })?;
    Ok(Json(ListKeysResponse { keys }))
}

/// Get a single API key
#[utoipa::path(
    get,
    path = "/keys/{id}",
    tag = "keys",
    params(("id" = String, Path, description = "Key ID")),
    responses(
        (status = 200, body = ApiKey),
        (status = 404, body = ErrorResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn get_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiKey>, (StatusCode, Json<ErrorResponse>)> {
    match state.api_keys.get(&id).await {
        Ok(Some(key)) => Ok(Json(key)),
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

/// Update an API key's name, limit, or active flag
#[utoipa::path(
    patch,
    path = "/keys/{id}",
    tag = "keys",
    params(("id" = String, Path, description = "Key ID")),
    request_body = KeyUpdate,
    responses(
        (status = 200, body = ApiKey),
        (status = 400, body = ErrorResponse),
        (status = 404, body = ErrorResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn update_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<KeyUpdate>,
) -> Result<Json<ApiKey>, (StatusCode, Json<ErrorResponse>)> {
    if let Some(name) = &body.name
        && let Err(e) = validate_key_name(name)
    {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        ));
    }
    if let Some(limit) = body.rate_limit_per_minute
        && let Err(e) = validate_rate_limit(limit)
    {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        ));
    }

    match state.api_keys.update(&id, body).await {
        Ok(Some(key)) => {
            tracing::info!("API key updated: {} ({}...)", key.name, key.key_prefix);
            Ok(Json(key))
        }
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

/// Revoke an API key (soft delete; usage history is retained)
#[utoipa::path(
    delete,
    path = "/keys/{id}",
    tag = "keys",
    params(("id" = String, Path, description = "Key ID")),
    responses(
        (status = 200, body = SuccessResponse),
        (status = 404, body = ErrorResponse),
        (status = 500, body = ErrorResponse),
    )
)]
pub async fn revoke_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    match state.api_keys.revoke(&id).await {
        Ok(true) => {
            tracing::info!("API key revoked: {id}");
            Ok(Json(SuccessResponse { success: true }))
        }
        Ok(false) => Err((
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
