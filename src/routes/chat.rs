use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use utoipa::ToSchema;

use super::UsageInfo;
use super::auth::authorize;
use crate::AppState;
use crate::error::GatewayError;
use crate::provider::{ChatMessage, CompletionRequest};
use crate::proxy::{self, UsageFlush};
use crate::usage::OperationKind;

const MAX_MESSAGES: usize = 50;
const MAX_CONTENT_CHARS: usize = 10_000;
const DEFAULT_MAX_TOKENS: u32 = 1000;
const MAX_MAX_TOKENS: u32 = 4000;
const DEFAULT_TEMPERATURE: f64 = 0.7;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChatMessageBody {
    /// One of system, user, assistant
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequestBody {
    pub messages: Vec<ChatMessageBody>,
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ChatResponseBody {
    pub message: ChatMessageBody,
    pub model: String,
    pub usage: UsageInfo,
}

/// Boundary validation, checked before anything else runs. Failures are a
/// distinct error kind from authentication and admission failures.
fn validate_chat(body: &ChatRequestBody) -> Result<(), GatewayError> {
    if body.messages.is_empty() {
        return Err(GatewayError::Validation("messages must not be empty".into()));
    }
    if body.messages.len() > MAX_MESSAGES {
        return Err(GatewayError::Validation(format!(
            "at most {MAX_MESSAGES} messages are allowed"
        )));
    }
    for message in &body.messages {
        if !matches!(message.role.as_str(), "system" | "user" | "assistant") {
            return Err(GatewayError::Validation(format!(
                "unknown message role: {}",
                message.role
            )));
        }
        let chars = message.content.chars().count();
        if chars == 0 || chars > MAX_CONTENT_CHARS {
            return Err(GatewayError::Validation(format!(
                "message content must be 1..={MAX_CONTENT_CHARS} characters"
            )));
        }
    }
    if let Some(max_tokens) = body.max_tokens
        && !(1..=MAX_MAX_TOKENS).contains(&max_tokens)
    {
        return Err(GatewayError::Validation(format!(
            "maxTokens must be 1..={MAX_MAX_TOKENS}"
        )));
    }
    if let Some(temperature) = body.temperature
        && !(0.0..=2.0).contains(&temperature)
    {
        return Err(GatewayError::Validation(
            "temperature must be 0.0..=2.0".into(),
        ));
    }
    Ok(())
}

fn to_completion_request(body: &ChatRequestBody, default_model: &str) -> CompletionRequest {
    CompletionRequest {
        messages: body
            .messages
            .iter()
            .map(|m| ChatMessage {
                role: m.role.clone(),
                content: m.content.clone(),
            })
            .collect(),
        model: body
            .model
            .clone()
            .unwrap_or_else(|| default_model.to_string()),
        max_tokens: body.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: body.temperature.unwrap_or(DEFAULT_TEMPERATURE),
    }
}

fn cache_probe(request: &CompletionRequest) -> Value {
    json!({
        "messages": request.messages,
        "model": request.model,
        "maxTokens": request.max_tokens,
        "temperature": request.temperature,
    })
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatRequestBody>,
) -> Response {
    if let Err(err) = validate_chat(&body) {
        return err.into_response();
    }

    let key = match authorize(&headers, &state).await {
        Ok(k) => k,
        Err(err) => return err.into_response(),
    };

    tracing::info!(
        model = body.model.as_deref().unwrap_or(&state.default_model),
        message_count = body.messages.len(),
        api_key = %key.key_prefix,
        "Chat request received"
    );

    let request = to_completion_request(&body, &state.default_model);
    let probe = cache_probe(&request);

    if let Some(cached) = state.cache.get("chat", &probe).await
        && let Ok(value) = serde_json::from_str::<Value>(&cached)
    {
        tracing::info!("Returning cached chat response");
        return Json(value).into_response();
    }

    match proxy::run_buffered(
        state.provider.as_ref(),
        &state.ledger,
        &key.id,
        OperationKind::Chat,
        request,
    )
    .await
    {
        Ok(completion) => {
            let response = ChatResponseBody {
                message: ChatMessageBody {
                    role: "assistant".into(),
                    content: completion.text,
                },
                model: completion.model,
                usage: completion.usage.into(),
            };
            if let Ok(serialized) = serde_json::to_string(&response) {
                state.cache.put("chat", &probe, serialized).await;
            }
            Json(response).into_response()
        }
        Err(err) => err.into_response(),
    }
}

pub async fn chat_stream(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatRequestBody>,
) -> Response {
    if let Err(err) = validate_chat(&body) {
        return err.into_response();
    }

    let key = match authorize(&headers, &state).await {
        Ok(k) => k,
        Err(err) => return err.into_response(),
    };

    tracing::info!(
        model = body.model.as_deref().unwrap_or(&state.default_model),
        message_count = body.messages.len(),
        api_key = %key.key_prefix,
        "Streaming chat request received"
    );

    let request = to_completion_request(&body, &state.default_model);

    // Owns the usage write from here on: a dispatch failure, a mid-stream
    // abort, and a caller disconnect all settle exactly one ledger entry
    let flush = UsageFlush::new(
        state.ledger.clone(),
        key.id.clone(),
        OperationKind::Chat,
        &request,
    );

    let rx = match state.provider.stream_complete(request).await {
        Ok(rx) => rx,
        Err(err) => return err.into_response(),
    };

    let sse_stream = proxy::relay_stream(rx, flush);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(sse_stream))
        .unwrap()
}
