use axum::{
    Json,
    extract::State,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use utoipa::ToSchema;

use super::UsageInfo;
use super::auth::authorize;
use crate::AppState;
use crate::constants::{SUMMARIZE_MAX_TOKENS, SUMMARIZE_TEMPERATURE};
use crate::error::GatewayError;
use crate::provider::{ChatMessage, CompletionRequest};
use crate::proxy;
use crate::usage::OperationKind;

const MIN_TEXT_CHARS: usize = 10;
const MAX_TEXT_CHARS: usize = 50_000;
const DEFAULT_MAX_LENGTH: u32 = 200;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeRequestBody {
    pub text: String,
    /// Maximum length of the summary in words (50..=1000)
    pub max_length: Option<u32>,
    /// One of concise, detailed, bullet_points
    pub style: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SummarizeResponseBody {
    pub summary: String,
    pub original_length: usize,
    pub summary_length: usize,
    pub model: String,
    pub usage: UsageInfo,
}

fn style_prompt(style: &str) -> Option<&'static str> {
    match style {
        "concise" => Some("Provide a brief, concise summary."),
        "detailed" => Some("Provide a comprehensive, detailed summary."),
        "bullet_points" => Some("Provide a summary in bullet points."),
        _ => None,
    }
}

fn validate_summarize(body: &SummarizeRequestBody) -> Result<(), GatewayError> {
    let chars = body.text.chars().count();
    if !(MIN_TEXT_CHARS..=MAX_TEXT_CHARS).contains(&chars) {
        return Err(GatewayError::Validation(format!(
            "text must be {MIN_TEXT_CHARS}..={MAX_TEXT_CHARS} characters"
        )));
    }
    if let Some(max_length) = body.max_length
        && !(50..=1000).contains(&max_length)
    {
        return Err(GatewayError::Validation("maxLength must be 50..=1000".into()));
    }
    if let Some(style) = &body.style
        && style_prompt(style).is_none()
    {
        return Err(GatewayError::Validation(format!(
            "style must be concise, detailed, or bullet_points, got {style}"
        )));
    }
    Ok(())
}

fn to_completion_request(body: &SummarizeRequestBody, default_model: &str) -> CompletionRequest {
    let style = body.style.as_deref().unwrap_or("concise");
    let max_length = body.max_length.unwrap_or(DEFAULT_MAX_LENGTH);

    let system_prompt = format!(
        "You are a professional summarizer. {}\nKeep the summary under {} words. \
         Focus on key points and main ideas.",
        style_prompt(style).unwrap_or_default(),
        max_length,
    );

    CompletionRequest {
        messages: vec![
            ChatMessage {
                role: "system".into(),
                content: system_prompt,
            },
            ChatMessage {
                role: "user".into(),
                content: format!("Summarize the following text:\n\n{}", body.text),
            },
        ],
        model: default_model.to_string(),
        max_tokens: SUMMARIZE_MAX_TOKENS,
        temperature: SUMMARIZE_TEMPERATURE,
    }
}

pub async fn summarize(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SummarizeRequestBody>,
) -> Response {
    if let Err(err) = validate_summarize(&body) {
        return err.into_response();
    }

    let key = match authorize(&headers, &state).await {
        Ok(k) => k,
        Err(err) => return err.into_response(),
    };

    tracing::info!(
        text_length = body.text.chars().count(),
        style = body.style.as_deref().unwrap_or("concise"),
        api_key = %key.key_prefix,
        "Summarize request received"
    );

    let probe = json!({
        "text": body.text,
        "maxLength": body.max_length.unwrap_or(DEFAULT_MAX_LENGTH),
        "style": body.style.as_deref().unwrap_or("concise"),
    });

    if let Some(cached) = state.cache.get("summarize", &probe).await
        && let Ok(value) = serde_json::from_str::<Value>(&cached)
    {
        tracing::info!("Returning cached summarize response");
        return Json(value).into_response();
    }

    let original_length = body.text.chars().count();
    let request = to_completion_request(&body, &state.default_model);

    match proxy::run_buffered(
        state.provider.as_ref(),
        &state.ledger,
        &key.id,
        OperationKind::Summarize,
        request,
    )
    .await
    {
        Ok(completion) => {
            let response = SummarizeResponseBody {
                summary_length: completion.text.chars().count(),
                summary: completion.text,
                original_length,
                model: completion.model,
                usage: completion.usage.into(),
            };
            if let Ok(serialized) = serde_json::to_string(&response) {
                state.cache.put("summarize", &probe, serialized).await;
            }
            Json(response).into_response()
        }
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_body() -> SummarizeRequestBody {
        SummarizeRequestBody {
            text: "A text long enough to summarize.".into(),
            max_length: None,
            style: None,
        }
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(validate_summarize(&base_body()).is_ok());
    }

    #[test]
    fn test_short_text_rejected() {
        let mut body = base_body();
        body.text = "too short".into();
        assert!(validate_summarize(&body).is_err());
    }

    #[test]
    fn test_unknown_style_rejected() {
        let mut body = base_body();
        body.style = Some("poetic".into());
        assert!(validate_summarize(&body).is_err());
        body.style = Some("bullet_points".into());
        assert!(validate_summarize(&body).is_ok());
    }

    #[test]
    fn test_out_of_range_max_length_rejected() {
        let mut body = base_body();
        body.max_length = Some(49);
        assert!(validate_summarize(&body).is_err());
        body.max_length = Some(1001);
        assert!(validate_summarize(&body).is_err());
        body.max_length = Some(50);
        assert!(validate_summarize(&body).is_ok());
    }
}
