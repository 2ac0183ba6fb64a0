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
use crate::constants::{TRANSLATE_MAX_TOKENS, TRANSLATE_TEMPERATURE};
use crate::error::GatewayError;
use crate::provider::{ChatMessage, CompletionRequest};
use crate::proxy;
use crate::usage::OperationKind;

const MAX_TEXT_CHARS: usize = 10_000;
const MAX_LANGUAGE_CHARS: usize = 50;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TranslateRequestBody {
    pub text: String,
    /// Source language, or "auto" for detection
    pub source_language: Option<String>,
    pub target_language: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TranslateResponseBody {
    pub translated_text: String,
    pub source_language: String,
    pub target_language: String,
    pub model: String,
    pub usage: UsageInfo,
}

fn validate_translate(body: &TranslateRequestBody) -> Result<(), GatewayError> {
    let chars = body.text.chars().count();
    if chars == 0 || chars > MAX_TEXT_CHARS {
        return Err(GatewayError::Validation(format!(
            "text must be 1..={MAX_TEXT_CHARS} characters"
        )));
    }
    if let Some(source) = &body.source_language
        && source.chars().count() > MAX_LANGUAGE_CHARS
    {
        return Err(GatewayError::Validation(format!(
            "sourceLanguage must be at most {MAX_LANGUAGE_CHARS} characters"
        )));
    }
    let target_chars = body.target_language.chars().count();
    if !(2..=MAX_LANGUAGE_CHARS).contains(&target_chars) {
        return Err(GatewayError::Validation(format!(
            "targetLanguage must be 2..={MAX_LANGUAGE_CHARS} characters"
        )));
    }
    Ok(())
}

fn to_completion_request(body: &TranslateRequestBody, default_model: &str) -> CompletionRequest {
    let source = body.source_language.as_deref().unwrap_or("auto");

    let system_prompt = if source == "auto" {
        format!(
            "You are a professional translator.\nDetect the source language and translate \
             the text to {}.\nOnly output the translation, nothing else.",
            body.target_language
        )
    } else {
        format!(
            "You are a professional translator.\nTranslate the text from {} to {}.\n\
             Only output the translation, nothing else.",
            source, body.target_language
        )
    };

    CompletionRequest {
        messages: vec![
            ChatMessage {
                role: "system".into(),
                content: system_prompt,
            },
            ChatMessage {
                role: "user".into(),
                content: body.text.clone(),
            },
        ],
        model: default_model.to_string(),
        max_tokens: TRANSLATE_MAX_TOKENS,
        temperature: TRANSLATE_TEMPERATURE,
    }
}

pub async fn translate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TranslateRequestBody>,
) -> Response {
    if let Err(err) = validate_translate(&body) {
        return err.into_response();
    }

    let key = match authorize(&headers, &state).await {
        Ok(k) => k,
        Err(err) => return err.into_response(),
    };

    tracing::info!(
        text_length = body.text.chars().count(),
        source = body.source_language.as_deref().unwrap_or("auto"),
        target = %body.target_language,
        api_key = %key.key_prefix,
        "Translate request received"
    );

    let probe = json!({
        "text": body.text,
        "sourceLanguage": body.source_language.as_deref().unwrap_or("auto"),
        "targetLanguage": body.target_language,
    });

    if let Some(cached) = state.cache.get("translate", &probe).await
        && let Ok(value) = serde_json::from_str::<Value>(&cached)
    {
        tracing::info!("Returning cached translate response");
        return Json(value).into_response();
    }

    let request = to_completion_request(&body, &state.default_model);

    match proxy::run_buffered(
        state.provider.as_ref(),
        &state.ledger,
        &key.id,
        OperationKind::Translate,
        request,
    )
    .await
    {
        Ok(completion) => {
            let response = TranslateResponseBody {
                translated_text: completion.text,
                source_language: body.source_language.unwrap_or_else(|| "auto".into()),
                target_language: body.target_language,
                model: completion.model,
                usage: completion.usage.into(),
            };
            if let Ok(serialized) = serde_json::to_string(&response) {
                state.cache.put("translate", &probe, serialized).await;
            }
            Json(response).into_response()
        }
        Err(err) => err.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_body() -> TranslateRequestBody {
        TranslateRequestBody {
            text: "Hello, how are you?".into(),
            source_language: None,
            target_language: "Spanish".into(),
        }
    }

    #[test]
    fn test_valid_request_passes() {
        assert!(validate_translate(&base_body()).is_ok());
    }

    #[test]
    fn test_empty_text_rejected() {
        let mut body = base_body();
        body.text = String::new();
        assert!(validate_translate(&body).is_err());
    }

    #[test]
    fn test_short_target_language_rejected() {
        let mut body = base_body();
        body.target_language = "x".into();
        assert!(validate_translate(&body).is_err());
    }

    #[test]
    fn test_auto_source_switches_to_detection_prompt() {
        let request = to_completion_request(&base_body(), "gpt-3.5-turbo");
        assert!(request.messages[0].content.contains("Detect the source language"));
        assert!(request.messages[0].content.contains("Spanish"));

        let mut body = base_body();
        body.source_language = Some("English".into());
        let request = to_completion_request(&body, "gpt-3.5-turbo");
        assert!(request.messages[0].content.contains("from English to Spanish"));
    }
}
