//! OpenAI-compatible upstream provider.
//!
//! Speaks the `/chat/completions` wire format, buffered and streaming. The
//! streaming path parses the SSE feed into token fragments and relays them
//! over a bounded channel; the producer stops as soon as the consumer hangs
//! up, which drops the upstream response body and cancels the HTTP request.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::{
    ChatMessage, Completion, CompletionProvider, CompletionRequest, StreamEvent, TokenCounts,
};
use crate::error::GatewayError;

/// Backpressure buffer between the upstream reader and the caller-facing
/// relay. Small on purpose: fragments should flow, not pool.
const FRAGMENT_CHANNEL_CAPACITY: usize = 32;

pub struct OpenAiProvider {
    client: Client,
    base_url: String,
    api_key: String,
    fragment_timeout: Duration,
}

// ============================================================================
// Upstream wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: Option<String>,
    choices: Vec<Choice>,
    usage: Option<UsageBody>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<MessageBody>,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageBody {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

impl UsageBody {
    fn counts(&self) -> TokenCounts {
        TokenCounts {
            prompt_tokens: self.prompt_tokens.unwrap_or(0),
            completion_tokens: self.completion_tokens.unwrap_or(0),
        }
    }
}

/// What one SSE data line contributed
#[derive(Debug, Default, PartialEq, Eq)]
struct StreamChunk {
    token: Option<String>,
    usage: Option<TokenCounts>,
    done: bool,
}

/// Parse one SSE line from the upstream stream. Non-data lines (comments,
/// event names, blanks) and unparseable payloads yield None.
fn parse_stream_line(line: &str) -> Option<StreamChunk> {
    let data = line.strip_prefix("data: ")?.trim();

    if data == "[DONE]" {
        return Some(StreamChunk {
            done: true,
            ..Default::default()
        });
    }

    let event: Value = serde_json::from_str(data).ok()?;
    let mut chunk = StreamChunk::default();

    if let Some(content) = event
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
    {
        chunk.token = Some(content.to_string());
    }

    if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
        chunk.usage = Some(TokenCounts {
            prompt_tokens: usage
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            completion_tokens: usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        });
    }

    Some(chunk)
}

fn request_body(request: &CompletionRequest, stream: bool) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|ChatMessage { role, content }| json!({ "role": role, "content": content }))
        .collect();

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    });

    if stream
        && let Some(obj) = body.as_object_mut()
    {
        obj.insert("stream".into(), json!(true));
        // Ask for a final usage chunk so streamed requests get exact counts
        obj.insert("stream_options".into(), json!({ "include_usage": true }));
    }

    body
}

impl OpenAiProvider {
    pub fn new(
        client: Client,
        base_url: String,
        api_key: String,
        fragment_timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url,
            api_key,
            fragment_timeout,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    async fn dispatch(&self, body: &Value) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream(format!(
                "upstream returned {status}: {text}"
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, GatewayError> {
        let body = request_body(&request, false);
        let response = self.dispatch(&body).await?;

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("failed to parse response: {e}")))?;

        let text = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .and_then(|m| m.content.clone())
            .ok_or_else(|| GatewayError::Upstream("response carried no content".into()))?;

        Ok(Completion {
            text,
            model: parsed.model.unwrap_or(request.model),
            usage: parsed.usage.map(|u| u.counts()).unwrap_or_default(),
        })
    }

    async fn stream_complete(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, GatewayError> {
        let body = request_body(&request, true);
        let response = self.dispatch(&body).await?;

        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        let fragment_timeout = self.fragment_timeout;

        tokio::spawn(async move {
            let mut stream = std::pin::pin!(response.bytes_stream());
            let mut buffer = String::new();
            let mut usage: Option<TokenCounts> = None;

            loop {
                let chunk = match tokio::time::timeout(fragment_timeout, stream.next()).await {
                    Err(_) => {
                        let _ = tx.send(StreamEvent::Error(GatewayError::UpstreamTimeout)).await;
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        let _ = tx.send(StreamEvent::Error(e.into())).await;
                        return;
                    }
                    Ok(Some(Ok(chunk))) => chunk,
                };

                let Ok(text) = std::str::from_utf8(&chunk) else {
                    continue;
                };
                buffer.push_str(text);

                while let Some(newline_pos) = buffer.find('\n') {
                    let line = buffer[..newline_pos].trim().to_string();
                    buffer.drain(..=newline_pos);

                    let Some(parsed) = parse_stream_line(&line) else {
                        continue;
                    };
                    if let Some(counts) = parsed.usage {
                        usage = Some(counts);
                    }
                    if let Some(token) = parsed.token
                        && tx.send(StreamEvent::Fragment(token)).await.is_err()
                    {
                        // Receiver dropped: the caller disconnected. Returning
                        // drops the response body and cancels the upstream call.
                        return;
                    }
                }
            }

            let _ = tx.send(StreamEvent::Done(usage)).await;
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        let chunk = parse_stream_line(line).unwrap();
        assert_eq!(chunk.token.as_deref(), Some("Hello"));
        assert!(chunk.usage.is_none());
        assert!(!chunk.done);
    }

    #[test]
    fn test_parse_done_marker() {
        let chunk = parse_stream_line("data: [DONE]").unwrap();
        assert!(chunk.done);
        assert!(chunk.token.is_none());
    }

    #[test]
    fn test_parse_usage_chunk() {
        let line = r#"data: {"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":34}}"#;
        let chunk = parse_stream_line(line).unwrap();
        assert_eq!(
            chunk.usage,
            Some(TokenCounts {
                prompt_tokens: 12,
                completion_tokens: 34
            })
        );
    }

    #[test]
    fn test_parse_ignores_non_data_lines() {
        assert_eq!(parse_stream_line(""), None);
        assert_eq!(parse_stream_line(": keep-alive"), None);
        assert_eq!(parse_stream_line("event: ping"), None);
        assert_eq!(parse_stream_line("data: not-json"), None);
    }

    #[test]
    fn test_parse_empty_delta_has_no_token() {
        let line = r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        let chunk = parse_stream_line(line).unwrap();
        assert!(chunk.token.is_none());
    }

    #[test]
    fn test_request_body_stream_options() {
        let request = CompletionRequest {
            messages: vec![ChatMessage {
                role: "user".into(),
                content: "hi".into(),
            }],
            model: "gpt-3.5-turbo".into(),
            max_tokens: 100,
            temperature: 0.7,
        };

        let buffered = request_body(&request, false);
        assert!(buffered.get("stream").is_none());

        let streamed = request_body(&request, true);
        assert_eq!(streamed["stream"], json!(true));
        assert_eq!(streamed["stream_options"]["include_usage"], json!(true));
    }
}
