//! Request lifecycle orchestration for the completion proxy.
//!
//! A request that reaches dispatch owns a [`UsageFlush`] guard. The guard
//! writes exactly one ledger entry when it drops: after a clean finish,
//! after an upstream failure, or when the caller disconnects mid-stream and
//! the response generator is torn down. The ledger enqueue is synchronous
//! and non-blocking, so final accounting never sits on the response path.

use std::time::Duration;

use async_stream::stream;
use bytes::Bytes;
use futures_util::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::interval;

use crate::db::timestamp_millis;
use crate::error::GatewayError;
use crate::provider::{
    Completion, CompletionProvider, CompletionRequest, StreamEvent, TokenCounts, estimate_tokens,
    prompt_chars,
};
use crate::usage::{LedgerEntry, OperationKind, UsageLedger};

/// Keep-alive interval for SSE streams (prevents proxy/load balancer timeouts).
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// SSE keep-alive comment (ignored by clients but keeps connection alive).
const KEEP_ALIVE_COMMENT: &str = ": keep-alive\n\n";

/// Drop guard that settles a request's usage accounting.
///
/// Counts prefer the upstream's own report; when a stream is cut short
/// before one arrives, they fall back to a character-based estimate of what
/// was actually emitted. A request that produced nothing records zeros.
pub struct UsageFlush {
    ledger: UsageLedger,
    key_id: String,
    operation: OperationKind,
    prompt_estimate: u64,
    emitted_chars: u64,
    reported: Option<TokenCounts>,
}

impl UsageFlush {
    pub fn new(
        ledger: UsageLedger,
        key_id: String,
        operation: OperationKind,
        request: &CompletionRequest,
    ) -> Self {
        Self {
            ledger,
            key_id,
            operation,
            prompt_estimate: estimate_tokens(prompt_chars(request)),
            emitted_chars: 0,
            reported: None,
        }
    }

    pub fn add_emitted(&mut self, fragment: &str) {
        self.emitted_chars += fragment.chars().count() as u64;
    }

    pub fn set_reported(&mut self, counts: TokenCounts) {
        self.reported = Some(counts);
    }

    fn final_counts(&self) -> TokenCounts {
        match self.reported {
            Some(counts) => counts,
            None if self.emitted_chars > 0 => TokenCounts {
                prompt_tokens: self.prompt_estimate,
                completion_tokens: estimate_tokens(self.emitted_chars),
            },
            None => TokenCounts::default(),
        }
    }
}

impl Drop for UsageFlush {
    fn drop(&mut self) {
        let counts = self.final_counts();
        self.ledger.record(LedgerEntry {
            key_id: std::mem::take(&mut self.key_id),
            operation: self.operation,
            prompt_tokens: counts.prompt_tokens,
            completion_tokens: counts.completion_tokens,
            created_at: timestamp_millis(),
        });
    }
}

/// Dispatch a buffered completion and settle usage for it, success or not
pub async fn run_buffered(
    provider: &dyn CompletionProvider,
    ledger: &UsageLedger,
    key_id: &str,
    operation: OperationKind,
    request: CompletionRequest,
) -> Result<Completion, GatewayError> {
    let mut flush = UsageFlush::new(ledger.clone(), key_id.to_string(), operation, &request);

    let completion = provider.complete(request).await?;
    flush.set_reported(completion.usage);
    Ok(completion)
}

/// Relay a fragment stream to the caller as SSE events.
///
/// Events are `{"token": t}` per fragment in arrival order, closed by
/// `{"done": true, "fullText": s}` where `fullText` is the concatenation of
/// every forwarded fragment, or `{"error": m}` if the upstream fails
/// mid-flight. Dropping the returned stream (caller disconnect) drops `rx`,
/// which the producer observes and stops on; the flush guard still fires.
pub fn relay_stream(
    mut rx: mpsc::Receiver<StreamEvent>,
    mut flush: UsageFlush,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
    stream! {
        let mut full_text = String::new();
        let mut keep_alive = interval(KEEP_ALIVE_INTERVAL);
        keep_alive.reset(); // Don't fire immediately

        loop {
            tokio::select! {
                biased; // Prefer data over keep-alive when both ready

                event = rx.recv() => {
                    match event {
                        Some(StreamEvent::Fragment(token)) => {
                            flush.add_emitted(&token);
                            full_text.push_str(&token);
                            let payload = json!({ "token": token });
                            yield Ok(Bytes::from(format!("data: {payload}\n\n")));
                        }
                        Some(StreamEvent::Done(usage)) => {
                            if let Some(counts) = usage {
                                flush.set_reported(counts);
                            }
                            let payload = json!({ "done": true, "fullText": full_text });
                            yield Ok(Bytes::from(format!("data: {payload}\n\n")));
                            break;
                        }
                        Some(StreamEvent::Error(err)) => {
                            let payload = json!({ "error": err.to_string() });
                            yield Ok(Bytes::from(format!("data: {payload}\n\n")));
                            break;
                        }
                        // Producer gone without a terminal event; settle with
                        // whatever was emitted
                        None => break,
                    }
                }

                _ = keep_alive.tick() => {
                    yield Ok(Bytes::from(KEEP_ALIVE_COMMENT));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;
    use futures_util::StreamExt;

    async fn test_ledger() -> UsageLedger {
        let db = crate::db::open_in_memory().await.unwrap();
        UsageLedger::new(db)
    }

    fn request(content: &str) -> CompletionRequest {
        CompletionRequest {
            messages: vec![ChatMessage {
                role: "user".into(),
                content: content.into(),
            }],
            model: "gpt-3.5-turbo".into(),
            max_tokens: 100,
            temperature: 0.7,
        }
    }

    fn flush_for(ledger: &UsageLedger, req: &CompletionRequest) -> UsageFlush {
        UsageFlush::new(ledger.clone(), "key-1".into(), OperationKind::Chat, req)
    }

    /// Collect SSE data payloads from a relay stream
    async fn collect_events(
        stream: impl Stream<Item = Result<Bytes, std::io::Error>>,
    ) -> Vec<serde_json::Value> {
        let chunks: Vec<_> = stream.collect().await;
        chunks
            .into_iter()
            .map(|c| String::from_utf8(c.unwrap().to_vec()).unwrap())
            .filter(|s| s.starts_with("data: "))
            .map(|s| serde_json::from_str(s.trim_start_matches("data: ").trim()).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_relay_concatenation_matches_full_text() {
        let ledger = test_ledger().await;
        let req = request("hello");
        let (tx, rx) = mpsc::channel(8);

        tokio::spawn(async move {
            for token in ["Hel", "lo ", "wor", "ld"] {
                tx.send(StreamEvent::Fragment(token.into())).await.unwrap();
            }
            tx.send(StreamEvent::Done(Some(TokenCounts {
                prompt_tokens: 5,
                completion_tokens: 4,
            })))
            .await
            .unwrap();
        });

        let events = collect_events(relay_stream(rx, flush_for(&ledger, &req))).await;
        assert_eq!(events.len(), 5);

        let concatenated: String = events[..4]
            .iter()
            .map(|e| e["token"].as_str().unwrap())
            .collect();
        let terminal = &events[4];
        assert_eq!(terminal["done"], json!(true));
        assert_eq!(terminal["fullText"].as_str().unwrap(), concatenated);
        assert_eq!(terminal["fullText"], json!("Hello world"));

        // Exactly one record, with the upstream-reported counts
        ledger.flush().await;
        let summary = ledger.summarize("key-1", 1).await.unwrap();
        assert_eq!(summary.total_requests, 1);
        assert_eq!(summary.total_prompt_tokens, 5);
        assert_eq!(summary.total_completion_tokens, 4);
    }

    #[tokio::test]
    async fn test_mid_stream_error_records_partial_usage() {
        let ledger = test_ledger().await;
        let req = request("a 21-character prompt");
        let (tx, rx) = mpsc::channel(8);

        tokio::spawn(async move {
            // 8 chars of output, then the upstream dies
            tx.send(StreamEvent::Fragment("partial ".into()))
                .await
                .unwrap();
            tx.send(StreamEvent::Error(GatewayError::Upstream("boom".into())))
                .await
                .unwrap();
        });

        let events = collect_events(relay_stream(rx, flush_for(&ledger, &req))).await;
        assert_eq!(events.len(), 2);
        assert!(events[1]["error"].as_str().unwrap().contains("boom"));

        ledger.flush().await;
        let summary = ledger.summarize("key-1", 1).await.unwrap();
        assert_eq!(summary.total_requests, 1);
        // Estimated: ceil(21/4) prompt, ceil(8/4) completion
        assert_eq!(summary.total_prompt_tokens, 6);
        assert_eq!(summary.total_completion_tokens, 2);
    }

    #[tokio::test]
    async fn test_caller_disconnect_still_settles_usage() {
        let ledger = test_ledger().await;
        let req = request("12345678");
        let (tx, rx) = mpsc::channel(8);

        tx.send(StreamEvent::Fragment("some out".into()))
            .await
            .unwrap();

        let mut stream = std::pin::pin!(relay_stream(rx, flush_for(&ledger, &req)));
        let first = stream.next().await.unwrap().unwrap();
        assert!(first.starts_with(b"data: "));

        // Caller walks away: dropping the stream drops the receiver and
        // fires the flush guard
        drop(stream);
        assert!(tx.is_closed());

        ledger.flush().await;
        let summary = ledger.summarize("key-1", 1).await.unwrap();
        assert_eq!(summary.total_requests, 1);
        assert_eq!(summary.total_prompt_tokens, 2);
        assert_eq!(summary.total_completion_tokens, 2);
    }

    #[tokio::test]
    async fn test_buffered_failure_records_zero_tokens() {
        let ledger = test_ledger().await;
        let req = request("hello");

        {
            let _flush = flush_for(&ledger, &req);
            // No fragments, no report: dispatch failed outright
        }

        ledger.flush().await;
        let summary = ledger.summarize("key-1", 1).await.unwrap();
        assert_eq!(summary.total_requests, 1);
        assert_eq!(summary.total_tokens, 0);
    }

    #[tokio::test]
    async fn test_reported_counts_win_over_estimates() {
        let ledger = test_ledger().await;
        let req = request("hello");

        let mut flush = flush_for(&ledger, &req);
        flush.add_emitted("a very long emitted text that would estimate high");
        flush.set_reported(TokenCounts {
            prompt_tokens: 3,
            completion_tokens: 7,
        });
        drop(flush);

        ledger.flush().await;
        let summary = ledger.summarize("key-1", 1).await.unwrap();
        assert_eq!(summary.total_prompt_tokens, 3);
        assert_eq!(summary.total_completion_tokens, 7);
        assert_eq!(summary.total_tokens, 10);
    }
}
