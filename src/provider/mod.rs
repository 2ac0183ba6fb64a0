pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::GatewayError;

pub use openai::OpenAiProvider;

/// One message of a chat-shaped prompt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// A validated request ready to hand to the upstream provider
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

/// Final token accounting as reported by the upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenCounts {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenCounts {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A fully buffered completion
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub model: String,
    pub usage: TokenCounts,
}

/// One event on a live completion stream. The sequence is a run of
/// `Fragment`s closed by exactly one `Done` (carrying the upstream's final
/// counts when it reports them) or one `Error`.
#[derive(Debug)]
pub enum StreamEvent {
    Fragment(String),
    Done(Option<TokenCounts>),
    Error(GatewayError),
}

/// The upstream model capability. Implementations must stop producing as
/// soon as the receiver side of the stream channel is dropped; that is the
/// cancel signal for a disconnected caller.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, GatewayError>;

    async fn stream_complete(
        &self,
        request: CompletionRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, GatewayError>;
}

/// Rough token estimate for content the upstream never priced (aborted
/// streams, missing usage reports): one token per four characters.
pub fn estimate_tokens(chars: u64) -> u64 {
    chars.div_ceil(4)
}

/// Character count of a request's prompt side, for estimation
pub fn prompt_chars(request: &CompletionRequest) -> u64 {
    request
        .messages
        .iter()
        .map(|m| m.content.chars().count() as u64)
        .sum()
}
