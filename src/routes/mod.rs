pub mod admin;
pub mod auth;
pub mod chat;
pub mod health;
pub mod summarize;
pub mod translate;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::provider::TokenCounts;

/// Token accounting attached to every buffered completion response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageInfo {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl From<TokenCounts> for UsageInfo {
    fn from(counts: TokenCounts) -> Self {
        Self {
            prompt_tokens: counts.prompt_tokens,
            completion_tokens: counts.completion_tokens,
            total_tokens: counts.total(),
        }
    }
}
