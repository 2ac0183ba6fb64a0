use std::time::Duration;

/// Default upstream base URL (OpenAI-compatible chat completions API)
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.openai.com/v1";

/// Model used when a request doesn't name one
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";

/// Prefix of every generated client secret
pub const SECRET_PREFIX: &str = "ak_";

/// Length of the non-secret display prefix stored alongside the hash
pub const KEY_PREFIX_LEN: usize = 8;

/// Sliding rate-limit window
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Tuning for the summarize operation
pub const SUMMARIZE_MAX_TOKENS: u32 = 1500;
pub const SUMMARIZE_TEMPERATURE: f64 = 0.5;

/// Tuning for the translate operation
pub const TRANSLATE_MAX_TOKENS: u32 = 2000;
pub const TRANSLATE_TEMPERATURE: f64 = 0.3;
