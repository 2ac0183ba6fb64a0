use std::env;
use std::path::PathBuf;

use dotenvy::dotenv;

use crate::constants::{DEFAULT_MODEL, DEFAULT_UPSTREAM_BASE_URL};

/// CORS configuration mode
#[derive(Debug, Clone)]
pub enum CorsMode {
    /// Only allow localhost origins (default, for local development)
    LocalhostOnly,
    /// Allow all origins (for public API deployment with API key auth)
    AllowAll,
    /// Allow specific origins (comma-separated list)
    AllowList(Vec<String>),
}

pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub upstream_api_key: String,
    pub upstream_base_url: String,
    pub default_model: String,
    pub rate_limit_per_minute: u32,
    pub upstream_timeout_secs: u64,
    pub fragment_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub admin_username: String,
    pub admin_password: String,
    pub cors_mode: CorsMode,
    pub disable_auth: bool,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let host = env::var("AI_GATEWAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("AI_GATEWAY_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8001);

        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ai-gateway");

        let upstream_api_key = env::var("AI_GATEWAY_UPSTREAM_API_KEY")
            .expect("AI_GATEWAY_UPSTREAM_API_KEY must be set");
        let upstream_base_url = env::var("AI_GATEWAY_UPSTREAM_BASE_URL")
            .unwrap_or_else(|_| DEFAULT_UPSTREAM_BASE_URL.to_string());
        let default_model =
            env::var("AI_GATEWAY_DEFAULT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

        let rate_limit_per_minute = env::var("AI_GATEWAY_RATE_LIMIT_PER_MINUTE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let upstream_timeout_secs = env::var("AI_GATEWAY_UPSTREAM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(120);
        let fragment_timeout_secs = env::var("AI_GATEWAY_FRAGMENT_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        let cache_ttl_secs = env::var("AI_GATEWAY_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3600);

        let disable_auth = env::var("AI_GATEWAY_DISABLE_AUTH")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let admin_username = if disable_auth {
            env::var("AI_GATEWAY_ADMIN_USERNAME").unwrap_or_default()
        } else {
            env::var("AI_GATEWAY_ADMIN_USERNAME").expect("AI_GATEWAY_ADMIN_USERNAME must be set")
        };
        let admin_password = if disable_auth {
            env::var("AI_GATEWAY_ADMIN_PASSWORD").unwrap_or_default()
        } else {
            env::var("AI_GATEWAY_ADMIN_PASSWORD").expect("AI_GATEWAY_ADMIN_PASSWORD must be set")
        };

        // CORS configuration: "localhost" (default), "*" (allow all), or comma-separated origins
        let cors_mode = match env::var("AI_GATEWAY_CORS_ORIGINS").as_deref() {
            Ok("*") => CorsMode::AllowAll,
            Ok(origins) if !origins.is_empty() => {
                CorsMode::AllowList(origins.split(',').map(|s| s.trim().to_string()).collect())
            }
            _ => CorsMode::LocalhostOnly,
        };

        Self {
            host,
            port,
            data_dir,
            upstream_api_key,
            upstream_base_url,
            default_model,
            rate_limit_per_minute,
            upstream_timeout_secs,
            fragment_timeout_secs,
            cache_ttl_secs,
            admin_username,
            admin_password,
            cors_mode,
            disable_auth,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("gateway.db")
    }
}
