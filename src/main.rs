mod cache;
mod config;
mod constants;
mod db;
mod error;
mod keys;
mod provider;
mod proxy;
mod routes;
mod usage;

use axum::ServiceExt;
use axum::{
    Router,
    extract::State,
    http::{HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use cache::ResponseCache;
use clap::Parser;
use config::{Config, CorsMode};
use constants::RATE_WINDOW;
use keys::{ApiKeyStore, RateLimiter};
use provider::{CompletionProvider, OpenAiProvider};
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::normalize_path::NormalizePath;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turso::Database;
use usage::UsageLedger;
use utoipa_axum::{router::OpenApiRouter, routes};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

/// How often idle rate-limit windows are reclaimed
const LIMITER_PURGE_INTERVAL: Duration = Duration::from_secs(60);

pub struct AppState {
    pub db: Arc<Database>,
    pub api_keys: Arc<ApiKeyStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub ledger: UsageLedger,
    pub provider: Arc<dyn CompletionProvider>,
    pub cache: Arc<ResponseCache>,
    /// Per-minute budget for keys without one of their own
    pub default_rate_limit: u32,
    pub default_model: String,
    pub admin_credentials: (String, String),
    /// When true, admin auth middleware is bypassed (for local development)
    pub disable_auth: bool,
}

#[derive(Parser)]
#[command(name = "ai-gateway")]
#[command(about = "Metered API gateway for an upstream LLM provider")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "AI_GATEWAY_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "AI_GATEWAY_PORT")]
    port: Option<u16>,
}

/// Middleware for admin routes authentication (Basic Auth)
async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    if state.disable_auth {
        return next.run(request).await;
    }

    let (username, password) = &state.admin_credentials;

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(auth_value) = auth_header else {
        return unauthorized_response();
    };

    let Some(encoded) = auth_value.strip_prefix("Basic ") else {
        return unauthorized_response();
    };

    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return unauthorized_response();
    };

    let Ok(credentials) = String::from_utf8(decoded) else {
        return unauthorized_response();
    };

    let Some((provided_user, provided_pass)) = credentials.split_once(':') else {
        return unauthorized_response();
    };

    // Constant-time comparison to prevent timing attacks
    let user_match = provided_user.as_bytes().ct_eq(username.as_bytes());
    let pass_match = provided_pass.as_bytes().ct_eq(password.as_bytes());

    if user_match.into() && pass_match.into() {
        next.run(request).await
    } else {
        unauthorized_response()
    }
}

fn unauthorized_response() -> Response {
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    let db = db::open(&config.db_path())
        .await
        .expect("Failed to initialize database");

    let host = args.host.unwrap_or(config.host);
    let port = args.port.unwrap_or(config.port);

    let api_keys = Arc::new(ApiKeyStore::new(db.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(RATE_WINDOW));
    let ledger = UsageLedger::new(db.clone());
    let cache = Arc::new(ResponseCache::new(Duration::from_secs(
        config.cache_ttl_secs,
    )));

    // Shared HTTP client with connection pooling; the timeout bounds every
    // buffered upstream call
    let http_client = Client::builder()
        .timeout(Duration::from_secs(config.upstream_timeout_secs))
        .pool_max_idle_per_host(10)
        .build()
        .expect("Failed to create HTTP client");

    let provider: Arc<dyn CompletionProvider> = Arc::new(OpenAiProvider::new(
        http_client,
        config.upstream_base_url,
        config.upstream_api_key,
        Duration::from_secs(config.fragment_timeout_secs),
    ));

    // Reclaim idle rate-limit windows so dormant keys don't leak memory
    {
        let rate_limiter = rate_limiter.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(LIMITER_PURGE_INTERVAL);
            loop {
                tick.tick().await;
                rate_limiter.purge_idle();
            }
        });
    }

    let disable_auth = config.disable_auth;
    if disable_auth {
        tracing::warn!("Admin authentication is DISABLED (AI_GATEWAY_DISABLE_AUTH=1)");
    }

    let state = Arc::new(AppState {
        db,
        api_keys,
        rate_limiter,
        ledger: ledger.clone(),
        provider,
        cache,
        default_rate_limit: config.rate_limit_per_minute,
        default_model: config.default_model,
        admin_credentials: (config.admin_username, config.admin_password),
        disable_auth,
    });

    // CORS configuration based on environment
    let cors_origins = config.cors_mode.clone();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let Ok(origin_str) = origin.to_str() else {
                return false;
            };

            match &cors_origins {
                CorsMode::AllowAll => true,
                CorsMode::LocalhostOnly => {
                    let Ok(url) = url::Url::parse(origin_str) else {
                        return false;
                    };
                    matches!(
                        url.host_str(),
                        Some("localhost") | Some("127.0.0.1") | Some("::1")
                    )
                }
                CorsMode::AllowList(allowed) => allowed.iter().any(|a| a == origin_str),
            }
        }))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-api-key"),
        ])
        .allow_credentials(true);

    match &config.cors_mode {
        CorsMode::AllowAll => info!("CORS: Allowing all origins"),
        CorsMode::LocalhostOnly => info!("CORS: Localhost only"),
        CorsMode::AllowList(list) => info!("CORS: Allowing origins: {:?}", list),
    }

    // Admin API routes with OpenAPI spec generation
    let (api_router, openapi) = OpenApiRouter::with_openapi(Default::default())
        // Keys
        .routes(routes!(routes::admin::create_key, routes::admin::list_keys))
        .routes(routes!(
            routes::admin::get_key,
            routes::admin::update_key,
            routes::admin::revoke_key
        ))
        // Usage
        .routes(routes!(routes::admin::get_usage_records))
        .routes(routes!(routes::admin::get_usage_summary))
        // Diagnostics
        .routes(routes!(routes::admin::explain_usage_records))
        .routes(routes!(routes::admin::explain_usage_summary))
        .routes(routes!(routes::admin::explain_key_lookup))
        .split_for_parts();

    // Swagger UI + OpenAPI spec (accessible without authentication)
    let swagger_routes = Router::new().merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger").url("/api-docs/openapi.json", openapi),
    );

    // Protected admin routes (Basic Auth)
    let protected_routes = api_router.layer(middleware::from_fn_with_state(
        state.clone(),
        admin_auth_middleware,
    ));

    let admin_routes = Router::new().merge(swagger_routes).merge(protected_routes);

    // API routes
    let api_routes = Router::new()
        .route("/chat", post(routes::chat::chat))
        .route("/chat/stream", post(routes::chat::chat_stream))
        .route("/summarize", post(routes::summarize::summarize))
        .route("/translate", post(routes::translate::translate));

    let app = NormalizePath::trim_trailing_slash(
        Router::new()
            .route("/health", get(routes::health::health))
            .route("/version", get(routes::health::version))
            .nest("/admin", admin_routes)
            .nest("/v1", api_routes)
            .layer(cors)
            .with_state(state),
    );

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .expect("Invalid address");
    info!(
        "Starting ai-gateway v{}-{} (built {})",
        VERSION, GIT_HASH, BUILD_TIME
    );
    info!("Listening on http://{}", addr);
    info!("Admin API docs: http://{}/admin/swagger", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        ServiceExt::<axum::extract::Request>::into_make_service(app),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
    .unwrap();

    // Let queued usage writes land before the process exits
    ledger.flush().await;
}
