mod canonical;
mod config;
mod credentials;
mod engine;
mod error;
mod files;
mod handlers;
mod invoker;
mod session;
mod settings;

use std::sync::Arc;

use axum::{
    Router,
    http::{HeaderName, HeaderValue, Method, header::CONTENT_DISPOSITION},
    routing::{get, post, put},
};
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use url::Url;

use crate::{
    config::AppConfig,
    engine::{EngineReport, ExtractionEngine, YtDlpEngine},
    error::ApiError,
    files::cleanup_stale_media,
    handlers::AppState,
    session::SESSION_IDLE_TTL,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "social_downloader=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = AppConfig::from_env();

    tokio::fs::create_dir_all(&config.work_dir)
        .await
        .map_err(|error| {
            ApiError::internal(format!(
                "Could not create the working directory {:?}: {error}",
                config.work_dir
            ))
        })?;

    let engine: Arc<dyn ExtractionEngine> = Arc::new(YtDlpEngine::new(&config.engine));
    let report = EngineReport::from_version(
        engine.version().await,
        &config.engine.expected_version_prefixes,
    );
    match (&report.version, &report.warning) {
        (Some(version), None) => info!("Extraction engine {version}"),
        (_, Some(warning)) => warn!("{warning}"),
        (None, None) => {}
    }

    if !config.cleanup_previous_download {
        warn!("CLEANUP_PREVIOUS_DOWNLOAD=false: finished downloads stay on disk until they go stale.");
    }
    cleanup_stale_media(&config.work_dir, SESSION_IDLE_TTL).await;

    let cors = build_cors_layer(&config.allowed_origins)?;
    let addr = config.bind_addr.clone();
    let state = AppState::new(config, engine).await;

    let mut app = Router::new()
        .route("/", get(handlers::index))
        .route("/api/health", get(handlers::health))
        .route("/api/engine", get(handlers::engine_report))
        .route("/api/cookies", get(handlers::cookie_status))
        .route("/api/cookies/{slot}", put(handlers::upload_cookies))
        .route(
            "/api/settings/api-key",
            get(handlers::get_api_key).put(handlers::put_api_key),
        )
        .route("/api/download", post(handlers::start_download))
        .route(
            "/api/download/{session_id}/file",
            get(handlers::download_file),
        )
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if let Some(cors) = cors {
        app = app.layer(cors);
    }

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("Listening on http://{addr}");

    axum::serve(listener, app)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}

/// The page is served by this process, so CORS is only needed when another
/// origin embeds the API.
fn build_cors_layer(configured: &[String]) -> Result<Option<CorsLayer>, ApiError> {
    if configured.is_empty() {
        return Ok(None);
    }

    let origins = configured
        .iter()
        .map(|origin| {
            normalize_origin(origin)
                .and_then(|normalized| HeaderValue::from_str(&normalized).ok())
                .ok_or_else(|| {
                    ApiError::internal(format!(
                        "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                    ))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    info!("CORS allow-list: {:?}", origins);

    Ok(Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::PUT])
            .allow_headers(Any)
            .expose_headers([
                CONTENT_DISPOSITION,
                HeaderName::from_static("x-download-filename"),
            ]),
    ))
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}
