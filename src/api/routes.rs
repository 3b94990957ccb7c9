//! HTTP server wiring: shared state, router, graceful shutdown.

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::cleanup::CleanupScheduler;
use crate::config::Config;
use crate::session::SessionRegistry;
use crate::ssrf;

use super::proxy;
use super::stage;
use super::types::HealthResponse;

/// Batch bodies carry many base64 payloads; allow well past the default 2MB.
const MAX_BATCH_BODY_BYTES: usize = 1024 * 1024 * 1024;

/// Redirect hops the outbound client will follow.
const MAX_FETCH_REDIRECTS: usize = 5;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// Session identifier issuance and sandbox mapping
    pub sessions: SessionRegistry,
    /// Deferred sandbox deletion timers
    pub cleanup: CleanupScheduler,
    /// Outbound client for the image proxy
    pub http_client: reqwest::Client,
}

impl AppState {
    pub fn from_config(config: Config) -> anyhow::Result<Arc<Self>> {
        // Each redirect hop is vetted against the address policy before it
        // is followed, so the client never issues a request to a private or
        // non-https target even mid-chain.
        let redirect_policy = reqwest::redirect::Policy::custom(|attempt| {
            if attempt.previous().len() > MAX_FETCH_REDIRECTS {
                return attempt.error("too many redirects");
            }
            match ssrf::ensure_public_target(attempt.url()) {
                Ok(_) => attempt.follow(),
                Err(e) => attempt.error(e),
            }
        });

        let http_client = reqwest::Client::builder()
            .timeout(config.proxy.fetch_timeout)
            .redirect(redirect_policy)
            .user_agent(concat!("dropstage/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let sessions = SessionRegistry::new(config.staging_root.clone());
        let cleanup = CleanupScheduler::new(config.cleanup_delay);

        Ok(Arc::new(AppState {
            config,
            sessions,
            cleanup,
            http_client,
        }))
    }
}

/// Start the HTTP server.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config)?;

    // The staging root must exist before the first session lands in it.
    tokio::fs::create_dir_all(&state.config.staging_root).await?;

    // Archive uploads carry whole batches in one JSON body.
    let archive_route = Router::new()
        .route("/api/create-archive", post(stage::create_archive))
        .layer(DefaultBodyLimit::max(MAX_BATCH_BODY_BYTES));

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/api/session", post(stage::create_session))
        .route(
            "/api/download/:session_id/:filename",
            get(stage::download_archive),
        )
        .route("/api/fetch-image", get(proxy::fetch_image))
        .merge(archive_route)
        .fallback(not_found)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::clone(&state));

    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Wait for a shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}

/// Health check endpoint.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"success": false, "error": "not found"})),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn health_reports_package_version() {
        let Json(resp) = health().await;
        assert_eq!(resp.status, "ok");
        assert_eq!(resp.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn state_builds_from_config() {
        let state = AppState::from_config(Config::new(PathBuf::from("/tmp/dropstage-test")))
            .expect("state must build");
        assert_eq!(state.cleanup.pending_count(), 0);
        assert_eq!(state.config.port, 8402);
    }
}
