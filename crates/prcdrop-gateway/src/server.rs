//! HTTP server implementation using Axum.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::routing::{get, post};
use prcdrop_core::PrcDropConfig;
use prcdrop_scheduler::Scheduler;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub config: Arc<PrcDropConfig>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>, config: Arc<PrcDropConfig>) -> Self {
        Self {
            scheduler,
            config,
            start_time: Instant::now(),
        }
    }
}

fn cors_layer(origin: &str) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers(Any)
        .max_age(std::time::Duration::from_secs(3600));

    match origin.trim() {
        "" | "*" => cors.allow_origin(Any),
        origin => match origin.parse::<axum::http::HeaderValue>() {
            Ok(value) => cors.allow_origin(value),
            Err(_) => {
                tracing::warn!("⚠️ Invalid CORS origin {origin:?}; allowing any origin");
                cors.allow_origin(Any)
            }
        },
    }
}

/// Build the router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.gateway.cors_origin);
    Router::new()
        .route("/", get(super::routes::home))
        .route("/track", post(super::routes::track))
        .route("/reload-selectors", post(super::routes::reload_selectors))
        .route("/status", get(super::routes::status))
        .route("/subscriptions/{id}", get(super::routes::get_subscription))
        .route("/notifications", get(super::routes::notifications))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn serve<F>(state: Arc<AppState>, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", state.config.gateway.host, state.config.gateway.port);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway server listening on http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
