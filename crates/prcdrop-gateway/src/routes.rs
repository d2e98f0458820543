//! API route handlers for the gateway.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use prcdrop_core::PrcDropError;
use prcdrop_scheduler::{SubscribeOutcome, SubscriptionId};
use serde::Deserialize;
use serde_json::{Value, json};

use super::server::AppState;

type ApiResponse = (StatusCode, Json<Value>);

const MISSING_FIELDS: &str = "URL and email are required";
const INTERNAL_ERROR: &str = "An error occurred while processing your request.";

fn error(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(json!({ "error": message.into() })))
}

/// Liveness probe.
pub async fn home() -> &'static str {
    "Price tracker is running!"
}

#[derive(Debug, Default, Deserialize)]
pub struct TrackRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

/// Start tracking a product page for a subscriber.
pub async fn track(
    State(state): State<Arc<AppState>>,
    body: Result<Json<TrackRequest>, JsonRejection>,
) -> ApiResponse {
    let req = match body {
        Ok(Json(req)) => req,
        Err(e) => {
            tracing::debug!("Rejected /track body: {e}");
            return error(StatusCode::BAD_REQUEST, MISSING_FIELDS);
        }
    };
    let url = req.url.unwrap_or_default();
    let email = req.email.unwrap_or_default();

    match state.scheduler.subscribe(&url, &email).await {
        Ok(SubscribeOutcome::Tracking { id, created }) => (
            StatusCode::OK,
            Json(json!({
                "message": "Tracking started. You will be notified when the price drops.",
                "id": id,
                "new": created,
            })),
        ),
        Ok(SubscribeOutcome::Unsupported { domain }) => (
            StatusCode::OK,
            Json(json!({
                "message": "This website is not supported yet. We will add support for it soon.",
                "supported": false,
                "domain": domain,
            })),
        ),
        Err(PrcDropError::InvalidRequest(msg)) => error(StatusCode::BAD_REQUEST, msg),
        Err(e) => {
            tracing::error!("❌ Error tracking {url}: {e}");
            error(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR)
        }
    }
}

/// Re-read the selector file and swap it in.
pub async fn reload_selectors(State(state): State<Arc<AppState>>) -> ApiResponse {
    match state.scheduler.selectors().reload() {
        Ok(count) => (
            StatusCode::OK,
            Json(json!({
                "message": "Selectors reloaded successfully!",
                "count": count,
            })),
        ),
        Err(e) => {
            tracing::error!("❌ Error reloading selectors: {e}");
            error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to reload selectors")
        }
    }
}

/// Service health and counters.
pub async fn status(State(state): State<Arc<AppState>>) -> ApiResponse {
    match state.scheduler.status().await {
        Ok(s) => (
            StatusCode::OK,
            Json(json!({
                "message": "Service is running",
                "version": env!("CARGO_PKG_VERSION"),
                "active_probes": s.active_probes,
                "queued": s.queued,
                "next_due": s.next_due,
                "selectors_loaded": s.selectors_loaded,
                "email_config_valid": state.config.email.is_valid(),
                "subscriptions": s.subscriptions,
                "uptime_secs": state.start_time.elapsed().as_secs(),
            })),
        ),
        Err(e) => {
            tracing::error!("❌ Status failed: {e}");
            error(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR)
        }
    }
}

/// One subscription by id.
pub async fn get_subscription(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResponse {
    let id = SubscriptionId::new(id);
    match state.scheduler.store().get(&id) {
        Ok(Some(sub)) => (StatusCode::OK, Json(json!(sub))),
        Ok(None) => error(StatusCode::NOT_FOUND, "Subscription not found"),
        Err(e) => {
            tracing::error!("❌ Lookup of subscription {id} failed: {e}");
            error(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR)
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// Recent notification attempts, newest first.
pub async fn notifications(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> Json<Value> {
    let limit = q.limit.unwrap_or(50).min(100);
    let items = state.scheduler.recent_notifications(limit).await;
    Json(json!({ "count": items.len(), "notifications": items }))
}
