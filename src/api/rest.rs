// =============================================================================
// REST API Endpoints — Axum
// =============================================================================
//
// All endpoints live under `/api/v1/`. The health probe is public; everything
// else requires a valid Bearer token via the `AuthBearer` extractor. CORS is
// configured permissively for development.

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::runtime_config::DisplayConfig;

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/state", get(engine_state))
        .route("/api/v1/displays", get(list_displays))
        .route("/api/v1/displays", post(create_display))
        .route("/api/v1/displays/:id", delete(destroy_display))
        .route("/api/v1/displays/:id/config", post(update_display_config))
        .route("/api/v1/displays/:id/symbol", post(change_display_symbol))
        .route("/api/v1/feed/reconnect", post(force_reconnect))
        // ── WebSocket snapshot stream ───────────────────────────────
        .route("/api/v1/ws/:id", get(crate::api::ws::ws_handler))
        // ── Middleware & State ──────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health (public)
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    connection_state: String,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        connection_state: state.feed.connection_state().to_string(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

// =============================================================================
// Engine state (authenticated)
// =============================================================================

async fn engine_state(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.build_status())
}

// =============================================================================
// Displays
// =============================================================================

#[derive(Deserialize)]
struct CreateDisplayRequest {
    symbol: String,
    #[serde(default)]
    config: Option<DisplayConfig>,
}

#[derive(Serialize)]
struct CreateDisplayResponse {
    id: Uuid,
    symbol: String,
}

async fn create_display(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateDisplayRequest>,
) -> impl IntoResponse {
    let symbol = req.symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "symbol must not be empty" })),
        )
            .into_response();
    }

    let id = state.displays.create_display(&symbol, req.config);
    info!(display = %id, symbol = %symbol, "display created via API");
    (
        StatusCode::CREATED,
        Json(CreateDisplayResponse { id, symbol }),
    )
        .into_response()
}

async fn list_displays(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    Json(state.displays.list())
}

async fn destroy_display(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    if state.displays.destroy_display(id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found(id)
    }
}

async fn update_display_config(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(config): Json<DisplayConfig>,
) -> impl IntoResponse {
    if state.displays.update_config(id, config) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found(id)
    }
}

#[derive(Deserialize)]
struct ChangeSymbolRequest {
    symbol: String,
}

async fn change_display_symbol(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(req): Json<ChangeSymbolRequest>,
) -> impl IntoResponse {
    let symbol = req.symbol.trim().to_uppercase();
    if symbol.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "symbol must not be empty" })),
        )
            .into_response();
    }
    if state.displays.change_symbol(id, &symbol).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found(id)
    }
}

fn not_found(id: Uuid) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("no display {id}") })),
    )
        .into_response()
}

// =============================================================================
// Feed control
// =============================================================================

async fn force_reconnect(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    info!("operator-forced feed reconnect");
    state.feed.force_reconnect();
    StatusCode::ACCEPTED
}
