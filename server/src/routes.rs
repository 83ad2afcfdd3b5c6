use axum::{extract::State, routing::get, Json, Router};

use crate::hub::HubStats;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Build the axum Router: WebSocket upgrade, health, and operator stats.
///
/// The upgrade route carries no rate limiting.
pub fn build_router(state: AppState) -> Router {
    // WebSocket endpoint
    let ws_routes = Router::new().route("/ws", get(ws_handler::ws_upgrade));

    // Health check
    let health = Router::new().route("/health", get(health_check));

    let stats_routes = Router::new().route("/api/realtime/stats", get(realtime_stats));

    Router::new()
        .merge(ws_routes)
        .merge(health)
        .merge(stats_routes)
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}

/// GET /api/realtime/stats: live connection and room counts.
async fn realtime_stats(State(state): State<AppState>) -> Json<HubStats> {
    Json(state.hub.stats())
}
