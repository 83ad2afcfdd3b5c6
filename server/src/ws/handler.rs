use std::net::SocketAddr;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};

use crate::state::AppState;
use crate::ws::actor;

/// GET /ws
/// WebSocket upgrade endpoint. Each accepted socket gets its own actor.
/// Refused with 503 once the hub has begun shutting down.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    ConnectInfo(remote_address): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if state.hub.is_shutting_down() {
        tracing::debug!(remote = %remote_address, "Refusing WebSocket upgrade during shutdown");
        return (StatusCode::SERVICE_UNAVAILABLE, "Server shutting down").into_response();
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| actor::run_connection(socket, hub, Some(remote_address), user_agent))
}
