//! Sync endpoint: WebSocket upgrade.

use axum::{
    extract::{ws::WebSocket, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use serde_json::json;

use crate::sync::handle_socket;
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/sync/ws", get(websocket_handler))
}

/// GET /sync/ws - WebSocket endpoint for real-time sync.
///
/// Clients connect with:
/// - `X-Node-Id: <node_id>` header to identify the client session
/// - `Authorization: Bearer <token>` header when the server requires one
///
/// The token (when present) rides into the hook context as a claim; policy
/// is whatever the route hooks decide to make of it.
async fn websocket_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, (StatusCode, &'static str)> {
    let node_id = headers
        .get("x-node-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::to_string);

    // When a secret is configured, connections must present a token.
    if state.config.auth_secret.is_some() && bearer.as_deref().unwrap_or("").is_empty() {
        tracing::warn!(node_id = %node_id, "connection rejected: missing bearer token");
        return Err((StatusCode::UNAUTHORIZED, "Missing bearer token"));
    }

    let claims = match bearer {
        Some(token) => json!({"token": token}),
        None => json!({}),
    };

    let sync = state.sync.clone();
    tracing::info!(node_id = %node_id, "websocket upgrade requested");

    Ok(ws.on_upgrade(move |socket: WebSocket| handle_socket(socket, sync, node_id, claims)))
}
