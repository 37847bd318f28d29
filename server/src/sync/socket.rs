//! WebSocket pump for one connection.
//!
//! Registers the connection, forwards outbound messages from its channel,
//! and processes inbound frames sequentially. Cleans up connection and
//! subscription state on any exit path.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::router::HookContext;

use super::server::SyncServer;

/// Drive an upgraded WebSocket until it closes.
pub async fn handle_socket(socket: WebSocket, server: Arc<SyncServer>, node_id: String, claims: Value) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn_id = server.connect(node_id.clone(), tx);
    let ctx = HookContext {
        connection_id: conn_id.clone(),
        node_id: node_id.clone(),
        claims,
    };

    tracing::info!(conn_id = %conn_id, node_id = %node_id, "client connected");

    // Forward outbound messages (replies and fan-out) onto the socket.
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(text) => {
                    if let Err(error) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!(%error, "failed to send message, closing");
                        break;
                    }
                }
                Err(error) => {
                    tracing::error!(%error, "failed to serialize outbound message");
                }
            }
        }
    });

    // Inbound frames are handled one at a time: a connection's requests are
    // processed in submission order.
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                server.touch(&conn_id);
                if let Some(reply) = server.handle_text(&ctx, &text).await {
                    server.send(&conn_id, reply);
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!(conn_id = %conn_id, "binary frames not supported");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                server.touch(&conn_id);
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "close frame received");
                break;
            }
            Err(error) => {
                tracing::warn!(conn_id = %conn_id, %error, "socket error");
                break;
            }
        }
    }

    server.disconnect(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        node_id = %node_id,
        active_connections = server.connection_count(),
        "client disconnected"
    );
}
