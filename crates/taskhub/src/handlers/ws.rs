use axum::{
    extract::{
        ws::{Message as WsFrame, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::app::AppState;
use taskhub_models::Identity;

pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    identity: Identity,
) -> impl IntoResponse {
    // A bearer identity on the upgrade request pre-authenticates the
    // connection; anonymous clients can authenticate in-band later.
    let user_id = match identity {
        Identity::User { id } => Some(id),
        Identity::Anonymous => None,
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: Option<String>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let connection_id = state.ws.connect(tx, user_id);
    tracing::debug!(connection_id = %connection_id, "websocket connected");

    // Outbound pump: manager events to the socket. Exits when the manager
    // drops the sender (disconnect) or the socket is closed.
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let json = match serde_json::to_string(&event) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize server event");
                    continue;
                }
            };
            if sink.send(WsFrame::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Inbound pump: client frames into the manager.
    let manager = state.ws.clone();
    let conn_id = connection_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsFrame::Text(text)) => manager.handle_message(&conn_id, &text),
                Ok(WsFrame::Ping(_)) | Ok(WsFrame::Pong(_)) => manager.touch(&conn_id),
                Ok(WsFrame::Close(_)) | Err(_) => break,
                Ok(_) => {} // ignore binary frames
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.ws.disconnect(&connection_id);
    tracing::debug!(connection_id = %connection_id, "websocket disconnected");
}
