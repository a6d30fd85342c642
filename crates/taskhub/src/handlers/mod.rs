pub mod cursor;
pub mod messages;
pub mod tasks;
pub mod ws;

use axum::{extract::State, Json};

use crate::app::AppState;

pub async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let queue = state.cursor.health();
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.ws.connection_count(),
        "connector": queue.connector_status.as_str(),
    }))
}
