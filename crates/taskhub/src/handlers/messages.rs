use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::app::AppState;
use crate::db_ops;
use crate::error::{ServiceError, ServiceResult};
use crate::handlers::tasks::broadcast_task;
use crate::ws::{topic_name, ServerEvent};
use taskhub_models::*;

pub(crate) fn broadcast_message(state: &AppState, task_id: &str, message: &Message) {
    let event = ServerEvent::NewMessage {
        task_id: task_id.to_string(),
        message: serde_json::to_value(message).unwrap_or_default(),
    };
    state
        .ws
        .broadcast_to_topic(&topic_name("tasks", Some(task_id)), event.clone(), None);
    state.ws.broadcast_to_topic("messages", event, None);
}

/// Hand the task's prompt to the Cursor agent once the turn reaches it.
/// A full queue never fails the already-committed message; it is logged
/// and surfaced as a notification.
fn enqueue_cursor_prompt(state: &AppState, task: &Task, content: &str) {
    let submit = SubmitCommand {
        task_id: task.id.clone(),
        command_type: "prompt".to_string(),
        content: content.to_string(),
        metadata: None,
        timeout_seconds: None,
        max_retries: None,
        ssh_context_id: None,
    };
    match state.cursor.submit(&submit) {
        Ok(cmd) => {
            tracing::debug!(task_id = %task.id, command_id = %cmd.id, "prompt queued for cursor");
        }
        Err(e) => {
            tracing::warn!(task_id = %task.id, error = %e, "could not queue prompt for cursor");
            state.ws.broadcast_to_topic(
                &topic_name("tasks", Some(&task.id)),
                ServerEvent::Notification {
                    title: "cursor_queue_unavailable".to_string(),
                    body: serde_json::json!({ "task_id": task.id, "error": e.to_string() }),
                },
                None,
            );
        }
    }
}

pub async fn create_message(
    State(state): State<AppState>,
    identity: Identity,
    Path(task_id): Path<String>,
    Json(input): Json<CreateMessage>,
) -> ServiceResult<(StatusCode, Json<Message>)> {
    let (message, task) = {
        let conn = state.db.lock().unwrap();
        db_ops::create_message(&conn, &task_id, &input, identity.user_id())?
    };
    broadcast_message(&state, &task_id, &message);
    broadcast_task(&state, &task);
    if task.turn_enum() == Some(AgentTurn::Cursor) {
        enqueue_cursor_prompt(&state, &task, &message.content);
    }
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn list_messages(
    State(state): State<AppState>,
    _identity: Identity,
    Path(task_id): Path<String>,
    Query(query): Query<MessageQuery>,
) -> ServiceResult<Json<Vec<Message>>> {
    let conn = state.db.lock().unwrap();
    let messages = db_ops::list_messages(&conn, &task_id, &query)?;
    Ok(Json(messages))
}

pub async fn conversation(
    State(state): State<AppState>,
    _identity: Identity,
    Path(task_id): Path<String>,
    Query(query): Query<ConversationQuery>,
) -> ServiceResult<Json<Vec<Message>>> {
    let conn = state.db.lock().unwrap();
    let messages =
        db_ops::get_conversation_history(&conn, &task_id, query.include_system.unwrap_or(true))?;
    Ok(Json(messages))
}

pub async fn get_message(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> ServiceResult<Json<Message>> {
    let conn = state.db.lock().unwrap();
    db_ops::get_message(&conn, &id)?
        .map(Json)
        .ok_or_else(|| ServiceError::NotFound(format!("message {}", id)))
}

pub async fn latest_by_sender(
    State(state): State<AppState>,
    _identity: Identity,
    Path((task_id, sender)): Path<(String, String)>,
) -> ServiceResult<Json<Message>> {
    let conn = state.db.lock().unwrap();
    db_ops::latest_by_sender(&conn, &task_id, &sender)?
        .map(Json)
        .ok_or_else(|| {
            ServiceError::NotFound(format!("message from '{}' on task {}", sender, task_id))
        })
}

pub async fn relay(
    State(state): State<AppState>,
    identity: Identity,
    Path(task_id): Path<String>,
    Query(query): Query<RelayQuery>,
) -> ServiceResult<(StatusCode, Json<Message>)> {
    let message = {
        let conn = state.db.lock().unwrap();
        db_ops::relay_to_agent(
            &conn,
            &task_id,
            &query.target_agent,
            &query.content,
            identity.user_id(),
        )?
    };
    broadcast_message(&state, &task_id, &message);
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn system_message(
    State(state): State<AppState>,
    identity: Identity,
    Path(task_id): Path<String>,
    Query(query): Query<SystemMessageQuery>,
) -> ServiceResult<(StatusCode, Json<Message>)> {
    let message = {
        let conn = state.db.lock().unwrap();
        db_ops::create_system_message(&conn, &task_id, &query.content, identity.user_id())?
    };
    broadcast_message(&state, &task_id, &message);
    Ok((StatusCode::CREATED, Json(message)))
}
