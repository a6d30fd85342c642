use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::app::AppState;
use crate::db_ops;
use crate::error::{ServiceError, ServiceResult};
use crate::handlers::messages;
use crate::handlers::tasks::broadcast_task;
use taskhub_models::*;

pub async fn submit_command(
    State(state): State<AppState>,
    _identity: Identity,
    Json(input): Json<SubmitCommand>,
) -> ServiceResult<(StatusCode, Json<CursorCommand>)> {
    {
        let conn = state.db.lock().unwrap();
        if db_ops::get_task(&conn, &input.task_id)?.is_none() {
            return Err(ServiceError::NotFound(format!("task {}", input.task_id)));
        }
    }
    let cmd = state.cursor.submit(&input)?;
    Ok((StatusCode::ACCEPTED, Json(cmd)))
}

pub async fn get_command(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> ServiceResult<Json<CursorCommand>> {
    state
        .cursor
        .get_command(&id)
        .map(Json)
        .ok_or_else(|| ServiceError::NotFound(format!("command {}", id)))
}

pub async fn cancel_command(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> ServiceResult<Json<serde_json::Value>> {
    let cancelled = state.cursor.cancel(&id);
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}

/// Result report from the connector agent. A successful result closes the
/// conversational loop by appending the Cursor's message to the task.
pub async fn submit_result(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
    Json(result): Json<CommandResult>,
) -> ServiceResult<Json<CursorCommand>> {
    let cmd = state.cursor.submit_result(&id, &result)?;

    if cmd.status == CommandStatus::Completed {
        let content = cmd
            .response
            .clone()
            .unwrap_or_else(|| "(empty response)".to_string());
        let appended = {
            let conn = state.db.lock().unwrap();
            db_ops::create_message(
                &conn,
                &cmd.task_id,
                &CreateMessage {
                    content,
                    sender: "cursor".to_string(),
                    related_file_name: None,
                },
                "cursor",
            )
        };
        match appended {
            Ok((message, task)) => {
                messages::broadcast_message(&state, &cmd.task_id, &message);
                broadcast_task(&state, &task);
            }
            // The turn may have moved while the command was in flight;
            // the command result itself still stands.
            Err(e) => {
                tracing::warn!(
                    command_id = %cmd.id,
                    task_id = %cmd.task_id,
                    error = %e,
                    "could not append cursor response to task"
                );
            }
        }
    } else if cmd.status == CommandStatus::Failed && !cmd.can_retry() {
        let note = format!(
            "Cursor command failed: {}",
            cmd.error_message.as_deref().unwrap_or("unknown error")
        );
        let conn = state.db.lock().unwrap();
        if let Err(e) = db_ops::create_system_message(&conn, &cmd.task_id, &note, "system") {
            tracing::warn!(command_id = %cmd.id, error = %e, "could not record command failure");
        }
    }

    Ok(Json(cmd))
}

pub async fn queue_health(
    State(state): State<AppState>,
    _identity: Identity,
) -> Json<QueueHealth> {
    Json(state.cursor.health())
}

// --- SSH contexts ---

pub async fn register_ssh_context(
    State(state): State<AppState>,
    _identity: Identity,
    Json(input): Json<RegisterSshContext>,
) -> ServiceResult<(StatusCode, Json<serde_json::Value>)> {
    let id = uuid::Uuid::new_v4().to_string();
    let context = state.cursor.ssh.add(&id, &input)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "id": id, "context": context })),
    ))
}

pub async fn list_ssh_contexts(
    State(state): State<AppState>,
    _identity: Identity,
) -> Json<serde_json::Value> {
    let contexts: Vec<serde_json::Value> = state
        .cursor
        .ssh
        .list()
        .into_iter()
        .map(|(id, ctx)| serde_json::json!({ "id": id, "context": ctx }))
        .collect();
    Json(serde_json::json!({ "contexts": contexts }))
}

pub async fn get_ssh_context(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> ServiceResult<Json<SshContext>> {
    state
        .cursor
        .ssh
        .get(&id)
        .map(Json)
        .ok_or_else(|| ServiceError::NotFound(format!("ssh context {}", id)))
}

pub async fn verify_ssh_context(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> ServiceResult<Json<SshContext>> {
    let context = state.cursor.ssh.verify(&id).await?;
    Ok(Json(context))
}

pub async fn remove_ssh_context(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> ServiceResult<StatusCode> {
    if state.cursor.ssh.remove(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ServiceError::NotFound(format!("ssh context {}", id)))
    }
}
