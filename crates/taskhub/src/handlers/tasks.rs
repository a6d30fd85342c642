use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};

use crate::app::AppState;
use crate::db_ops;
use crate::error::{ServiceError, ServiceResult};
use crate::ws::{topic_name, ServerEvent};
use taskhub_models::*;

/// Fan a task mutation out to the global feed and the task's own topic.
pub(crate) fn broadcast_task(state: &AppState, task: &Task) {
    let event = ServerEvent::TaskUpdate {
        task_id: task.id.clone(),
        task: serde_json::to_value(task).unwrap_or_default(),
    };
    state.ws.broadcast_to_topic("tasks", event.clone(), None);
    state
        .ws
        .broadcast_to_topic(&topic_name("tasks", Some(&task.id)), event, None);
}

pub async fn list_tasks(
    State(state): State<AppState>,
    _identity: Identity,
    Query(query): Query<TaskQuery>,
) -> ServiceResult<Json<TaskPage>> {
    let conn = state.db.lock().unwrap();
    let page = db_ops::list_tasks(&conn, &query)?;
    Ok(Json(page))
}

pub async fn create_task(
    State(state): State<AppState>,
    identity: Identity,
    Json(input): Json<CreateTask>,
) -> ServiceResult<(StatusCode, Json<Task>)> {
    let task = {
        let conn = state.db.lock().unwrap();
        db_ops::create_task(&conn, &input, identity.user_id())?
    };
    broadcast_task(&state, &task);
    Ok((StatusCode::CREATED, Json(task)))
}

pub async fn get_task(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<String>,
) -> ServiceResult<Json<Task>> {
    let conn = state.db.lock().unwrap();
    db_ops::get_task_full(&conn, &id, 50)?
        .map(Json)
        .ok_or_else(|| ServiceError::NotFound(format!("task {}", id)))
}

pub async fn update_task(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
    Json(patch): Json<UpdateTask>,
) -> ServiceResult<Json<Task>> {
    let task = {
        let conn = state.db.lock().unwrap();
        db_ops::update_task(&conn, &id, &patch, identity.user_id())?
    };
    broadcast_task(&state, &task);
    Ok(Json(task))
}

pub async fn delete_task(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ServiceResult<StatusCode> {
    let soft = query.soft_delete.unwrap_or(true);
    {
        let conn = state.db.lock().unwrap();
        db_ops::delete_task(&conn, &id, identity.user_id(), soft)?;
    }
    if !soft {
        // A hard-deleted task has no use for its pending commands.
        let cancelled = state.cursor.cancel_for_task(&id);
        if cancelled > 0 {
            tracing::info!(task_id = %id, count = cancelled, "cancelled commands of deleted task");
        }
    }
    state.ws.broadcast_to_topic(
        &topic_name("tasks", Some(&id)),
        ServerEvent::Notification {
            title: "task_deleted".to_string(),
            body: serde_json::json!({ "task_id": id }),
        },
        None,
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start_task(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> ServiceResult<Json<Task>> {
    let task = {
        let conn = state.db.lock().unwrap();
        db_ops::start_task(&conn, &id, identity.user_id())?
    };
    broadcast_task(&state, &task);
    Ok(Json(task))
}

pub async fn complete_task(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> ServiceResult<Json<Task>> {
    let task = {
        let conn = state.db.lock().unwrap();
        db_ops::complete_task(&conn, &id, identity.user_id())?
    };
    broadcast_task(&state, &task);
    Ok(Json(task))
}

pub async fn fail_task(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
    Query(query): Query<FailQuery>,
) -> ServiceResult<Json<Task>> {
    let task = {
        let conn = state.db.lock().unwrap();
        db_ops::fail_task(&conn, &id, &query.error_message, identity.user_id())?
    };
    broadcast_task(&state, &task);
    Ok(Json(task))
}

pub async fn retry_task(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> ServiceResult<Json<Task>> {
    let task = {
        let conn = state.db.lock().unwrap();
        db_ops::retry_task(&conn, &id, identity.user_id())?
    };
    broadcast_task(&state, &task);
    Ok(Json(task))
}

pub async fn cancel_task(
    State(state): State<AppState>,
    identity: Identity,
    Path(id): Path<String>,
) -> ServiceResult<Json<Task>> {
    let task = {
        let conn = state.db.lock().unwrap();
        db_ops::cancel_task(&conn, &id, identity.user_id())?
    };
    let cancelled = state.cursor.cancel_for_task(&id);
    if cancelled > 0 {
        tracing::info!(task_id = %id, count = cancelled, "cancelled commands of cancelled task");
    }
    broadcast_task(&state, &task);
    Ok(Json(task))
}
