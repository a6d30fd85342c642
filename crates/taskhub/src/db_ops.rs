use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{ServiceError, ServiceResult};
use taskhub_models::*;

// --- Helpers ---

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn task_from_row(row: &Row) -> rusqlite::Result<Task> {
    let ai_context: Option<String> = row.get("ai_context")?;
    Ok(Task {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status: row.get("status")?,
        priority: row.get("priority")?,
        current_turn: row.get("current_turn")?,
        project_path: row.get("project_path")?,
        ssh_host: row.get("ssh_host")?,
        ssh_user: row.get("ssh_user")?,
        estimated_duration: row.get("estimated_duration")?,
        actual_duration: row.get("actual_duration")?,
        max_retries: row.get("max_retries")?,
        retry_count: row.get("retry_count")?,
        progress: row.get("progress")?,
        ai_context: ai_context.and_then(|s| serde_json::from_str(&s).ok()),
        error_message: row.get("error_message")?,
        is_deleted: row.get::<_, i64>("is_deleted")? != 0,
        created_by: row.get("created_by")?,
        updated_by: row.get("updated_by")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
        messages: vec![],
    })
}

fn message_from_row(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        content: row.get("content")?,
        sender: row.get("sender")?,
        related_file_name: row.get("related_file_name")?,
        created_by: row.get("created_by")?,
        created_at: row.get("created_at")?,
    })
}

// Bounds are in characters, not bytes, so multi-byte text near the limit
// is not over-rejected.
fn validate_title(title: &str) -> ServiceResult<()> {
    if title.is_empty() || title.chars().count() > 255 {
        return Err(ServiceError::Validation(
            "title must be 1-255 characters".to_string(),
        ));
    }
    Ok(())
}

fn validate_description(description: Option<&str>) -> ServiceResult<()> {
    if let Some(d) = description {
        if d.chars().count() > 2000 {
            return Err(ServiceError::Validation(
                "description must be at most 2000 characters".to_string(),
            ));
        }
    }
    Ok(())
}

// ssh_host and ssh_user are both set or both absent.
fn validate_ssh_pair(host: Option<&str>, user: Option<&str>) -> ServiceResult<()> {
    if host.is_some() != user.is_some() {
        return Err(ServiceError::Validation(
            "ssh_host and ssh_user must be provided together".to_string(),
        ));
    }
    Ok(())
}

fn validate_max_retries(max_retries: i64) -> ServiceResult<()> {
    if !(0..=10).contains(&max_retries) {
        return Err(ServiceError::Validation(
            "max_retries must be between 0 and 10".to_string(),
        ));
    }
    Ok(())
}

fn validate_progress(progress: i64) -> ServiceResult<()> {
    if !(0..=100).contains(&progress) {
        return Err(ServiceError::Validation(
            "progress must be between 0 and 100".to_string(),
        ));
    }
    Ok(())
}

// --- Task CRUD ---

pub fn create_task(conn: &Connection, input: &CreateTask, actor: &str) -> ServiceResult<Task> {
    validate_title(&input.title)?;
    validate_description(input.description.as_deref())?;
    validate_ssh_pair(input.ssh_host.as_deref(), input.ssh_user.as_deref())?;

    let priority = match &input.priority {
        Some(p) => Priority::from_str(p)
            .ok_or_else(|| ServiceError::Validation(format!("invalid priority '{}'", p)))?,
        None => Priority::Normal,
    };
    let max_retries = input.max_retries.unwrap_or(3);
    validate_max_retries(max_retries)?;

    // Duplicate (title, creator) among non-deleted tasks
    let existing: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE title = ?1 AND created_by = ?2 AND is_deleted = 0",
        params![input.title, actor],
        |row| row.get(0),
    )?;
    if existing > 0 {
        return Err(ServiceError::Duplicate(format!(
            "task '{}' already exists for this user",
            input.title
        )));
    }

    let id = Uuid::new_v4().to_string();
    let ts = now();
    let ai_context = input
        .ai_context
        .as_ref()
        .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "{}".to_string()));

    conn.execute(
        "INSERT INTO tasks (id, title, description, status, priority, current_turn,
            project_path, ssh_host, ssh_user, estimated_duration, max_retries,
            retry_count, progress, ai_context, created_by, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'pending', ?4, 'user', ?5, ?6, ?7, ?8, ?9, 0, 0, ?10, ?11, ?12, ?12)",
        params![
            id,
            input.title,
            input.description,
            priority.as_str(),
            input.project_path,
            input.ssh_host,
            input.ssh_user,
            input.estimated_duration,
            max_retries,
            ai_context,
            actor,
            ts,
        ],
    )?;

    get_task(conn, &id)?.ok_or_else(|| ServiceError::Internal("task vanished after insert".into()))
}

pub fn get_task(conn: &Connection, id: &str) -> ServiceResult<Option<Task>> {
    let task = conn
        .query_row("SELECT * FROM tasks WHERE id = ?1", params![id], |row| {
            task_from_row(row)
        })
        .optional()?;
    Ok(task)
}

/// Like get_task, but with the most recent messages inlined.
pub fn get_task_full(conn: &Connection, id: &str, limit: i64) -> ServiceResult<Option<Task>> {
    let Some(mut task) = get_task(conn, id)? else {
        return Ok(None);
    };
    let mut stmt = conn.prepare(
        "SELECT * FROM messages WHERE task_id = ?1 ORDER BY created_at DESC LIMIT ?2",
    )?;
    let mut messages: Vec<Message> = stmt
        .query_map(params![id, limit], message_from_row)?
        .collect::<Result<_, _>>()?;
    messages.reverse();
    task.messages = messages;
    Ok(Some(task))
}

pub fn list_tasks(conn: &Connection, query: &TaskQuery) -> ServiceResult<TaskPage> {
    let mut clauses: Vec<String> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();

    if !query.include_deleted.unwrap_or(false) {
        clauses.push("is_deleted = 0".to_string());
    }
    if let Some(ref term) = query.search_term {
        clauses.push(format!(
            "(title LIKE ?{n} OR description LIKE ?{n})",
            n = values.len() + 1
        ));
        values.push(SqlValue::Text(format!("%{}%", term)));
    }
    if let Some(ref status) = query.status {
        TaskStatus::from_str(status)
            .ok_or_else(|| ServiceError::Validation(format!("invalid status '{}'", status)))?;
        clauses.push(format!("status = ?{}", values.len() + 1));
        values.push(SqlValue::Text(status.clone()));
    }
    if let Some(ref priority) = query.priority {
        Priority::from_str(priority)
            .ok_or_else(|| ServiceError::Validation(format!("invalid priority '{}'", priority)))?;
        clauses.push(format!("priority = ?{}", values.len() + 1));
        values.push(SqlValue::Text(priority.clone()));
    }
    if let Some(ref turn) = query.current_turn {
        AgentTurn::from_str(turn)
            .ok_or_else(|| ServiceError::Validation(format!("invalid turn '{}'", turn)))?;
        clauses.push(format!("current_turn = ?{}", values.len() + 1));
        values.push(SqlValue::Text(turn.clone()));
    }
    if let Some(remote) = query.is_remote_ssh {
        clauses.push(if remote {
            "ssh_host IS NOT NULL".to_string()
        } else {
            "ssh_host IS NULL".to_string()
        });
    }
    if let Some(ref creator) = query.created_by {
        clauses.push(format!("created_by = ?{}", values.len() + 1));
        values.push(SqlValue::Text(creator.clone()));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM tasks{}", where_sql),
        params_from_iter(values.iter()),
        |row| row.get(0),
    )?;

    // Priority sorts by rank (urgent first), not alphabetically.
    let sort_by = match query.sort_by.as_deref() {
        Some("title") => "title".to_string(),
        Some("priority") => {
            let ranks: Vec<String> = [
                Priority::Urgent,
                Priority::High,
                Priority::Normal,
                Priority::Low,
            ]
            .iter()
            .map(|p| format!("WHEN '{}' THEN {}", p.as_str(), p.sort_order()))
            .collect();
            format!("CASE priority {} END", ranks.join(" "))
        }
        Some("status") => "status".to_string(),
        Some("updated_at") => "updated_at".to_string(),
        _ => "created_at".to_string(),
    };
    let sort_order = match query.sort_order.as_deref() {
        Some("asc") => "ASC",
        _ => "DESC",
    };

    let skip = query.skip.unwrap_or(0).max(0);
    let limit = query.limit.unwrap_or(50).clamp(1, 100);

    let sql = format!(
        "SELECT * FROM tasks{} ORDER BY {} {} LIMIT ?{} OFFSET ?{}",
        where_sql,
        sort_by,
        sort_order,
        values.len() + 1,
        values.len() + 2
    );
    values.push(SqlValue::Integer(limit));
    values.push(SqlValue::Integer(skip));

    let mut stmt = conn.prepare(&sql)?;
    let tasks: Vec<Task> = stmt
        .query_map(params_from_iter(values.iter()), task_from_row)?
        .collect::<Result<_, _>>()?;

    Ok(TaskPage {
        tasks,
        total,
        skip,
        limit,
    })
}

pub fn update_task(
    conn: &Connection,
    id: &str,
    patch: &UpdateTask,
    actor: &str,
) -> ServiceResult<Task> {
    let current =
        get_task(conn, id)?.ok_or_else(|| ServiceError::NotFound(format!("task {}", id)))?;

    if let Some(ref title) = patch.title {
        validate_title(title)?;
    }
    validate_description(patch.description.as_deref())?;
    if let Some(progress) = patch.progress {
        validate_progress(progress)?;
    }
    if let Some(ref priority) = patch.priority {
        Priority::from_str(priority)
            .ok_or_else(|| ServiceError::Validation(format!("invalid priority '{}'", priority)))?;
    }

    // SSH pair rule applies to the merged result of the patch.
    let merged_host = patch.ssh_host.as_deref().or(current.ssh_host.as_deref());
    let merged_user = patch.ssh_user.as_deref().or(current.ssh_user.as_deref());
    validate_ssh_pair(merged_host, merged_user)?;

    // A status in the patch must be a legal transition.
    let mut new_status: Option<TaskStatus> = None;
    if let Some(ref status_str) = patch.status {
        let target = TaskStatus::from_str(status_str)
            .ok_or_else(|| ServiceError::Validation(format!("invalid status '{}'", status_str)))?;
        let from = current
            .status_enum()
            .ok_or_else(|| ServiceError::Internal("corrupt task status".into()))?;
        if target != from {
            if !from.can_transition_to(&target) {
                return Err(ServiceError::BusinessRule(format!(
                    "invalid status transition: {} -> {}",
                    from.as_str(),
                    target.as_str()
                )));
            }
            new_status = Some(target);
        }
    }

    let ts = now();
    let ai_context = patch
        .ai_context
        .as_ref()
        .map(|v| serde_json::to_string(v).unwrap_or_else(|_| "{}".to_string()));

    conn.execute(
        "UPDATE tasks SET
            title = COALESCE(?2, title),
            description = COALESCE(?3, description),
            status = COALESCE(?4, status),
            priority = COALESCE(?5, priority),
            project_path = COALESCE(?6, project_path),
            ssh_host = COALESCE(?7, ssh_host),
            ssh_user = COALESCE(?8, ssh_user),
            estimated_duration = COALESCE(?9, estimated_duration),
            progress = COALESCE(?10, progress),
            ai_context = COALESCE(?11, ai_context),
            updated_by = ?12,
            updated_at = ?13
         WHERE id = ?1",
        params![
            id,
            patch.title,
            patch.description,
            new_status.map(|s| s.as_str()),
            patch.priority,
            patch.project_path,
            patch.ssh_host,
            patch.ssh_user,
            patch.estimated_duration,
            patch.progress,
            ai_context,
            actor,
            ts,
        ],
    )?;

    // Lifecycle timestamps derived from the transition itself.
    match new_status {
        Some(TaskStatus::ProcessingCursor) => {
            conn.execute(
                "UPDATE tasks SET started_at = COALESCE(started_at, ?2) WHERE id = ?1",
                params![id, ts],
            )?;
        }
        Some(s) if s.is_terminal() || s == TaskStatus::Failed => {
            conn.execute(
                "UPDATE tasks SET completed_at = ?2 WHERE id = ?1",
                params![id, ts],
            )?;
        }
        _ => {}
    }

    get_task(conn, id)?.ok_or_else(|| ServiceError::NotFound(format!("task {}", id)))
}

pub fn delete_task(conn: &Connection, id: &str, actor: &str, soft: bool) -> ServiceResult<()> {
    let task = get_task(conn, id)?.ok_or_else(|| ServiceError::NotFound(format!("task {}", id)))?;

    let status = task
        .status_enum()
        .ok_or_else(|| ServiceError::Internal("corrupt task status".into()))?;
    if status.is_processing() {
        return Err(ServiceError::BusinessRule(format!(
            "cannot delete task while status is '{}'",
            status.as_str()
        )));
    }

    if soft {
        conn.execute(
            "UPDATE tasks SET is_deleted = 1, updated_by = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, actor, now()],
        )?;
    } else {
        conn.execute("DELETE FROM messages WHERE task_id = ?1", params![id])?;
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![id])?;
    }
    Ok(())
}

// --- Lifecycle wrappers ---

fn transition(conn: &Connection, id: &str, target: TaskStatus, actor: &str) -> ServiceResult<Task> {
    let task = get_task(conn, id)?.ok_or_else(|| ServiceError::NotFound(format!("task {}", id)))?;
    let from = task
        .status_enum()
        .ok_or_else(|| ServiceError::Internal("corrupt task status".into()))?;
    if !from.can_transition_to(&target) {
        return Err(ServiceError::BusinessRule(format!(
            "invalid status transition: {} -> {}",
            from.as_str(),
            target.as_str()
        )));
    }
    conn.execute(
        "UPDATE tasks SET status = ?2, updated_by = ?3, updated_at = ?4 WHERE id = ?1",
        params![id, target.as_str(), actor, now()],
    )?;
    get_task(conn, id)?.ok_or_else(|| ServiceError::NotFound(format!("task {}", id)))
}

/// Start requires status=pending; stamps started_at and hands the turn to cursor.
pub fn start_task(conn: &Connection, id: &str, actor: &str) -> ServiceResult<Task> {
    let task = get_task(conn, id)?.ok_or_else(|| ServiceError::NotFound(format!("task {}", id)))?;
    if task.status_enum() != Some(TaskStatus::Pending) {
        return Err(ServiceError::BusinessRule(format!(
            "can only start a pending task (status is '{}')",
            task.status
        )));
    }
    let ts = now();
    conn.execute(
        "UPDATE tasks SET status = 'processing_cursor', current_turn = 'cursor',
            started_at = COALESCE(started_at, ?2), updated_by = ?3, updated_at = ?2
         WHERE id = ?1",
        params![id, ts, actor],
    )?;
    get_task(conn, id)?.ok_or_else(|| ServiceError::NotFound(format!("task {}", id)))
}

/// Completion stamps completed_at and derives actual duration from started_at.
pub fn complete_task(conn: &Connection, id: &str, actor: &str) -> ServiceResult<Task> {
    let task = transition(conn, id, TaskStatus::Completed, actor)?;
    let ts = Utc::now();
    let actual = task
        .started_at
        .as_deref()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|started| (ts - started.with_timezone(&Utc)).num_seconds());
    conn.execute(
        "UPDATE tasks SET completed_at = ?2, actual_duration = ?3, progress = 100 WHERE id = ?1",
        params![id, ts.to_rfc3339(), actual],
    )?;
    get_task(conn, id)?.ok_or_else(|| ServiceError::NotFound(format!("task {}", id)))
}

pub fn fail_task(conn: &Connection, id: &str, reason: &str, actor: &str) -> ServiceResult<Task> {
    transition(conn, id, TaskStatus::Failed, actor)?;
    conn.execute(
        "UPDATE tasks SET error_message = ?2, completed_at = ?3 WHERE id = ?1",
        params![id, reason, now()],
    )?;
    get_task(conn, id)?.ok_or_else(|| ServiceError::NotFound(format!("task {}", id)))
}

pub fn cancel_task(conn: &Connection, id: &str, actor: &str) -> ServiceResult<Task> {
    transition(conn, id, TaskStatus::Cancelled, actor)?;
    conn.execute(
        "UPDATE tasks SET completed_at = ?2 WHERE id = ?1",
        params![id, now()],
    )?;
    get_task(conn, id)?.ok_or_else(|| ServiceError::NotFound(format!("task {}", id)))
}

/// Retry requires status=failed and retry budget left; resets to pending.
pub fn retry_task(conn: &Connection, id: &str, actor: &str) -> ServiceResult<Task> {
    let task = get_task(conn, id)?.ok_or_else(|| ServiceError::NotFound(format!("task {}", id)))?;
    if task.status_enum() != Some(TaskStatus::Failed) {
        return Err(ServiceError::BusinessRule(format!(
            "can only retry a failed task (status is '{}')",
            task.status
        )));
    }
    if task.retry_count >= task.max_retries {
        return Err(ServiceError::BusinessRule(format!(
            "retry limit exceeded ({}/{})",
            task.retry_count, task.max_retries
        )));
    }
    conn.execute(
        "UPDATE tasks SET status = 'pending', current_turn = 'user',
            retry_count = retry_count + 1, error_message = NULL,
            started_at = NULL, completed_at = NULL,
            updated_by = ?2, updated_at = ?3
         WHERE id = ?1",
        params![id, actor, now()],
    )?;
    get_task(conn, id)?.ok_or_else(|| ServiceError::NotFound(format!("task {}", id)))
}

pub fn advance_turn(
    conn: &Connection,
    id: &str,
    next_turn: AgentTurn,
    actor: &str,
) -> ServiceResult<Task> {
    if get_task(conn, id)?.is_none() {
        return Err(ServiceError::NotFound(format!("task {}", id)));
    }
    conn.execute(
        "UPDATE tasks SET current_turn = ?2, updated_by = ?3, updated_at = ?4 WHERE id = ?1",
        params![id, next_turn.as_str(), actor, now()],
    )?;
    get_task(conn, id)?.ok_or_else(|| ServiceError::NotFound(format!("task {}", id)))
}

// --- Messages ---

/// Insert a message and advance the owning task's turn/status as one
/// transaction. A reader never observes one without the other.
pub fn create_message(
    conn: &Connection,
    task_id: &str,
    input: &CreateMessage,
    actor: &str,
) -> ServiceResult<(Message, Task)> {
    if input.content.is_empty() || input.content.chars().count() > 10_000 {
        return Err(ServiceError::Validation(
            "content must be 1-10000 characters".to_string(),
        ));
    }
    let sender = Sender::from_str(&input.sender)
        .ok_or_else(|| ServiceError::Validation(format!("invalid sender '{}'", input.sender)))?;

    let task = get_task(conn, task_id)?
        .ok_or_else(|| ServiceError::NotFound(format!("task {}", task_id)))?;
    let turn = task
        .turn_enum()
        .ok_or_else(|| ServiceError::Internal("corrupt task turn".into()))?;

    if !sender.allowed_for_turn(turn) {
        return Err(ServiceError::BusinessRule(format!(
            "sender '{}' cannot post while current_turn is '{}'",
            sender.as_str(),
            turn.as_str()
        )));
    }

    let id = Uuid::new_v4().to_string();
    let ts = now();

    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO messages (id, task_id, content, sender, related_file_name, created_by, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            id,
            task_id,
            input.content,
            sender.as_str(),
            input.related_file_name,
            actor,
            ts,
        ],
    )?;

    if let Some((next_turn, next_status)) = sender.advancement() {
        tx.execute(
            "UPDATE tasks SET current_turn = ?2, status = ?3,
                started_at = COALESCE(started_at, ?4),
                updated_by = ?5, updated_at = ?4
             WHERE id = ?1",
            params![task_id, next_turn.as_str(), next_status.as_str(), ts, actor],
        )?;
    }
    tx.commit()?;

    let message = conn.query_row(
        "SELECT * FROM messages WHERE id = ?1",
        params![id],
        message_from_row,
    )?;
    let task = get_task(conn, task_id)?
        .ok_or_else(|| ServiceError::NotFound(format!("task {}", task_id)))?;
    Ok((message, task))
}

pub fn get_message(conn: &Connection, id: &str) -> ServiceResult<Option<Message>> {
    let msg = conn
        .query_row(
            "SELECT * FROM messages WHERE id = ?1",
            params![id],
            message_from_row,
        )
        .optional()?;
    Ok(msg)
}

/// Chronological full history, optionally excluding system messages.
pub fn get_conversation_history(
    conn: &Connection,
    task_id: &str,
    include_system: bool,
) -> ServiceResult<Vec<Message>> {
    if get_task(conn, task_id)?.is_none() {
        return Err(ServiceError::NotFound(format!("task {}", task_id)));
    }
    let sql = if include_system {
        "SELECT * FROM messages WHERE task_id = ?1 ORDER BY created_at ASC"
    } else {
        "SELECT * FROM messages WHERE task_id = ?1 AND sender != 'system' ORDER BY created_at ASC"
    };
    let mut stmt = conn.prepare(sql)?;
    let messages = stmt
        .query_map(params![task_id], message_from_row)?
        .collect::<Result<_, _>>()?;
    Ok(messages)
}

pub fn list_messages(
    conn: &Connection,
    task_id: &str,
    query: &MessageQuery,
) -> ServiceResult<Vec<Message>> {
    if get_task(conn, task_id)?.is_none() {
        return Err(ServiceError::NotFound(format!("task {}", task_id)));
    }
    if let Some(ref s) = query.sender {
        Sender::from_str(s)
            .ok_or_else(|| ServiceError::Validation(format!("invalid sender '{}'", s)))?;
    }
    let order = match query.sort_order.as_deref() {
        Some("desc") => "DESC",
        _ => "ASC",
    };
    let skip = query.skip.unwrap_or(0).max(0);
    let limit = query.limit.unwrap_or(50).clamp(1, 100);

    let messages = match &query.sender {
        Some(sender) => {
            let sql = format!(
                "SELECT * FROM messages WHERE task_id = ?1 AND sender = ?2
                 ORDER BY created_at {} LIMIT ?3 OFFSET ?4",
                order
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows: Vec<Message> = stmt
                .query_map(params![task_id, sender, limit, skip], message_from_row)?
                .collect::<Result<_, _>>()?;
            rows
        }
        None => {
            let sql = format!(
                "SELECT * FROM messages WHERE task_id = ?1
                 ORDER BY created_at {} LIMIT ?2 OFFSET ?3",
                order
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows: Vec<Message> = stmt
                .query_map(params![task_id, limit, skip], message_from_row)?
                .collect::<Result<_, _>>()?;
            rows
        }
    };
    Ok(messages)
}

pub fn latest_by_sender(
    conn: &Connection,
    task_id: &str,
    sender: &str,
) -> ServiceResult<Option<Message>> {
    if get_task(conn, task_id)?.is_none() {
        return Err(ServiceError::NotFound(format!("task {}", task_id)));
    }
    Sender::from_str(sender)
        .ok_or_else(|| ServiceError::Validation(format!("invalid sender '{}'", sender)))?;
    let msg = conn
        .query_row(
            "SELECT * FROM messages WHERE task_id = ?1 AND sender = ?2
             ORDER BY created_at DESC LIMIT 1",
            params![task_id, sender],
            message_from_row,
        )
        .optional()?;
    Ok(msg)
}

pub fn create_system_message(
    conn: &Connection,
    task_id: &str,
    content: &str,
    actor: &str,
) -> ServiceResult<Message> {
    let (message, _) = create_message(
        conn,
        task_id,
        &CreateMessage {
            content: content.to_string(),
            sender: "system".to_string(),
            related_file_name: None,
        },
        actor,
    )?;
    Ok(message)
}

/// Wrap content in a system message tagged with the target agent. Contacting
/// the agent itself is the command queue's job.
pub fn relay_to_agent(
    conn: &Connection,
    task_id: &str,
    target: &str,
    content: &str,
    actor: &str,
) -> ServiceResult<Message> {
    match AgentTurn::from_str(target) {
        Some(AgentTurn::Cursor) | Some(AgentTurn::Gemini) => {}
        _ => {
            return Err(ServiceError::Validation(format!(
                "target_agent must be 'cursor' or 'gemini', got '{}'",
                target
            )))
        }
    }
    create_system_message(conn, task_id, &format!("[to:{}] {}", target, content), actor)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
