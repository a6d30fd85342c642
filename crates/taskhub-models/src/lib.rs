use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// --- Enums ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    ProcessingCursor,
    AwaitingUserGemini,
    ProcessingGemini,
    AwaitingUserCursor,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::ProcessingCursor => "processing_cursor",
            TaskStatus::AwaitingUserGemini => "awaiting_user_gemini",
            TaskStatus::ProcessingGemini => "processing_gemini",
            TaskStatus::AwaitingUserCursor => "awaiting_user_cursor",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "processing_cursor" => Some(TaskStatus::ProcessingCursor),
            "awaiting_user_gemini" => Some(TaskStatus::AwaitingUserGemini),
            "processing_gemini" => Some(TaskStatus::ProcessingGemini),
            "awaiting_user_cursor" => Some(TaskStatus::AwaitingUserCursor),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "cancelled" => Some(TaskStatus::Cancelled),
            _ => None,
        }
    }

    pub fn valid_transitions(&self) -> Vec<TaskStatus> {
        match self {
            TaskStatus::Pending => vec![TaskStatus::ProcessingCursor, TaskStatus::Cancelled],
            TaskStatus::ProcessingCursor => vec![
                TaskStatus::AwaitingUserGemini,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ],
            TaskStatus::AwaitingUserGemini => {
                vec![TaskStatus::ProcessingGemini, TaskStatus::Cancelled]
            }
            TaskStatus::ProcessingGemini => vec![
                TaskStatus::AwaitingUserCursor,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ],
            TaskStatus::AwaitingUserCursor => {
                vec![TaskStatus::ProcessingCursor, TaskStatus::Cancelled]
            }
            TaskStatus::Completed => vec![],
            TaskStatus::Cancelled => vec![],
            // No generic edge out of failed: the retry operation owns the
            // failed -> pending reset, with its own budget check.
            TaskStatus::Failed => vec![],
        }
    }

    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        self.valid_transitions().contains(target)
    }

    /// Statuses during which an agent is actively working the task.
    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            TaskStatus::ProcessingCursor | TaskStatus::ProcessingGemini
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentTurn {
    User,
    Cursor,
    Gemini,
}

impl AgentTurn {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentTurn::User => "user",
            AgentTurn::Cursor => "cursor",
            AgentTurn::Gemini => "gemini",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(AgentTurn::User),
            "cursor" => Some(AgentTurn::Cursor),
            "gemini" => Some(AgentTurn::Gemini),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Cursor,
    Gemini,
    System,
}

impl Sender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Cursor => "cursor",
            Sender::Gemini => "gemini",
            Sender::System => "system",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Sender::User),
            "cursor" => Some(Sender::Cursor),
            "gemini" => Some(Sender::Gemini),
            "system" => Some(Sender::System),
            _ => None,
        }
    }

    /// Whether this sender may post a message while `turn` holds the floor.
    /// System always may; the user may interrupt any turn; each agent only
    /// speaks on its own turn.
    pub fn allowed_for_turn(&self, turn: AgentTurn) -> bool {
        match self {
            Sender::System => true,
            Sender::User => true,
            Sender::Cursor => turn == AgentTurn::Cursor,
            Sender::Gemini => turn == AgentTurn::Gemini,
        }
    }

    /// Turn/status advancement driven by a successful message, or None if
    /// the message leaves the task untouched (system messages).
    pub fn advancement(&self) -> Option<(AgentTurn, TaskStatus)> {
        match self {
            Sender::User => Some((AgentTurn::Cursor, TaskStatus::ProcessingCursor)),
            Sender::Cursor => Some((AgentTurn::User, TaskStatus::AwaitingUserGemini)),
            Sender::Gemini => Some((AgentTurn::User, TaskStatus::AwaitingUserCursor)),
            Sender::System => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }

    pub fn sort_order(&self) -> i32 {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Prompt,
    FileOperation,
    Search,
    Refactor,
    Debug,
    Terminal,
    SshContext,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Prompt => "prompt",
            CommandType::FileOperation => "file_operation",
            CommandType::Search => "search",
            CommandType::Refactor => "refactor",
            CommandType::Debug => "debug",
            CommandType::Terminal => "terminal",
            CommandType::SshContext => "ssh_context",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "prompt" => Some(CommandType::Prompt),
            "file_operation" => Some(CommandType::FileOperation),
            "search" => Some(CommandType::Search),
            "refactor" => Some(CommandType::Refactor),
            "debug" => Some(CommandType::Debug),
            "terminal" => Some(CommandType::Terminal),
            "ssh_context" => Some(CommandType::SshContext),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Queued => "queued",
            CommandStatus::Processing => "processing",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Timeout => "timeout",
            CommandStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed
                | CommandStatus::Failed
                | CommandStatus::Timeout
                | CommandStatus::Cancelled
        )
    }
}

/// Reachability of the external Cursor connector agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Connected,
    Processing,
    Error,
    Timeout,
}

impl ConnectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorState::Disconnected => "disconnected",
            ConnectorState::Connecting => "connecting",
            ConnectorState::Connected => "connected",
            ConnectorState::Processing => "processing",
            ConnectorState::Error => "error",
            ConnectorState::Timeout => "timeout",
        }
    }

    /// Connected-enough to hand commands to the agent.
    pub fn is_reachable(&self) -> bool {
        matches!(self, ConnectorState::Connected | ConnectorState::Processing)
    }
}

// --- Domain models ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub priority: String,
    pub current_turn: String,
    pub project_path: Option<String>,
    pub ssh_host: Option<String>,
    pub ssh_user: Option<String>,
    /// Estimated duration in seconds.
    pub estimated_duration: Option<i64>,
    /// Derived on completion from started_at.
    pub actual_duration: Option<i64>,
    pub max_retries: i64,
    pub retry_count: i64,
    /// 0-100
    pub progress: i64,
    /// Opaque per-agent context blob (key → value).
    pub ai_context: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub is_deleted: bool,
    pub created_by: String,
    pub updated_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
}

impl Task {
    pub fn status_enum(&self) -> Option<TaskStatus> {
        TaskStatus::from_str(&self.status)
    }

    pub fn turn_enum(&self) -> Option<AgentTurn> {
        AgentTurn::from_str(&self.current_turn)
    }

    pub fn is_remote(&self) -> bool {
        self.ssh_host.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub task_id: String,
    pub content: String,
    pub sender: String,
    pub related_file_name: Option<String>,
    pub created_by: String,
    pub created_at: String,
}

/// Cached remote-development connection descriptor. In-memory only; a
/// command carries its context by value so later removal never affects
/// in-flight dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SshContext {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub key_path: Option<String>,
    pub working_directory: Option<String>,
    #[serde(default)]
    pub environment: std::collections::HashMap<String, String>,
    pub connection_timeout: u64,
    pub last_verified: Option<DateTime<Utc>>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorCommand {
    pub id: String,
    pub task_id: String,
    pub command_type: CommandType,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub status: CommandStatus,
    pub response: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub ssh_context: Option<SshContext>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time the processing loop may dispatch this command.
    /// Set on retry re-enqueue to apply backoff.
    #[serde(skip)]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl CursorCommand {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.started_at) {
            (CommandStatus::Processing, Some(started)) => {
                (now - started).num_seconds() > self.timeout_seconds as i64
            }
            _ => false,
        }
    }

    pub fn can_retry(&self) -> bool {
        matches!(self.status, CommandStatus::Failed | CommandStatus::Timeout)
            && self.retry_count < self.max_retries
    }
}

// --- DTOs ---

#[derive(Debug, Deserialize)]
pub struct CreateTask {
    pub title: String,
    pub description: Option<String>,
    pub priority: Option<String>,
    pub project_path: Option<String>,
    pub ssh_host: Option<String>,
    pub ssh_user: Option<String>,
    pub estimated_duration: Option<i64>,
    pub max_retries: Option<i64>,
    pub ai_context: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateTask {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub project_path: Option<String>,
    pub ssh_host: Option<String>,
    pub ssh_user: Option<String>,
    pub estimated_duration: Option<i64>,
    pub progress: Option<i64>,
    pub ai_context: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TaskQuery {
    pub skip: Option<i64>,
    pub limit: Option<i64>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub search_term: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub current_turn: Option<String>,
    pub is_remote_ssh: Option<bool>,
    pub created_by: Option<String>,
    pub include_deleted: Option<bool>,
}

/// List envelope with total count for pagination.
#[derive(Debug, Serialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub total: i64,
    pub skip: i64,
    pub limit: i64,
}

#[derive(Debug, Deserialize)]
pub struct DeleteQuery {
    pub soft_delete: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct FailQuery {
    pub error_message: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateMessage {
    pub content: String,
    pub sender: String,
    pub related_file_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MessageQuery {
    pub skip: Option<i64>,
    pub limit: Option<i64>,
    pub sender: Option<String>,
    pub sort_order: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConversationQuery {
    pub include_system: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct RelayQuery {
    pub target_agent: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct SystemMessageQuery {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct SubmitCommand {
    pub task_id: String,
    pub command_type: String,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
    /// SSH context id to attach (copied by value at submission time).
    pub ssh_context_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub response: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterSshContext {
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub key_path: Option<String>,
    pub working_directory: Option<String>,
    pub environment: Option<std::collections::HashMap<String, String>>,
    pub connection_timeout: Option<u64>,
}

/// Aggregated queue health (connector reachability + queue pressure).
#[derive(Debug, Serialize)]
pub struct QueueHealth {
    pub connector_status: ConnectorState,
    pub queue_depth: usize,
    pub active_commands: usize,
    pub expired_commands: usize,
    pub ssh_context_count: usize,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub healthy: bool,
}

// --- Identity (from auth) ---

#[derive(Debug, Clone)]
pub enum Identity {
    User { id: String },
    Anonymous,
}

impl Identity {
    pub fn user_id(&self) -> &str {
        match self {
            Identity::User { id } => id,
            Identity::Anonymous => "anonymous",
        }
    }
}
