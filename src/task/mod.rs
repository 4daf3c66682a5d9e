mod store;

pub use store::{TaskStore, TaskStoreError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of a background task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Record created, session not yet confirmed.
    Pending,
    /// Session dispatched and executing.
    Running,
    /// Session finished successfully.
    Completed,
    /// Session reported an error, or the task was interrupted by a restart.
    Failed,
    /// Explicitly cancelled while running.
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true when no further status transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution counters reported while the session runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub tool_calls: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_tool: Option<String>,
}

/// A unit of background agent work, tracked from launch to completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    /// Creation counter, assigned by the store; orders tasks within a
    /// parent session.
    #[serde(default)]
    pub seq: u64,
    pub description: String,
    pub prompt: String,
    pub agent: String,
    #[serde(rename = "parentSessionID")]
    pub parent_session_id: String,
    #[serde(rename = "parentMessageID")]
    pub parent_message_id: String,
    /// Detached session running the work; set once the session is
    /// confirmed.
    #[serde(rename = "sessionID", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    /// Set if and only if `status` is terminal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<TaskProgress>,
}

impl Task {
    pub fn new(
        description: String,
        prompt: String,
        agent: String,
        parent_session_id: String,
        parent_message_id: String,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            seq: 0,
            description,
            prompt,
            agent,
            parent_session_id,
            parent_message_id,
            session_id: None,
            status: TaskStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            progress: None,
        }
    }
}
