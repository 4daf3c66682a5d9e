//! Human-readable reports over manager results.
//!
//! Callers do the lookups and pass in what they got; these functions
//! only format. Absent tasks and failed calls render as distinct
//! messages, never a shared generic one.

use crate::client::{Role, SessionClient};
use crate::manager::{CancelError, LaunchError};
use crate::task::{Task, TaskStatus};
use chrono::{DateTime, Utc};

/// Elapsed time between `start` and `end` (now when `end` is absent),
/// as `2h 3m 4s`, `3m 4s`, or `4s`.
pub fn format_duration(start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> String {
    let end = end.unwrap_or_else(Utc::now);
    let seconds = (end - start).num_seconds().max(0);
    let minutes = seconds / 60;
    let hours = minutes / 60;

    if hours > 0 {
        format!("{hours}h {}m {}s", minutes % 60, seconds % 60)
    } else if minutes > 0 {
        format!("{minutes}m {}s", seconds % 60)
    } else {
        format!("{seconds}s")
    }
}

pub fn launch_success(task: &Task) -> String {
    format!(
        "✅ Background task launched successfully!

Task ID: {id}
Session ID: {session}
Description: {description}
Agent: {agent}
Status: {status}

Use `background_status` tool to check progress.
Use `background_result` tool to retrieve results when complete.",
        id = task.id,
        session = task.session_id.as_deref().unwrap_or(""),
        description = task.description,
        agent = task.agent,
        status = task.status,
    )
}

pub fn launch_failure(error: &LaunchError) -> String {
    format!("❌ Failed to launch background task: {error}")
}

pub fn task_not_found(id: &str) -> String {
    format!("❌ Task not found: {id}")
}

/// Status block for one task.
pub fn task_status(task: &Task) -> String {
    let duration = format_duration(task.started_at, task.completed_at);
    let progress = task.progress.as_ref().map_or(String::new(), |progress| {
        format!(
            "\nTool calls: {}\nLast tool: {}",
            progress.tool_calls,
            progress.last_tool.as_deref().unwrap_or("N/A")
        )
    });

    format!(
        "📊 Task Status

Task ID: {id}
Description: {description}
Agent: {agent}
Status: {status}
Duration: {duration}{progress}

Session ID: {session}",
        id = task.id,
        description = task.description,
        agent = task.agent,
        status = task.status,
        session = task.session_id.as_deref().unwrap_or(""),
    )
}

/// One-line-per-task listing for a parent session.
pub fn session_tasks(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "No background tasks found for this session.".to_string();
    }

    let mut output = format!("📊 Background Tasks ({})\n\n", tasks.len());
    for task in tasks {
        let duration = format_duration(task.started_at, task.completed_at);
        let progress = task
            .progress
            .as_ref()
            .map_or(String::new(), |progress| {
                format!(" | {} tools", progress.tool_calls)
            });
        output.push_str(&format!(
            "• {} - {} ({duration}{progress})\n",
            task.id, task.status
        ));
        output.push_str(&format!("  {}\n\n", task.description));
    }
    output
}

/// Final output of a completed task: the last assistant message of its
/// session transcript.
pub async fn task_result(task: &Task, client: &dyn SessionClient) -> String {
    if task.status != TaskStatus::Completed {
        return format!(
            "⏳ Task is still {}. Wait for completion.

Use `background_status` tool to check progress.",
            task.status
        );
    }

    let Some(session_id) = task.session_id.as_deref() else {
        return no_output(task);
    };

    let messages = match client.fetch_messages(session_id).await {
        Ok(messages) => messages,
        Err(e) => return format!("❌ Error fetching messages: {e}"),
    };

    let Some(last) = messages
        .iter()
        .rev()
        .find(|message| message.role == Role::Assistant)
    else {
        return no_output(task);
    };

    let duration = format_duration(task.started_at, task.completed_at);
    format!(
        "✅ Task Result

Task ID: {id}
Description: {description}
Duration: {duration}
Session ID: {session_id}

---

{text}",
        id = task.id,
        description = task.description,
        text = last.text,
    )
}

fn no_output(task: &Task) -> String {
    format!(
        "⚠️ Task completed but no output found.

Task ID: {id}
Session ID: {session}",
        id = task.id,
        session = task.session_id.as_deref().unwrap_or(""),
    )
}

/// Renders a cancel call's outcome, one distinct message per error
/// kind.
pub fn cancel_outcome(result: &Result<Task, CancelError>) -> String {
    match result {
        Ok(task) => format!(
            "✅ Task cancelled successfully

Task ID: {id}
Description: {description}
Session ID: {session}
Status: {status}",
            id = task.id,
            description = task.description,
            session = task.session_id.as_deref().unwrap_or(""),
            status = task.status,
        ),
        Err(CancelError::NotFound(id)) => task_not_found(id),
        Err(CancelError::NotRunning { status }) => format!(
            "❌ Cannot cancel task: current status is \"{status}\".
Only running tasks can be cancelled."
        ),
        Err(CancelError::AbortFailed(source)) => {
            format!("❌ Failed to abort session: {source}")
        }
        Err(error) => format!("❌ Error cancelling task: {error}"),
    }
}

/// Explains why the passthrough toggle was refused, listing the tasks
/// that are still running.
pub fn toggle_blocked(tasks: &[Task]) -> String {
    let plural = if tasks.len() > 1 { "s" } else { "" };
    let mut lines = String::new();
    for task in tasks {
        lines.push_str(&format!("  • {} ({})\n", task.description, task.agent));
    }

    format!(
        "❌ Cannot toggle passthrough mode

Reason: {count} background task{plural} currently running

Running tasks:
{lines}
Wait for running tasks to complete, or cancel them, then try again.",
        count = tasks.len(),
    )
}
