//! Background task orchestration.
//!
//! Launches long-running agent work as detached sessions, tracks each
//! task's lifecycle in the [`TaskStore`], and forwards cancellation to
//! the session client. There is no execution loop here: the manager
//! reacts to calls and to session events, which may arrive
//! concurrently with lookups and launches.

use crate::client::{SessionClient, SessionClientError, SessionEvent};
use crate::task::{Task, TaskStatus, TaskStore, TaskStoreError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Missing required field: {0}")]
    EmptyField(&'static str),

    #[error("Session creation failed: {0}")]
    Session(#[from] SessionClientError),

    #[error("Store error: {0}")]
    Store(#[from] TaskStoreError),
}

#[derive(Debug, Error)]
pub enum CancelError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task is {status}; only running tasks can be cancelled")]
    NotRunning { status: TaskStatus },

    #[error("Failed to abort session: {0}")]
    AbortFailed(#[source] SessionClientError),

    #[error("Store error: {0}")]
    Store(#[from] TaskStoreError),
}

/// Everything needed to start a background task. The parent session is
/// the caller's own session; resolving a default for it is the
/// caller's concern.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub description: String,
    pub prompt: String,
    pub agent: String,
    pub parent_session_id: String,
    pub parent_message_id: String,
}

pub struct BackgroundManager {
    store: Arc<TaskStore>,
    client: Arc<dyn SessionClient>,
}

impl BackgroundManager {
    pub fn new(store: Arc<TaskStore>, client: Arc<dyn SessionClient>) -> Self {
        Self { store, client }
    }

    /// Launch a background task: record it as pending, ask the client
    /// for a session, then mark it running. If the client fails, the
    /// record is removed again so the task never lingers half-created.
    pub async fn launch(&self, request: LaunchRequest) -> Result<Task, LaunchError> {
        for (field, value) in [
            ("description", &request.description),
            ("prompt", &request.prompt),
            ("agent", &request.agent),
        ] {
            if value.is_empty() {
                return Err(LaunchError::EmptyField(field));
            }
        }

        let task = self.store.insert(Task::new(
            request.description,
            request.prompt,
            request.agent,
            request.parent_session_id,
            request.parent_message_id,
        ))?;

        match self
            .client
            .create_session(&task.agent, &task.prompt, &task.parent_session_id)
            .await
        {
            Ok(session_id) => {
                let task = self.store.mark_running(&task.id, &session_id)?;
                info!(
                    "Launched background task {} ({}) in session {session_id}",
                    task.id, task.agent
                );
                Ok(task)
            }
            Err(e) => {
                if let Err(store_err) = self.store.remove(&task.id) {
                    warn!("Failed to roll back task {}: {store_err}", task.id);
                }
                Err(LaunchError::Session(e))
            }
        }
    }

    /// Look up a task by id. Unknown ids are an absent value, not an
    /// error.
    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.store.get(id)
    }

    /// All tasks spawned by a parent session, in creation order.
    pub fn tasks_for_parent(&self, parent_session_id: &str) -> Vec<Task> {
        self.store.by_parent(parent_session_id)
    }

    /// All currently running tasks.
    pub fn running_tasks(&self) -> Vec<Task> {
        self.store.running()
    }

    /// Replace a task's progress counters. Quietly does nothing when
    /// the task is already terminal or unknown.
    pub fn update_progress(
        &self,
        id: &str,
        tool_calls: u32,
        last_tool: Option<String>,
    ) -> Result<(), TaskStoreError> {
        self.store.set_progress(id, tool_calls, last_tool)?;
        Ok(())
    }

    /// Route a session event to the task owning that session. Events
    /// for unknown sessions or terminal tasks are dropped; persistence
    /// failures are logged since there is no caller to answer to.
    pub fn handle_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::ToolExecuted { session_id, tool } => {
                if let Some(task) = self.store.by_session(session_id)
                    && let Err(e) = self.store.bump_progress(&task.id, tool)
                {
                    warn!("Failed to record progress for task {}: {e}", task.id);
                }
            }
            SessionEvent::Idle { session_id } => {
                self.finish_session(session_id, TaskStatus::Completed);
            }
            SessionEvent::Error {
                session_id,
                message,
            } => {
                warn!("Session {session_id} reported an error: {message}");
                self.finish_session(session_id, TaskStatus::Failed);
            }
        }
    }

    fn finish_session(&self, session_id: &str, status: TaskStatus) {
        let Some(task) = self.store.by_session(session_id) else {
            return;
        };
        match self.store.finish(&task.id, status) {
            Ok(Some(task)) => info!("Background task {} finished as {}", task.id, task.status),
            Ok(None) => {}
            Err(e) => warn!("Failed to record finish for task {}: {e}", task.id),
        }
    }

    /// Cancel a running task. The session is aborted first; the record
    /// only becomes `cancelled` once the client acknowledges, so the
    /// status always reflects an actually-stopped session. An abort
    /// failure leaves the task untouched for a retry.
    pub async fn cancel(&self, id: &str) -> Result<Task, CancelError> {
        let task = self
            .store
            .get(id)
            .ok_or_else(|| CancelError::NotFound(id.to_string()))?;
        if task.status != TaskStatus::Running {
            return Err(CancelError::NotRunning {
                status: task.status,
            });
        }
        let Some(session_id) = task.session_id else {
            return Err(CancelError::NotRunning {
                status: task.status,
            });
        };

        self.client
            .abort_session(&session_id)
            .await
            .map_err(CancelError::AbortFailed)?;

        // The task may have finished or been cancelled by someone else
        // while the abort was in flight.
        match self.store.cancel_running(id)? {
            Some(task) => {
                info!("Cancelled background task {} (session {session_id})", task.id);
                Ok(task)
            }
            None => match self.store.get(id) {
                Some(current) => Err(CancelError::NotRunning {
                    status: current.status,
                }),
                None => Err(CancelError::NotFound(id.to_string())),
            },
        }
    }

    /// Write the task store snapshot to disk.
    pub fn persist(&self) -> Result<(), TaskStoreError> {
        self.store.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[derive(Default)]
    struct MockClient {
        created: AtomicUsize,
        aborted: AtomicUsize,
    }

    #[async_trait]
    impl SessionClient for MockClient {
        async fn create_session(
            &self,
            _agent: &str,
            _prompt: &str,
            _parent_session_id: &str,
        ) -> Result<String, SessionClientError> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(format!("session-{n}"))
        }

        async fn fetch_messages(
            &self,
            _session_id: &str,
        ) -> Result<Vec<crate::client::SessionMessage>, SessionClientError> {
            Ok(Vec::new())
        }

        async fn abort_session(&self, _session_id: &str) -> Result<(), SessionClientError> {
            self.aborted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RejectingClient;

    #[async_trait]
    impl SessionClient for RejectingClient {
        async fn create_session(
            &self,
            agent: &str,
            _prompt: &str,
            _parent_session_id: &str,
        ) -> Result<String, SessionClientError> {
            Err(SessionClientError::UnknownAgent(agent.to_string()))
        }

        async fn fetch_messages(
            &self,
            session_id: &str,
        ) -> Result<Vec<crate::client::SessionMessage>, SessionClientError> {
            Err(SessionClientError::SessionNotFound(session_id.to_string()))
        }

        async fn abort_session(&self, session_id: &str) -> Result<(), SessionClientError> {
            Err(SessionClientError::SessionNotFound(session_id.to_string()))
        }
    }

    struct FailingAbortClient;

    #[async_trait]
    impl SessionClient for FailingAbortClient {
        async fn create_session(
            &self,
            _agent: &str,
            _prompt: &str,
            _parent_session_id: &str,
        ) -> Result<String, SessionClientError> {
            Ok("session-0".to_string())
        }

        async fn fetch_messages(
            &self,
            _session_id: &str,
        ) -> Result<Vec<crate::client::SessionMessage>, SessionClientError> {
            Ok(Vec::new())
        }

        async fn abort_session(&self, _session_id: &str) -> Result<(), SessionClientError> {
            Err(SessionClientError::Transport("connection reset".to_string()))
        }
    }

    /// Aborts succeed, but only after yielding once, so concurrent
    /// cancellers all get past the running check before any of them
    /// can update the store.
    #[derive(Default)]
    struct SlowAbortClient {
        aborted: AtomicUsize,
    }

    #[async_trait]
    impl SessionClient for SlowAbortClient {
        async fn create_session(
            &self,
            _agent: &str,
            _prompt: &str,
            _parent_session_id: &str,
        ) -> Result<String, SessionClientError> {
            Ok("session-0".to_string())
        }

        async fn fetch_messages(
            &self,
            _session_id: &str,
        ) -> Result<Vec<crate::client::SessionMessage>, SessionClientError> {
            Ok(Vec::new())
        }

        async fn abort_session(&self, _session_id: &str) -> Result<(), SessionClientError> {
            tokio::task::yield_now().await;
            self.aborted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Checks that the task is visible as pending while the session is
    /// being created.
    struct PendingObserver {
        store: Arc<TaskStore>,
        saw_pending: AtomicBool,
    }

    #[async_trait]
    impl SessionClient for PendingObserver {
        async fn create_session(
            &self,
            _agent: &str,
            _prompt: &str,
            _parent_session_id: &str,
        ) -> Result<String, SessionClientError> {
            let tasks = self.store.tasks();
            if tasks.len() == 1
                && tasks[0].status == TaskStatus::Pending
                && tasks[0].session_id.is_none()
                && tasks[0].completed_at.is_none()
            {
                self.saw_pending.store(true, Ordering::SeqCst);
            }
            Ok("session-0".to_string())
        }

        async fn fetch_messages(
            &self,
            _session_id: &str,
        ) -> Result<Vec<crate::client::SessionMessage>, SessionClientError> {
            Ok(Vec::new())
        }

        async fn abort_session(&self, _session_id: &str) -> Result<(), SessionClientError> {
            Ok(())
        }
    }

    fn make_store(dir: &tempfile::TempDir) -> Arc<TaskStore> {
        Arc::new(TaskStore::load(dir.path().join("tasks.json")).unwrap())
    }

    fn request(description: &str, parent: &str) -> LaunchRequest {
        LaunchRequest {
            description: description.to_string(),
            prompt: "investigate issue #42".to_string(),
            agent: "debugger".to_string(),
            parent_session_id: parent.to_string(),
            parent_message_id: "m1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_launch_runs_task_in_new_session() {
        let dir = tempdir().unwrap();
        let store = make_store(&dir);
        let client = Arc::new(PendingObserver {
            store: store.clone(),
            saw_pending: AtomicBool::new(false),
        });
        let manager = BackgroundManager::new(store, client.clone());

        let task = manager.launch(request("fix bug", "s1")).await.unwrap();

        assert!(client.saw_pending.load(Ordering::SeqCst));
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.session_id.as_deref(), Some("session-0"));
        assert_eq!(task.parent_session_id, "s1");
        assert!(task.completed_at.is_none());

        let for_parent = manager.tasks_for_parent("s1");
        assert_eq!(for_parent.len(), 1);
        assert_eq!(for_parent[0].id, task.id);
    }

    #[tokio::test]
    async fn test_launches_assign_unique_ids() {
        let dir = tempdir().unwrap();
        let manager = BackgroundManager::new(make_store(&dir), Arc::new(MockClient::default()));

        let a = manager.launch(request("one", "s1")).await.unwrap();
        let b = manager.launch(request("two", "s1")).await.unwrap();
        let c = manager.launch(request("three", "s1")).await.unwrap();

        assert_ne!(a.id, b.id);
        assert_ne!(b.id, c.id);
        assert_ne!(a.id, c.id);
    }

    #[tokio::test]
    async fn test_launch_rejects_empty_fields() {
        let dir = tempdir().unwrap();
        let store = make_store(&dir);
        let manager = BackgroundManager::new(store.clone(), Arc::new(MockClient::default()));

        let mut bad = request("", "s1");
        let result = manager.launch(bad).await;
        assert!(matches!(result, Err(LaunchError::EmptyField("description"))));

        bad = request("fix bug", "s1");
        bad.agent = String::new();
        let result = manager.launch(bad).await;
        assert!(matches!(result, Err(LaunchError::EmptyField("agent"))));

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_launch_rolls_back_when_session_fails() {
        let dir = tempdir().unwrap();
        let store = make_store(&dir);
        let manager = BackgroundManager::new(store.clone(), Arc::new(RejectingClient));

        let result = manager.launch(request("fix bug", "s1")).await;

        assert!(matches!(
            result,
            Err(LaunchError::Session(SessionClientError::UnknownAgent(_)))
        ));
        assert!(store.is_empty());
        assert!(manager.tasks_for_parent("s1").is_empty());
    }

    #[tokio::test]
    async fn test_get_task_unknown_is_none() {
        let dir = tempdir().unwrap();
        let manager = BackgroundManager::new(make_store(&dir), Arc::new(MockClient::default()));

        assert!(manager.get_task("never-launched").is_none());
    }

    #[tokio::test]
    async fn test_tasks_for_parent_in_creation_order() {
        let dir = tempdir().unwrap();
        let manager = BackgroundManager::new(make_store(&dir), Arc::new(MockClient::default()));

        let first = manager.launch(request("one", "s1")).await.unwrap();
        manager.launch(request("other", "s2")).await.unwrap();
        let third = manager.launch(request("three", "s1")).await.unwrap();

        let tasks = manager.tasks_for_parent("s1");
        assert_eq!(
            tasks.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec![first.id.as_str(), third.id.as_str()]
        );
    }

    #[tokio::test]
    async fn test_update_progress_sets_counters() {
        let dir = tempdir().unwrap();
        let manager = BackgroundManager::new(make_store(&dir), Arc::new(MockClient::default()));
        let task = manager.launch(request("fix bug", "s1")).await.unwrap();

        manager
            .update_progress(&task.id, 5, Some("grep".to_string()))
            .unwrap();

        let progress = manager.get_task(&task.id).unwrap().progress.unwrap();
        assert_eq!(progress.tool_calls, 5);
        assert_eq!(progress.last_tool.as_deref(), Some("grep"));
    }

    #[tokio::test]
    async fn test_update_progress_ignores_completed_task() {
        let dir = tempdir().unwrap();
        let manager = BackgroundManager::new(make_store(&dir), Arc::new(MockClient::default()));
        let task = manager.launch(request("fix bug", "s1")).await.unwrap();
        manager.handle_event(&SessionEvent::Idle {
            session_id: "session-0".to_string(),
        });
        let before = manager.get_task(&task.id).unwrap();
        assert_eq!(before.status, TaskStatus::Completed);

        manager
            .update_progress(&task.id, 5, Some("grep".to_string()))
            .unwrap();

        assert_eq!(manager.get_task(&task.id).unwrap(), before);
    }

    #[tokio::test]
    async fn test_events_drive_progress_and_completion() {
        let dir = tempdir().unwrap();
        let manager = BackgroundManager::new(make_store(&dir), Arc::new(MockClient::default()));
        let task = manager.launch(request("fix bug", "s1")).await.unwrap();

        manager.handle_event(&SessionEvent::ToolExecuted {
            session_id: "session-0".to_string(),
            tool: "read".to_string(),
        });
        manager.handle_event(&SessionEvent::ToolExecuted {
            session_id: "session-0".to_string(),
            tool: "grep".to_string(),
        });

        let current = manager.get_task(&task.id).unwrap();
        let progress = current.progress.unwrap();
        assert_eq!(progress.tool_calls, 2);
        assert_eq!(progress.last_tool.as_deref(), Some("grep"));
        assert!(current.completed_at.is_none());

        manager.handle_event(&SessionEvent::Idle {
            session_id: "session-0".to_string(),
        });
        let current = manager.get_task(&task.id).unwrap();
        assert_eq!(current.status, TaskStatus::Completed);
        assert!(current.completed_at.is_some());

        // A late event must not resurrect or mutate the finished task.
        manager.handle_event(&SessionEvent::ToolExecuted {
            session_id: "session-0".to_string(),
            tool: "write".to_string(),
        });
        assert_eq!(
            manager
                .get_task(&task.id)
                .unwrap()
                .progress
                .unwrap()
                .last_tool
                .as_deref(),
            Some("grep")
        );
    }

    #[tokio::test]
    async fn test_error_event_marks_task_failed() {
        let dir = tempdir().unwrap();
        let manager = BackgroundManager::new(make_store(&dir), Arc::new(MockClient::default()));
        let task = manager.launch(request("fix bug", "s1")).await.unwrap();

        manager.handle_event(&SessionEvent::Error {
            session_id: "session-0".to_string(),
            message: "model unavailable".to_string(),
        });

        let current = manager.get_task(&task.id).unwrap();
        assert_eq!(current.status, TaskStatus::Failed);
        assert!(current.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_event_for_unknown_session_is_dropped() {
        let dir = tempdir().unwrap();
        let manager = BackgroundManager::new(make_store(&dir), Arc::new(MockClient::default()));
        let task = manager.launch(request("fix bug", "s1")).await.unwrap();

        manager.handle_event(&SessionEvent::Idle {
            session_id: "some-other-session".to_string(),
        });

        assert_eq!(
            manager.get_task(&task.id).unwrap().status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_running_task() {
        let dir = tempdir().unwrap();
        let client = Arc::new(MockClient::default());
        let manager = BackgroundManager::new(make_store(&dir), client.clone());
        let task = manager.launch(request("fix bug", "s1")).await.unwrap();

        let cancelled = manager.cancel(&task.id).await.unwrap();

        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        assert_eq!(client.aborted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_unknown_task_is_not_found() {
        let dir = tempdir().unwrap();
        let manager = BackgroundManager::new(make_store(&dir), Arc::new(MockClient::default()));

        assert!(matches!(
            manager.cancel("missing").await,
            Err(CancelError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_completed_task_is_not_running() {
        let dir = tempdir().unwrap();
        let manager = BackgroundManager::new(make_store(&dir), Arc::new(MockClient::default()));
        let task = manager.launch(request("fix bug", "s1")).await.unwrap();
        manager.handle_event(&SessionEvent::Idle {
            session_id: "session-0".to_string(),
        });
        let completed_at = manager.get_task(&task.id).unwrap().completed_at;

        let result = manager.cancel(&task.id).await;

        assert!(matches!(
            result,
            Err(CancelError::NotRunning {
                status: TaskStatus::Completed
            })
        ));
        assert_eq!(manager.get_task(&task.id).unwrap().completed_at, completed_at);
    }

    #[tokio::test]
    async fn test_cancel_abort_failure_leaves_task_running() {
        let dir = tempdir().unwrap();
        let manager = BackgroundManager::new(make_store(&dir), Arc::new(FailingAbortClient));
        let task = manager.launch(request("fix bug", "s1")).await.unwrap();

        let result = manager.cancel(&task.id).await;

        assert!(matches!(result, Err(CancelError::AbortFailed(_))));
        let current = manager.get_task(&task.id).unwrap();
        assert_eq!(current.status, TaskStatus::Running);
        assert!(current.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_double_cancel_has_single_winner() {
        let dir = tempdir().unwrap();
        let manager = BackgroundManager::new(make_store(&dir), Arc::new(MockClient::default()));
        let task = manager.launch(request("fix bug", "s1")).await.unwrap();

        let (a, b) = tokio::join!(manager.cancel(&task.id), manager.cancel(&task.id));

        let successes = [&a, &b].iter().filter(|result| result.is_ok()).count();
        assert_eq!(successes, 1);
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(
            loser,
            Err(CancelError::NotRunning {
                status: TaskStatus::Cancelled
            })
        ));
    }

    #[tokio::test]
    async fn test_cancel_race_after_abort_has_single_winner() {
        let dir = tempdir().unwrap();
        let client = Arc::new(SlowAbortClient::default());
        let manager = BackgroundManager::new(make_store(&dir), client.clone());
        let task = manager.launch(request("fix bug", "s1")).await.unwrap();

        let (a, b) = tokio::join!(manager.cancel(&task.id), manager.cancel(&task.id));

        // Both callers saw the task running and aborted the session;
        // only one may record the cancellation.
        assert_eq!(client.aborted.load(Ordering::SeqCst), 2);
        let successes = [&a, &b].iter().filter(|result| result.is_ok()).count();
        assert_eq!(successes, 1);
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(
            loser,
            Err(CancelError::NotRunning {
                status: TaskStatus::Cancelled
            })
        ));
        assert_eq!(
            manager.get_task(&task.id).unwrap().status,
            TaskStatus::Cancelled
        );
    }
}
