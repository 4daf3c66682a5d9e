//! JSON-backed task persistence.

use crate::config;
use crate::task::{Task, TaskProgress, TaskStatus};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("Io error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task not found: {0}")]
    NotFound(String),
}

/// On-disk form of the store.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreSnapshot {
    #[serde(default)]
    tasks: HashMap<String, Task>,
    #[serde(default)]
    seq: u64,
}

struct StoreState {
    tasks: HashMap<String, Task>,
    seq: u64,
    /// Set while the snapshot on disk lags the in-memory map.
    dirty: bool,
}

/// Process-wide record of all known tasks, loaded once at startup and
/// written back after every mutation. The lock is held around each
/// mutate-plus-persist sequence so single-task updates never interleave.
pub struct TaskStore {
    path: PathBuf,
    state: RwLock<StoreState>,
}

impl TaskStore {
    /// Load the store from its snapshot file. A missing file yields an
    /// empty store; a malformed one is an error. Tasks left `pending`
    /// or `running` by a previous process are marked failed, since the
    /// sessions driving them died with that process.
    pub fn load(path: PathBuf) -> Result<Self, TaskStoreError> {
        let snapshot = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<StoreSnapshot>(&content)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No task snapshot at {}, starting empty", path.display());
                StoreSnapshot::default()
            }
            Err(e) => return Err(e.into()),
        };

        let mut tasks = snapshot.tasks;
        let seq = tasks
            .values()
            .map(|task| task.seq + 1)
            .max()
            .unwrap_or(0)
            .max(snapshot.seq);

        let mut repaired = 0usize;
        for task in tasks.values_mut() {
            if !task.status.is_terminal() {
                warn!(
                    "Task {} was {} at shutdown, marking failed",
                    task.id, task.status
                );
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());
                repaired += 1;
            }
        }

        let store = Self {
            path,
            state: RwLock::new(StoreState {
                tasks,
                seq,
                dirty: repaired > 0,
            }),
        };

        if repaired > 0 {
            let mut state = store.write_state();
            if let Err(e) = store.persist_locked(&mut state) {
                warn!("Failed to persist repaired snapshot: {e}");
            }
        }

        Ok(store)
    }

    /// Insert a new task, assigning its creation sequence number.
    /// Returns the stored task. If the snapshot cannot be written the
    /// insert is undone, so a task never exists only in memory at birth.
    pub fn insert(&self, mut task: Task) -> Result<Task, TaskStoreError> {
        let mut state = self.write_state();
        task.seq = state.seq;
        state.seq += 1;
        state.tasks.insert(task.id.clone(), task.clone());
        if let Err(e) = self.persist_locked(&mut state) {
            state.tasks.remove(&task.id);
            return Err(e);
        }
        Ok(task)
    }

    /// Remove a task entirely. Used to roll back a launch whose session
    /// was never created.
    pub fn remove(&self, id: &str) -> Result<Option<Task>, TaskStoreError> {
        let mut state = self.write_state();
        let removed = state.tasks.remove(id);
        if removed.is_some() || state.dirty {
            self.persist_locked(&mut state)?;
        }
        Ok(removed)
    }

    /// Transition a pending task to running and record its session.
    /// A task already past pending is returned unchanged.
    pub fn mark_running(&self, id: &str, session_id: &str) -> Result<Task, TaskStoreError> {
        let mut state = self.write_state();
        let Some(task) = state.tasks.get_mut(id) else {
            return Err(TaskStoreError::NotFound(id.to_string()));
        };
        if task.status != TaskStatus::Pending {
            return Ok(task.clone());
        }
        task.status = TaskStatus::Running;
        task.session_id = Some(session_id.to_string());
        let task = task.clone();
        self.persist_locked(&mut state)?;
        Ok(task)
    }

    /// Replace a task's progress counters. No-op when the task is
    /// terminal or unknown; a finished task is never resurrected.
    pub fn set_progress(
        &self,
        id: &str,
        tool_calls: u32,
        last_tool: Option<String>,
    ) -> Result<Option<Task>, TaskStoreError> {
        let mut state = self.write_state();
        let updated = match state.tasks.get_mut(id) {
            Some(task) if !task.status.is_terminal() => {
                task.progress = Some(TaskProgress {
                    tool_calls,
                    last_tool,
                });
                Some(task.clone())
            }
            _ => None,
        };
        if updated.is_some() || state.dirty {
            self.persist_locked(&mut state)?;
        }
        Ok(updated)
    }

    /// Increment a task's tool-call counter and record the tool name.
    /// No-op when the task is terminal or unknown.
    pub fn bump_progress(&self, id: &str, tool: &str) -> Result<Option<Task>, TaskStoreError> {
        let mut state = self.write_state();
        let updated = match state.tasks.get_mut(id) {
            Some(task) if !task.status.is_terminal() => {
                let tool_calls = task
                    .progress
                    .as_ref()
                    .map_or(0, |progress| progress.tool_calls)
                    .saturating_add(1);
                task.progress = Some(TaskProgress {
                    tool_calls,
                    last_tool: Some(tool.to_string()),
                });
                Some(task.clone())
            }
            _ => None,
        };
        if updated.is_some() || state.dirty {
            self.persist_locked(&mut state)?;
        }
        Ok(updated)
    }

    /// Move a non-terminal task into a terminal status, stamping
    /// `completed_at`. Returns `None` when the task is unknown, already
    /// terminal, or `status` is not itself terminal.
    pub fn finish(&self, id: &str, status: TaskStatus) -> Result<Option<Task>, TaskStoreError> {
        if !status.is_terminal() {
            return Ok(None);
        }
        let mut state = self.write_state();
        let updated = match state.tasks.get_mut(id) {
            Some(task) if !task.status.is_terminal() => {
                task.status = status;
                task.completed_at = Some(Utc::now());
                Some(task.clone())
            }
            _ => None,
        };
        if updated.is_some() || state.dirty {
            self.persist_locked(&mut state)?;
        }
        Ok(updated)
    }

    /// Cancel a task if and only if it is still running. Returns `None`
    /// when it is not, so racing cancellers see exactly one winner.
    pub fn cancel_running(&self, id: &str) -> Result<Option<Task>, TaskStoreError> {
        let mut state = self.write_state();
        let updated = match state.tasks.get_mut(id) {
            Some(task) if task.status == TaskStatus::Running => {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(Utc::now());
                Some(task.clone())
            }
            _ => None,
        };
        if updated.is_some() || state.dirty {
            self.persist_locked(&mut state)?;
        }
        Ok(updated)
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.read_state().tasks.get(id).cloned()
    }

    /// Find the task owning a session.
    pub fn by_session(&self, session_id: &str) -> Option<Task> {
        self.read_state()
            .tasks
            .values()
            .find(|task| task.session_id.as_deref() == Some(session_id))
            .cloned()
    }

    /// All tasks spawned by a parent session, in creation order.
    pub fn by_parent(&self, parent_session_id: &str) -> Vec<Task> {
        sorted(
            self.read_state()
                .tasks
                .values()
                .filter(|task| task.parent_session_id == parent_session_id)
                .cloned()
                .collect(),
        )
    }

    /// All currently running tasks, in creation order.
    pub fn running(&self) -> Vec<Task> {
        sorted(
            self.read_state()
                .tasks
                .values()
                .filter(|task| task.status == TaskStatus::Running)
                .cloned()
                .collect(),
        )
    }

    /// Every known task, in creation order.
    pub fn tasks(&self) -> Vec<Task> {
        sorted(self.read_state().tasks.values().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.read_state().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_state().tasks.is_empty()
    }

    /// True while the snapshot on disk lags the in-memory map.
    pub fn is_dirty(&self) -> bool {
        self.read_state().dirty
    }

    /// Write the current snapshot to disk.
    pub fn persist(&self) -> Result<(), TaskStoreError> {
        let mut state = self.write_state();
        self.persist_locked(&mut state)
    }

    /// Final persist before the store is dropped.
    pub fn teardown(&self) -> Result<(), TaskStoreError> {
        debug!("Persisting task store on teardown");
        self.persist()
    }

    fn persist_locked(&self, state: &mut StoreState) -> Result<(), TaskStoreError> {
        state.dirty = true;
        let snapshot = StoreSnapshot {
            tasks: state.tasks.clone(),
            seq: state.seq,
        };
        let content = serde_json::to_string_pretty(&snapshot)?;
        config::write_atomic(&self.path, &format!("{content}\n"))?;
        state.dirty = false;
        debug!(
            "Persisted {} task(s) to {}",
            state.tasks.len(),
            self.path.display()
        );
        Ok(())
    }

    fn read_state(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn sorted(mut tasks: Vec<Task>) -> Vec<Task> {
    tasks.sort_by_key(|task| (task.seq, task.started_at));
    tasks
}
