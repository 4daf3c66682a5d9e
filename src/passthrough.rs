//! Passthrough-mode toggle.
//!
//! Flips the `passthrough_mode` flag in the settings document for the
//! next process run. The document is owned by the hosting environment
//! and may carry other keys; this module only touches its own key and
//! writes the rest back untouched.

use crate::config::{self, ConfigPaths};
use crate::manager::BackgroundManager;
use crate::task::Task;
use serde_json::{Map, Value};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Key this module owns inside the settings document.
pub const PASSTHROUGH_KEY: &str = "passthrough_mode";

#[derive(Debug, Error)]
pub enum ToggleError {
    #[error("Background tasks are still running")]
    TasksRunning(Vec<Task>),

    #[error("Io error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What a successful toggle did.
#[derive(Debug, Clone)]
pub struct ToggleOutcome {
    pub passthrough_mode: bool,
    pub path: PathBuf,
}

/// Read the persisted flag. A missing document or key reads as
/// disabled.
pub fn read_passthrough(paths: &ConfigPaths) -> Result<bool, ToggleError> {
    let document = read_settings(&paths.settings_file())?;
    Ok(document
        .get(PASSTHROUGH_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false))
}

/// Flip the flag from `current` for the next run. Refused while any
/// background task is running, so a restart cannot strand active work.
pub fn toggle(
    manager: &BackgroundManager,
    paths: &ConfigPaths,
    current: bool,
) -> Result<ToggleOutcome, ToggleError> {
    let running = manager.running_tasks();
    if !running.is_empty() {
        return Err(ToggleError::TasksRunning(running));
    }

    let next = !current;
    let path = paths.settings_file();
    let mut document = read_settings(&path)?;
    document.insert(PASSTHROUGH_KEY.to_string(), Value::Bool(next));

    let content = serde_json::to_string_pretty(&Value::Object(document))?;
    config::write_atomic(&path, &format!("{content}\n"))?;
    info!(
        "Set {PASSTHROUGH_KEY}={next} in {} for the next run",
        path.display()
    );

    Ok(ToggleOutcome {
        passthrough_mode: next,
        path,
    })
}

fn read_settings(path: &Path) -> Result<Map<String, Value>, ToggleError> {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let value: Value = serde_json::from_str(&content)?;
            match value {
                Value::Object(map) => Ok(map),
                // A non-object document gets replaced rather than merged.
                _ => Ok(Map::new()),
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Map::new()),
        Err(e) => Err(e.into()),
    }
}
