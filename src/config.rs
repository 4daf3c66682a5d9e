//! Locations of the persisted documents.
//!
//! The task snapshot and the settings document are two independent
//! files so neither subsystem can clobber the other's keys. For each
//! file, a copy inside the project directory wins when it already
//! exists; otherwise the user-level config directory is used and
//! created on first write.

use std::io;
use std::path::{Path, PathBuf};

/// Directory kept inside a project root.
pub const PROJECT_DIR: &str = ".offload";
/// Subdirectory of the user config directory.
pub const USER_DIR: &str = "offload";
/// Task store snapshot file name.
pub const TASKS_FILE: &str = "tasks.json";
/// Settings document file name.
pub const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Clone)]
pub struct ConfigPaths {
    pub project_dir: PathBuf,
    pub user_dir: Option<PathBuf>,
}

impl ConfigPaths {
    /// Resolve paths for a project rooted at `project_root`.
    pub fn new(project_root: &Path) -> Self {
        Self {
            project_dir: project_root.join(PROJECT_DIR),
            user_dir: dirs::config_dir().map(|dir| dir.join(USER_DIR)),
        }
    }

    /// Path of the task store snapshot.
    pub fn tasks_file(&self) -> PathBuf {
        self.resolve(TASKS_FILE)
    }

    /// Path of the settings document.
    pub fn settings_file(&self) -> PathBuf {
        self.resolve(SETTINGS_FILE)
    }

    fn resolve(&self, name: &str) -> PathBuf {
        let project = self.project_dir.join(name);
        if project.exists() {
            return project;
        }
        match &self.user_dir {
            Some(dir) => dir.join(name),
            None => project,
        }
    }
}

/// Write `contents` through a sibling temp file and rename it into
/// place, so a concurrent reader never observes a partial document.
pub fn write_atomic(path: &Path, contents: &str) -> io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.exists()
    {
        std::fs::create_dir_all(parent)?;
    }
    let temp = path.with_extension("json.tmp");
    std::fs::write(&temp, contents)?;
    std::fs::rename(&temp, path)
}
