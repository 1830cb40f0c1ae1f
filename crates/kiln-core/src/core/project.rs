//! On-disk layout of a project's `.kiln` directory.
//!
//! ```text
//! <root>/.kiln/
//!   settings/           project settings (hashed into the sandbox build stamp)
//!     config.toml
//!     prompts/
//!   sandbox/            Dockerfile template, entrypoint, build stamps
//!   run/tasks/          local task specs and results
//!   run/rpc/            request/response files shared with the sandbox
//!   logs/
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub const STATE_DIR: &str = ".kiln";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    root: PathBuf,
}

impl ProjectLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves `root` to an absolute, canonical path.
    ///
    /// # Errors
    /// Returns an error if the directory does not exist.
    pub fn discover(root: &Path) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("resolve project root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    pub fn settings_dir(&self) -> PathBuf {
        self.state_dir().join("settings")
    }

    pub fn config_path(&self) -> PathBuf {
        self.settings_dir().join("config.toml")
    }

    pub fn prompts_dir(&self) -> PathBuf {
        self.settings_dir().join("prompts")
    }

    pub fn sandbox_dir(&self) -> PathBuf {
        self.state_dir().join("sandbox")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.state_dir().join("run").join("tasks")
    }

    pub fn rpc_dir(&self) -> PathBuf {
        self.state_dir().join("run").join("rpc")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir().join("logs")
    }

    /// Creates every directory of the layout.
    ///
    /// # Errors
    /// Returns an error if a directory cannot be created.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.settings_dir(),
            self.sandbox_dir(),
            self.tasks_dir(),
            self.rpc_dir(),
            self.logs_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_ensure_creates_layout() {
        let temp = TempDir::new().unwrap();
        let layout = ProjectLayout::discover(temp.path()).unwrap();
        layout.ensure().unwrap();

        assert!(layout.settings_dir().is_dir());
        assert!(layout.rpc_dir().is_dir());
        assert!(layout.tasks_dir().is_dir());
        assert!(layout.rpc_dir().starts_with(layout.root()));
    }

    #[test]
    fn test_discover_missing_root_fails() {
        let temp = TempDir::new().unwrap();
        assert!(ProjectLayout::discover(&temp.path().join("missing")).is_err());
    }
}
