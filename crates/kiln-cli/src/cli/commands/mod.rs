//! CLI command handlers.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use kiln_core::config::Config;
use kiln_core::core::project::ProjectLayout;
use kiln_core::core::session;
use kiln_core::dispatch::Dispatcher;
use kiln_core::logging::{self, WorkerGuard};
use kiln_core::sandbox::Sandbox;
use kiln_core::tasks::{TaskManager, TaskStore};
use kiln_core::tools::{ToolContext, ToolRegistry};

pub mod config;
pub mod repl;
pub mod run_task;
pub mod sandbox;
pub mod tasks;

/// A resolved project: layout, merged config, session and logging.
pub struct Project {
    pub layout: ProjectLayout,
    pub config: Config,
    pub session_id: String,
    _log_guard: Option<WorkerGuard>,
}

impl Project {
    /// Resolves `root`, creates the `.kiln` tree, loads config and starts logging.
    pub fn open(root: &Path, session_id: Option<String>) -> Result<Self> {
        let layout = ProjectLayout::discover(root)?;
        layout.ensure()?;
        let config = Config::load_for(layout.root()).context("load config")?;
        let log_guard = logging::init(&layout.logs_dir(), &config.log_level)?;

        let session_id = session_id
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(session::current_session_id);
        tracing::info!(
            root = %layout.root().display(),
            session = %session_id,
            in_sandbox = session::in_sandbox(),
            "project opened"
        );

        Ok(Self {
            layout,
            config,
            session_id,
            _log_guard: log_guard,
        })
    }

    pub fn sandbox(&self) -> Arc<Sandbox> {
        Arc::new(Sandbox::new(
            self.layout.clone(),
            self.config.sandbox.clone(),
            self.session_id.clone(),
        ))
    }

    pub fn tools(&self) -> ToolRegistry {
        ToolRegistry::builtins().filtered(&self.config.tools)
    }

    pub fn tool_context(&self) -> ToolContext {
        ToolContext::new(
            self.layout.root().to_path_buf(),
            self.config.tasks.tool_timeout(),
        )
    }

    pub fn task_store(&self) -> TaskStore {
        TaskStore::new(self.layout.tasks_dir())
    }

    pub fn dispatcher(&self) -> Dispatcher {
        let tasks = Arc::new(TaskManager::new(
            self.task_store(),
            self.config.tasks.max_concurrency(),
        ));
        Dispatcher::new(
            self.layout.clone(),
            self.config.clone(),
            tasks,
            self.tools(),
            self.sandbox(),
        )
    }
}
