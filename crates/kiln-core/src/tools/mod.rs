//! Tool registry.
//!
//! Tools are looked up by case-insensitive name and run either directly
//! (`run`, also used by the in-sandbox task runner) or as a task on the
//! `TaskManager` (`schedule`).

pub mod echo;
pub mod output;
pub mod shell;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

pub use output::{ToolError, ToolOutput};

use crate::config::ToolsConfig;
use crate::tasks::{TaskManager, Work};

#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Context for tool execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Root directory for file operations.
    pub root: PathBuf,

    /// Optional timeout for tool execution.
    pub timeout: Option<Duration>,
}

impl ToolContext {
    pub fn new(root: PathBuf, timeout: Option<Duration>) -> Self {
        Self { root, timeout }
    }
}

pub type ToolFuture = Pin<Box<dyn Future<Output = ToolOutput> + Send>>;
pub type ToolHandler = Arc<dyn Fn(&Value, &ToolContext) -> ToolFuture + Send + Sync>;

/// Tool registry (definitions + executors).
#[derive(Clone, Default)]
pub struct ToolRegistry {
    definitions: Vec<ToolDefinition>,
    handlers: HashMap<String, ToolHandler>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("definitions", &self.definitions)
            .field("handlers_len", &self.handlers.len())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtins() -> Self {
        let mut registry = Self::new();
        registry.register(
            shell::definition(),
            Arc::new(|input, ctx| {
                let input = input.clone();
                let ctx = ctx.clone();
                Box::pin(async move { shell::execute(&input, &ctx, ctx.timeout).await })
            }),
        );
        registry.register(
            echo::definition(),
            Arc::new(|input, _ctx| {
                let input = input.clone();
                Box::pin(async move { echo::execute(&input) })
            }),
        );
        registry
    }

    #[must_use]
    pub fn with_tool(mut self, definition: ToolDefinition, handler: ToolHandler) -> Self {
        self.register(definition, handler);
        self
    }

    pub fn register(&mut self, definition: ToolDefinition, handler: ToolHandler) {
        self.definitions
            .retain(|t| !t.name.eq_ignore_ascii_case(&definition.name));
        self.handlers
            .insert(definition.name.to_ascii_lowercase(), handler);
        self.definitions.push(definition);
    }

    /// Keeps only the tools enabled by `config`.
    #[must_use]
    pub fn filtered(mut self, config: &ToolsConfig) -> Self {
        let names = self.tool_names();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let enabled: Vec<String> = config
            .filter_tools(&refs)
            .into_iter()
            .map(str::to_string)
            .collect();
        self.definitions
            .retain(|t| enabled.contains(&t.name.to_ascii_lowercase()));
        self.handlers.retain(|name, _| enabled.contains(name));
        self
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.definitions
            .iter()
            .map(|t| t.name.to_ascii_lowercase())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<ToolHandler> {
        self.handlers.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Runs a tool to completion. Unknown tools produce a failure envelope.
    pub async fn run(&self, name: &str, input: &Value, ctx: &ToolContext) -> ToolOutput {
        match self.get(name) {
            Some(handler) => handler(input, ctx).await,
            None => self.unknown_tool_output(name),
        }
    }

    /// Schedules a tool invocation as a task and returns the task id.
    ///
    /// # Errors
    /// Returns an error if the tool is unknown or the task cannot be created.
    pub fn schedule(
        &self,
        tasks: &TaskManager,
        name: &str,
        input: Value,
        ctx: &ToolContext,
    ) -> Result<String> {
        let Some(handler) = self.get(name) else {
            anyhow::bail!(
                "Unknown tool: {name}. Available tools: {}",
                self.available().join(", ")
            );
        };

        let ctx = ctx.clone();
        let work_input = input.clone();
        tasks.create_task(
            name.to_ascii_lowercase(),
            Work::future(move || async move { handler(&work_input, &ctx).await.into_result() }),
            input,
        )
    }

    fn available(&self) -> Vec<String> {
        let mut names = self.tool_names();
        names.sort();
        names
    }

    fn unknown_tool_output(&self, name: &str) -> ToolOutput {
        ToolOutput::failure_with_details(
            "unknown_tool",
            format!("Unknown tool: {name}"),
            format!("Available tools: {}", self.available().join(", ")),
        )
    }
}
