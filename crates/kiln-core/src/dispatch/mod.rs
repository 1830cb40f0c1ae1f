//! Line dispatcher.
//!
//! One input line maps to exactly one branch, tried in this order:
//!
//! 1. `:name args`     management command
//! 2. `!!tool payload` tool invocation (task engine, or the sandbox)
//! 3. `!command`       raw host shell
//! 4. anything else    conversational fallback
//!
//! When the sandbox is mandatory but not running, tool invocations and
//! prompts are refused instead of falling back to the host.

pub mod commands;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::future::BoxFuture;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Value, json};

use crate::config::Config;
use crate::core::project::ProjectLayout;
use crate::sandbox::{DispatchOutcome, Sandbox};
use crate::tasks::model::new_task_id;
use crate::tasks::{TaskManager, TaskResult, TaskSpec, Work};
use crate::tools::{ToolContext, ToolRegistry, shell};

/// Programs that need the real terminal instead of a captured pipe.
pub const INTERACTIVE_PROGRAMS: &[&str] =
    &["vim", "nvim", "vi", "less", "more", "top", "htop", "man", "nano"];

/// A classified input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction<'a> {
    Empty,
    Command { name: &'a str, args: &'a str },
    Tool { name: &'a str, payload: &'a str },
    Shell(&'a str),
    Prompt(&'a str),
}

impl<'a> Instruction<'a> {
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        if let Some(rest) = line.strip_prefix(':') {
            let (name, args) = split_word(rest);
            return Self::Command { name, args };
        }
        if let Some(rest) = line.strip_prefix("!!") {
            let (name, payload) = split_word(rest);
            return Self::Tool { name, payload };
        }
        if let Some(rest) = line.strip_prefix('!') {
            return Self::Shell(rest.trim());
        }
        Self::Prompt(line)
    }
}

fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (s, ""),
    }
}

/// Tool payloads that parse as JSON are passed as-is; anything else is a
/// JSON string.
pub fn parse_payload(payload: &str) -> Value {
    if payload.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(payload).unwrap_or_else(|_| Value::String(payload.to_string()))
}

fn is_interactive_program(command: &str) -> bool {
    command
        .split_whitespace()
        .next()
        .and_then(|program| Path::new(program).file_name())
        .and_then(|name| name.to_str())
        .is_some_and(|name| INTERACTIVE_PROGRAMS.contains(&name))
}

/// What the caller should show (or do) after one line.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Silent,
    Text(String),
    /// Something the user should read as a warning: refusals, unknown names.
    Notice(String),
    /// A scheduled task; `result` is set when the dispatcher waited for it.
    Task {
        id: String,
        result: Option<TaskResult>,
    },
    Exit,
}

/// Fallback collaborator for lines that are not commands.
pub trait Conversation: Send + Sync {
    fn respond<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// Used when no conversational backend is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoConversation;

impl Conversation for NoConversation {
    fn respond<'a>(&'a self, _prompt: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async {
            Ok("No conversational backend is configured. Try :help, !!<tool> <payload>, or !<shell command>."
                .to_string())
        })
    }
}

pub struct Dispatcher {
    layout: ProjectLayout,
    config: Config,
    tasks: Arc<TaskManager>,
    tools: ToolRegistry,
    sandbox: Arc<Sandbox>,
    conversation: Box<dyn Conversation>,
    tool_ctx: ToolContext,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("root", &self.layout.root())
            .field("tools", &self.tools.tool_names())
            .field("sandbox", &self.sandbox)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        layout: ProjectLayout,
        config: Config,
        tasks: Arc<TaskManager>,
        tools: ToolRegistry,
        sandbox: Arc<Sandbox>,
    ) -> Self {
        let tool_ctx = ToolContext::new(layout.root().to_path_buf(), config.tasks.tool_timeout());
        Self {
            layout,
            config,
            tasks,
            tools,
            sandbox,
            conversation: Box::new(NoConversation),
            tool_ctx,
        }
    }

    #[must_use]
    pub fn with_conversation(mut self, conversation: Box<dyn Conversation>) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn layout(&self) -> &ProjectLayout {
        &self.layout
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tasks(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    pub fn tool_context(&self) -> &ToolContext {
        &self.tool_ctx
    }

    /// Handles one input line.
    ///
    /// With `interactive`, tool invocations block on their result behind a
    /// spinner; otherwise the task id is returned right away.
    ///
    /// # Errors
    /// Only unexpected failures (scheduler gone, I/O); user mistakes come
    /// back as `Reply::Notice`.
    pub async fn dispatch(&self, line: &str, interactive: bool) -> Result<Reply> {
        match Instruction::parse(line) {
            Instruction::Empty => Ok(Reply::Silent),
            Instruction::Command { name, args } => commands::run(self, name, args).await,
            Instruction::Tool { name, payload } => {
                if let Some(refusal) = self.sandbox_refusal().await {
                    return Ok(refusal);
                }
                self.run_tool(name, payload, interactive).await
            }
            Instruction::Shell(command) => self.run_shell(command).await,
            Instruction::Prompt(prompt) => {
                if let Some(refusal) = self.sandbox_refusal().await {
                    return Ok(refusal);
                }
                Ok(Reply::Text(self.conversation.respond(prompt).await?))
            }
        }
    }

    async fn sandbox_running(&self) -> bool {
        let sandbox = Arc::clone(&self.sandbox);
        tokio::task::spawn_blocking(move || sandbox.is_running())
            .await
            .unwrap_or(false)
    }

    /// Mandatory sandbox that is not up: refuse rather than run on the host.
    async fn sandbox_refusal(&self) -> Option<Reply> {
        if !self.sandbox.is_enabled() || self.sandbox_running().await {
            return None;
        }
        tracing::warn!("refusing dispatch: sandbox is enabled but not running");
        Some(Reply::Notice(
            "Sandbox mode is enabled but the sandbox is not running. Start it with :sandbox-start (nothing was run on the host)."
                .to_string(),
        ))
    }

    async fn run_tool(&self, name: &str, payload: &str, interactive: bool) -> Result<Reply> {
        if name.is_empty() {
            return Ok(Reply::Notice("Usage: !!<tool> [payload]".to_string()));
        }
        if self.tools.get(name).is_none() {
            let mut names = self.tools.tool_names();
            names.sort();
            return Ok(Reply::Notice(format!(
                "Unknown tool: {name}. Available tools: {}",
                names.join(", ")
            )));
        }

        let input = parse_payload(payload);
        let id = if self.sandbox.is_enabled() {
            self.schedule_in_sandbox(name, input)?
        } else {
            self.tools.schedule(&self.tasks, name, input, &self.tool_ctx)?
        };
        tracing::info!(task_id = %id, tool = name, sandboxed = self.sandbox.is_enabled(), "tool scheduled");

        if !interactive {
            return Ok(Reply::Task { id, result: None });
        }
        let spinner = Spinner::start(&format!("running {name}"));
        let result = self.tasks.wait_for_result(&id, None).await;
        spinner.finish();
        Ok(Reply::Task { id, result })
    }

    /// Wraps a sandbox dispatch in a local task so it is tracked, waitable
    /// and cancellable like any other.
    fn schedule_in_sandbox(&self, name: &str, input: Value) -> Result<String> {
        let spec = TaskSpec::new(name.to_ascii_lowercase(), input.clone()).with_return_id(new_task_id());
        let sandbox = Arc::clone(&self.sandbox);
        self.tasks.create_task(
            format!("sandbox:{}", spec.name),
            Work::future(move || async move {
                match sandbox.dispatch_task(&spec, true).await? {
                    DispatchOutcome::Completed(result) => result.into_value(),
                    DispatchOutcome::Dispatched { request } => {
                        Ok(json!({"dispatched": true, "request": request}))
                    }
                }
            }),
            input,
        )
    }

    async fn run_shell(&self, command: &str) -> Result<Reply> {
        if command.is_empty() {
            return Ok(Reply::Notice("Usage: !<shell command>".to_string()));
        }

        if is_interactive_program(command) {
            let status = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .current_dir(self.layout.root())
                .status()
                .await?;
            return Ok(if status.success() {
                Reply::Silent
            } else {
                Reply::Notice(format!("{command}: {status}"))
            });
        }

        let output = shell::run(command, &self.tool_ctx, self.tool_ctx.timeout).await;
        Ok(render_shell_output(&output.into_result()))
    }
}

fn render_shell_output(output: &Result<Value>) -> Reply {
    let data = match output {
        Ok(data) => data,
        Err(e) => return Reply::Notice(format!("{e:#}")),
    };
    let text = |key: &str| data.get(key).and_then(Value::as_str).unwrap_or("");
    let mut rendered = String::from(text("stdout"));
    let stderr = text("stderr");
    if !stderr.is_empty() {
        if !rendered.is_empty() && !rendered.ends_with('\n') {
            rendered.push('\n');
        }
        rendered.push_str(stderr);
    }
    match data.get("exit_code").and_then(Value::as_i64) {
        Some(0) | None => Reply::Text(rendered),
        Some(code) => {
            if !rendered.is_empty() && !rendered.ends_with('\n') {
                rendered.push('\n');
            }
            rendered.push_str(&format!("[exit {code}]"));
            Reply::Notice(rendered)
        }
    }
}

/// Busy indicator on stderr; hidden when stderr is not a terminal.
struct Spinner(ProgressBar);

impl Spinner {
    fn start(message: &str) -> Self {
        let bar = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner} {msg} {elapsed}") {
            bar.set_style(style);
        }
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self(bar)
    }

    fn finish(self) {
        self.0.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::Ordering;

    use tempfile::TempDir;

    use super::*;
    use crate::config::SandboxConfig;
    use crate::rpc;
    use crate::sandbox::testing::ScriptedRuntime;
    use crate::tasks::{TaskStatus, TaskStore};

    struct Fixture {
        _temp: TempDir,
        runtime: Arc<ScriptedRuntime>,
        dispatcher: Dispatcher,
    }

    fn fixture(sandbox_enabled: bool, runtime: Arc<ScriptedRuntime>) -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("project");
        fs::create_dir_all(&root).unwrap();
        let layout = ProjectLayout::discover(&root).unwrap();
        layout.ensure().unwrap();
        let program = temp.path().join("kiln-program");
        fs::write(&program, b"#!/bin/sh\n").unwrap();
        let mut config = Config::default();
        config.sandbox = SandboxConfig {
            enabled: sandbox_enabled,
            program_path: Some(program),
            ..SandboxConfig::default()
        };

        let tasks = Arc::new(TaskManager::new(TaskStore::new(layout.tasks_dir()), 2));
        let sandbox = Arc::new(Sandbox::with_runtime(
            layout.clone(),
            config.sandbox.clone(),
            "s1",
            runtime.clone(),
        ).with_packages_dir(temp.path().join("packages")));
        let dispatcher = Dispatcher::new(layout, config, tasks, ToolRegistry::builtins(), sandbox);
        Fixture {
            _temp: temp,
            runtime,
            dispatcher,
        }
    }

    #[test]
    fn test_parse_priority() {
        assert_eq!(Instruction::parse("   "), Instruction::Empty);
        assert_eq!(
            Instruction::parse(":tasks --all"),
            Instruction::Command {
                name: "tasks",
                args: "--all"
            }
        );
        assert_eq!(
            Instruction::parse("!!shell echo hi"),
            Instruction::Tool {
                name: "shell",
                payload: "echo hi"
            }
        );
        assert_eq!(Instruction::parse("!ls -la"), Instruction::Shell("ls -la"));
        assert_eq!(Instruction::parse("what is this?"), Instruction::Prompt("what is this?"));
        assert_eq!(
            Instruction::parse(":!!x"),
            Instruction::Command {
                name: "!!x",
                args: ""
            }
        );
    }

    #[test]
    fn test_payload_json_or_string() {
        assert_eq!(parse_payload(r#"{"command":"ls"}"#), json!({"command": "ls"}));
        assert_eq!(parse_payload("echo hi"), json!("echo hi"));
        assert_eq!(parse_payload(""), Value::Null);
    }

    #[test]
    fn test_interactive_programs_detected_by_basename() {
        assert!(is_interactive_program("vim notes.md"));
        assert!(is_interactive_program("/usr/bin/less README"));
        assert!(!is_interactive_program("ls -la"));
        assert!(!is_interactive_program("vimdiff a b"));
    }

    #[tokio::test]
    async fn test_tool_runs_locally_and_waits() {
        let fx = fixture(false, ScriptedRuntime::new());
        let reply = fx
            .dispatcher
            .dispatch(r#"!!shell {"command": "echo hi"}"#, true)
            .await
            .unwrap();

        let Reply::Task { id, result } = reply else {
            panic!("expected a task reply, got {reply:?}");
        };
        let result = result.unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
        assert!(result.output.unwrap()["stdout"].as_str().unwrap().contains("hi"));
        assert!(fx.dispatcher.tasks().get_task(&id).is_some());
        assert!(fx.runtime.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_interactive_tool_returns_task_id() {
        let fx = fixture(false, ScriptedRuntime::new());
        let reply = fx.dispatcher.dispatch("!!echo hello", false).await.unwrap();
        let Reply::Task { id, result: None } = reply else {
            panic!("expected an unwaited task, got {reply:?}");
        };
        let result = fx
            .dispatcher
            .tasks()
            .wait_for_result(&id, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(result.output, Some(json!("hello")));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_reported() {
        let fx = fixture(false, ScriptedRuntime::new());
        let reply = fx.dispatcher.dispatch("!!nope x", true).await.unwrap();
        assert_eq!(
            reply,
            Reply::Notice("Unknown tool: nope. Available tools: echo, shell".to_string())
        );
    }

    #[tokio::test]
    async fn test_mandatory_sandbox_not_running_refuses() {
        let fx = fixture(true, ScriptedRuntime::new());
        let marker = fx.dispatcher.layout().root().join("touched");
        let line = format!("!!shell touch {}", marker.display());

        let reply = fx.dispatcher.dispatch(&line, true).await.unwrap();
        assert!(matches!(reply, Reply::Notice(ref msg) if msg.contains("not running")));
        assert!(!marker.exists());
        assert!(fx.dispatcher.tasks().list_tasks().is_empty());

        let prompt = fx.dispatcher.dispatch("hello there", true).await.unwrap();
        assert!(matches!(prompt, Reply::Notice(_)));
    }

    #[tokio::test]
    async fn test_raw_shell_bypasses_sandbox_and_tasks() {
        let fx = fixture(true, ScriptedRuntime::new());
        let reply = fx.dispatcher.dispatch("!echo from-host", true).await.unwrap();
        assert_eq!(reply, Reply::Text("from-host\n".to_string()));
        assert!(fx.dispatcher.tasks().list_tasks().is_empty());

        let failed = fx.dispatcher.dispatch("!exit 4", true).await.unwrap();
        assert_eq!(failed, Reply::Notice("[exit 4]".to_string()));
    }

    #[tokio::test]
    async fn test_running_sandbox_receives_tool_calls() {
        let runtime = ScriptedRuntime::running();
        let fx = fixture(true, runtime.clone());
        let rpc_dir = fx.dispatcher.layout().rpc_dir();
        runtime.on_exec(move |args| {
            let stem = args
                .last()
                .unwrap()
                .rsplit('/')
                .next()
                .unwrap()
                .trim_end_matches(".json")
                .to_string();
            let spec: TaskSpec =
                serde_json::from_slice(&fs::read(rpc_dir.join(format!("{stem}.json"))).unwrap())
                    .unwrap();
            rpc::write_response(&rpc_dir, &spec, &TaskResult::completed(spec.input.clone()))
                .unwrap();
        });

        let reply = fx.dispatcher.dispatch("!!echo boxed", true).await.unwrap();
        let Reply::Task { result, .. } = reply else {
            panic!("expected a task reply, got {reply:?}");
        };
        assert_eq!(result.unwrap().output, Some(json!("boxed")));
        assert_eq!(runtime.count("exec"), 1);
        assert!(runtime.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_prompt_goes_to_conversation() {
        struct Upper;
        impl Conversation for Upper {
            fn respond<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String>> {
                Box::pin(async move { Ok(prompt.to_uppercase()) })
            }
        }

        let fx = fixture(false, ScriptedRuntime::new());
        let dispatcher = fx.dispatcher.with_conversation(Box::new(Upper));
        assert_eq!(
            dispatcher.dispatch("hello", true).await.unwrap(),
            Reply::Text("HELLO".to_string())
        );
    }
}
