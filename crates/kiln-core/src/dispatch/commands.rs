//! Management commands (`:name args`).

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use comfy_table::{ContentArrangement, Table};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};

use super::{Dispatcher, Reply};
use crate::rpc;
use crate::sandbox::{BuildOutcome, Sandbox, StartOutcome};
use crate::tasks::runner::run_task_file;
use crate::tasks::{TaskInfo, TaskStatus};

const DEFAULT_TASK_ROWS: usize = 10;
const DEFAULT_LOG_LINES: usize = 120;

type Handler = for<'a> fn(&'a Dispatcher, &'a str) -> BoxFuture<'a, Result<Reply>>;

pub struct Command {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub usage: &'static str,
    pub summary: &'static str,
    handler: Handler,
}

pub static COMMANDS: &[Command] = &[
    Command {
        name: "help",
        aliases: &[],
        usage: ":help",
        summary: "Show this list",
        handler: help,
    },
    Command {
        name: "exit",
        aliases: &["quit"],
        usage: ":exit",
        summary: "Leave the session",
        handler: exit,
    },
    Command {
        name: "root",
        aliases: &[],
        usage: ":root",
        summary: "Print the project root",
        handler: root,
    },
    Command {
        name: "tools",
        aliases: &[],
        usage: ":tools",
        summary: "List enabled tools",
        handler: tools,
    },
    Command {
        name: "tasks",
        aliases: &[],
        usage: ":tasks [--all|<id-prefix>]",
        summary: "Recent tasks, all tasks, or one task",
        handler: tasks,
    },
    Command {
        name: "task-get",
        aliases: &[],
        usage: ":task-get <id>",
        summary: "Full spec, status and result of a task",
        handler: task_get,
    },
    Command {
        name: "task-result",
        aliases: &[],
        usage: ":task-result <id>",
        summary: "Result file of a task, as written on disk",
        handler: task_result,
    },
    Command {
        name: "task-run",
        aliases: &[],
        usage: ":task-run <spec-file>",
        summary: "Run a saved task spec file",
        handler: task_run,
    },
    Command {
        name: "task-cancel",
        aliases: &[],
        usage: ":task-cancel <id|--all>",
        summary: "Request cancellation of tasks",
        handler: task_cancel,
    },
    Command {
        name: "sandbox",
        aliases: &[],
        usage: ":sandbox",
        summary: "Sandbox state and container",
        handler: sandbox_info,
    },
    Command {
        name: "sandbox-start",
        aliases: &[],
        usage: ":sandbox-start [--force]",
        summary: "Build if needed and start the sandbox",
        handler: sandbox_start,
    },
    Command {
        name: "sandbox-stop",
        aliases: &[],
        usage: ":sandbox-stop",
        summary: "Stop the sandbox",
        handler: sandbox_stop,
    },
    Command {
        name: "sandbox-restart",
        aliases: &[],
        usage: ":sandbox-restart",
        summary: "Stop, then start the sandbox",
        handler: sandbox_restart,
    },
    Command {
        name: "sandbox-logs",
        aliases: &[],
        usage: ":sandbox-logs [n]",
        summary: "Last n lines of container output",
        handler: sandbox_logs,
    },
    Command {
        name: "sandbox-build",
        aliases: &[],
        usage: ":sandbox-build [--force]",
        summary: "Build the sandbox image",
        handler: sandbox_build,
    },
];

/// Looks a command up by exact name or alias.
pub fn find(name: &str) -> Option<&'static Command> {
    COMMANDS
        .iter()
        .find(|c| c.name == name || c.aliases.contains(&name))
}

pub(super) async fn run(dispatcher: &Dispatcher, name: &str, args: &str) -> Result<Reply> {
    match find(name) {
        Some(command) => (command.handler)(dispatcher, args).await,
        None => Ok(Reply::Notice(format!(
            "Unknown command ':{name}'. Type :help for the list."
        ))),
    }
}

fn help<'a>(_d: &'a Dispatcher, _args: &'a str) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async {
        let mut table = Table::new();
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Command", "Description"]);
        for command in COMMANDS {
            table.add_row(vec![command.usage, command.summary]);
        }
        let mut text = table.to_string();
        text.push_str("\n!!<tool> <payload>   run a tool as a task\n!<command>           run a host shell command");
        Ok(Reply::Text(text))
    })
}

fn exit<'a>(_d: &'a Dispatcher, _args: &'a str) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async { Ok(Reply::Exit) })
}

fn root<'a>(d: &'a Dispatcher, _args: &'a str) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move { Ok(Reply::Text(d.layout().root().display().to_string())) })
}

fn tools<'a>(d: &'a Dispatcher, _args: &'a str) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        let mut table = Table::new();
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec!["Tool", "Description"]);
        for tool in d.tools().definitions() {
            table.add_row(vec![tool.name.as_str(), tool.description.as_str()]);
        }
        Ok(Reply::Text(table.to_string()))
    })
}

// ------------------------------------------------------------------- tasks

/// In-memory tasks plus those only found on disk, newest first.
fn known_tasks(d: &Dispatcher) -> Vec<TaskInfo> {
    let mut tasks = d.tasks().list_tasks();
    match d.tasks().store().list_infos() {
        Ok(persisted) => {
            for info in persisted {
                if !tasks.iter().any(|t| t.spec.id == info.spec.id) {
                    tasks.push(info);
                }
            }
        }
        Err(e) => tracing::warn!(error = %format!("{e:#}"), "could not read persisted tasks"),
    }
    tasks.sort_by(|a, b| b.spec.start_time.cmp(&a.spec.start_time));
    tasks
}

fn find_task(d: &Dispatcher, prefix: &str) -> Result<TaskInfo> {
    if let Some(info) = d.tasks().find_task(prefix) {
        return Ok(info);
    }
    let store = d.tasks().store();
    let spec = store.find_spec(prefix)?;
    let result = store.load_result(&spec)?;
    let status = result
        .as_ref()
        .map_or(TaskStatus::Pending, |r| r.status);
    Ok(TaskInfo {
        spec,
        status,
        result,
    })
}

fn tasks<'a>(d: &'a Dispatcher, args: &'a str) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        let mut all = known_tasks(d);
        match args {
            "" => all.truncate(DEFAULT_TASK_ROWS),
            "--all" => {}
            prefix => {
                all.retain(|t| t.spec.id.starts_with(prefix));
                if all.len() == 1 {
                    return Ok(Reply::Text(pretty(&task_json(&all[0]))));
                }
                if all.is_empty() {
                    return Ok(Reply::Notice(format!("No task matches '{prefix}'")));
                }
            }
        }
        if all.is_empty() {
            return Ok(Reply::Notice("No tasks found.".to_string()));
        }
        Ok(Reply::Text(render_task_table(&all)))
    })
}

fn task_get<'a>(d: &'a Dispatcher, args: &'a str) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        if args.is_empty() {
            return Ok(Reply::Notice("Usage: :task-get <id>".to_string()));
        }
        Ok(match find_task(d, args) {
            Ok(info) => Reply::Text(pretty(&task_json(&info))),
            Err(e) => Reply::Notice(format!("{e:#}")),
        })
    })
}

fn task_result<'a>(d: &'a Dispatcher, args: &'a str) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        if args.is_empty() {
            return Ok(Reply::Notice("Usage: :task-result <id>".to_string()));
        }
        // Results are keyed by return id, which may not name any spec here.
        let direct = [d.tasks().store().dir().to_path_buf(), d.layout().rpc_dir()]
            .into_iter()
            .map(|dir| dir.join(format!("{args}{}", rpc::RESPONSE_SUFFIX)))
            .find(|path| path.exists());
        let path = match direct {
            Some(path) => path,
            None => match find_task(d, args) {
                Ok(info) => d.tasks().store().result_path(&info.spec),
                Err(e) => return Ok(Reply::Notice(format!("{e:#}"))),
            },
        };
        Ok(match rpc::read_response(&path) {
            Ok(result) => Reply::Text(pretty(&json!(result))),
            Err(_) if !path.exists() => {
                Reply::Notice(format!("No result yet: {}", path.display()))
            }
            Err(e) => Reply::Notice(format!("{e:#}")),
        })
    })
}

fn task_run<'a>(d: &'a Dispatcher, args: &'a str) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        if args.is_empty() {
            return Ok(Reply::Notice("Usage: :task-run <spec-file>".to_string()));
        }
        let mut path = PathBuf::from(args);
        if path.is_relative() {
            path = d.layout().root().join(path);
        }
        Ok(
            match run_task_file(&path, d.tools(), d.tool_context()).await {
                Ok(result) => Reply::Text(pretty(&json!(result))),
                Err(e) => Reply::Notice(format!("Failed to run task: {e:#}")),
            },
        )
    })
}

fn task_cancel<'a>(d: &'a Dispatcher, args: &'a str) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        if args.is_empty() {
            return Ok(Reply::Notice("Usage: :task-cancel <id|--all>".to_string()));
        }
        if args == "--all" {
            let n = d.tasks().cancel_all();
            return Ok(Reply::Text(format!("Cancellation requested for {n} task(s)")));
        }
        let Some(info) = d.tasks().find_task(args) else {
            return Ok(Reply::Notice(format!("No running task matches '{args}'")));
        };
        Ok(if d.tasks().cancel_task(&info.spec.id) {
            Reply::Text(format!("Cancellation requested for {}", info.spec.id))
        } else {
            Reply::Notice(format!("Task {} already {}", info.spec.id, info.status))
        })
    })
}

/// Renders task snapshots as a table.
pub fn render_task_table(tasks: &[TaskInfo]) -> String {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "ID", "Name", "Status", "Input", "Started", "Ended", "Duration", "Result",
    ]);
    for task in tasks {
        let time = |t: Option<chrono::DateTime<chrono::Utc>>| {
            t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default()
        };
        let duration = task
            .duration()
            .and_then(|d| d.to_std().ok())
            .map(|d| format!("{:.2}s", d.as_secs_f64()))
            .unwrap_or_default();
        table.add_row(vec![
            task.spec.id.chars().take(8).collect::<String>(),
            task.spec.name.clone(),
            task.status.to_string(),
            truncate(&task.spec.input.to_string(), 40),
            time(task.spec.start_time),
            time(task.spec.end_time),
            duration,
            truncate(
                &task.result.as_ref().map(|r| r.summary()).unwrap_or_default(),
                80,
            ),
        ]);
    }
    table.to_string()
}

fn task_json(info: &TaskInfo) -> Value {
    json!({
        "spec": info.spec,
        "status": info.status,
        "result": info.result,
    })
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn truncate(text: &str, max: usize) -> String {
    let single_line = text.replace('\n', " ");
    if single_line.chars().count() <= max {
        return single_line;
    }
    let mut cut: String = single_line.chars().take(max.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

// ----------------------------------------------------------------- sandbox

async fn on_sandbox<T, F>(d: &Dispatcher, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Sandbox) -> T + Send + 'static,
{
    let sandbox = Arc::clone(d.sandbox());
    Ok(tokio::task::spawn_blocking(move || f(&sandbox)).await?)
}

fn sandbox_info<'a>(d: &'a Dispatcher, _args: &'a str) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        let text = on_sandbox(d, |sandbox| {
            let mut text = String::new();
            let _ = writeln!(text, "enabled:   {}", sandbox.is_enabled());
            let _ = writeln!(text, "state:     {}", sandbox.state());
            let _ = writeln!(text, "container: {}", sandbox.container_name());
            let _ = writeln!(text, "image:     {}", sandbox.image_tag());
            let _ = writeln!(text, "session:   {}", sandbox.session_id());
            match sandbox.status() {
                Ok(status) => {
                    let _ = writeln!(text, "status:    {status}");
                }
                Err(e) => {
                    let _ = writeln!(text, "status:    unknown ({e})");
                }
            }
            if let Ok(true) = sandbox.needs_refresh() {
                let _ = writeln!(text, "note:      settings changed since the last build");
            }
            text.trim_end().to_string()
        })
        .await?;
        Ok(Reply::Text(text))
    })
}

fn sandbox_start<'a>(d: &'a Dispatcher, args: &'a str) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        let force = args == "--force";
        on_sandbox(d, move |sandbox| {
            let mut lines = Vec::new();
            if !force && matches!(sandbox.needs_refresh(), Ok(true)) {
                lines.push("Sandbox settings changed; the image will be rebuilt.".to_string());
            }
            match sandbox.start(force) {
                Ok(StartOutcome::AlreadyRunning) => {
                    lines.push(format!("Sandbox already running ({})", sandbox.container_name()));
                    Reply::Text(lines.join("\n"))
                }
                Ok(StartOutcome::Started { container_id }) => {
                    let short: String = container_id.chars().take(12).collect();
                    lines.push(format!("Sandbox started: {short} {}", sandbox.container_name()));
                    Reply::Text(lines.join("\n"))
                }
                Err(e) => Reply::Notice(e.to_string()),
            }
        })
        .await
    })
}

fn sandbox_stop<'a>(d: &'a Dispatcher, _args: &'a str) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        on_sandbox(d, |sandbox| match sandbox.stop() {
            Ok(true) => Reply::Text("Sandbox stopped".to_string()),
            Ok(false) => Reply::Text("Sandbox was not running".to_string()),
            Err(e) => Reply::Notice(e.to_string()),
        })
        .await
    })
}

fn sandbox_restart<'a>(d: &'a Dispatcher, _args: &'a str) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        on_sandbox(d, |sandbox| match sandbox.restart() {
            Ok(_) => Reply::Text(format!("Sandbox restarted ({})", sandbox.container_name())),
            Err(e) => Reply::Notice(e.to_string()),
        })
        .await
    })
}

fn sandbox_logs<'a>(d: &'a Dispatcher, args: &'a str) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        let tail = if args.is_empty() {
            DEFAULT_LOG_LINES
        } else {
            match args.parse() {
                Ok(n) => n,
                Err(_) => return Ok(Reply::Notice("Usage: :sandbox-logs [n]".to_string())),
            }
        };
        on_sandbox(d, move |sandbox| match sandbox.logs(tail) {
            Ok(logs) => Reply::Text(logs),
            Err(e) => Reply::Notice(e.to_string()),
        })
        .await
    })
}

fn sandbox_build<'a>(d: &'a Dispatcher, args: &'a str) -> BoxFuture<'a, Result<Reply>> {
    Box::pin(async move {
        let force = args == "--force";
        on_sandbox(d, move |sandbox| match sandbox.build(force) {
            Ok(BuildOutcome::UpToDate) => Reply::Text("Sandbox image up to date".to_string()),
            Ok(BuildOutcome::Built { stamp }) => Reply::Text(format!(
                "Sandbox image built (settings {}, program {})",
                stamp.settings, stamp.program
            )),
            Err(e) => Reply::Notice(e.to_string()),
        })
        .await
    })
}
