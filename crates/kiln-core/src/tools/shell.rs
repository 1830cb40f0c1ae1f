//! Shell tool: runs `sh -c <command>` in the project root.
//!
//! Input is either `{"command": "..."}` or a bare JSON string.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};

use super::{ToolContext, ToolDefinition, ToolOutput};

/// Maximum bytes per output stream kept inline.
const MAX_OUTPUT_BYTES: usize = 40 * 1024;

pub fn definition() -> ToolDefinition {
    ToolDefinition {
        name: "shell".to_string(),
        description: "Run a shell command in the project root. Returns stdout, stderr, \
            exit code and whether the command timed out."
            .to_string(),
        input_schema: json!({
            "type": ["object", "string"],
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        }),
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ShellInput {
    Bare(String),
    Object { command: String },
}

impl ShellInput {
    fn into_command(self) -> String {
        match self {
            ShellInput::Bare(command) | ShellInput::Object { command } => command,
        }
    }
}

/// One captured stream.
#[derive(Debug)]
struct Captured {
    text: String,
    truncated: bool,
    total_bytes: usize,
    spill_file: Option<PathBuf>,
}

impl Captured {
    fn new(bytes: &[u8], spill_dir: &Path, stream: &str) -> Self {
        let (text, truncated) = truncate_utf8(bytes, MAX_OUTPUT_BYTES);
        let spill_file = truncated
            .then(|| spill(bytes, spill_dir, stream))
            .flatten();
        Self {
            text,
            truncated,
            total_bytes: bytes.len(),
            spill_file,
        }
    }

    fn empty() -> Self {
        Self {
            text: String::new(),
            truncated: false,
            total_bytes: 0,
            spill_file: None,
        }
    }
}

/// Keeps at most `max_bytes` of `bytes`, cut on a character boundary.
fn truncate_utf8(bytes: &[u8], max_bytes: usize) -> (String, bool) {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= max_bytes {
        return (text.into_owned(), false);
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    (text[..end].to_string(), true)
}

/// Saves the full stream next to the project's run files so callers can
/// page through it later.
fn spill(bytes: &[u8], dir: &Path, stream: &str) -> Option<PathBuf> {
    let path = dir.join(format!("shell-{}-{stream}.txt", uuid::Uuid::new_v4().simple()));
    crate::rpc::write_bytes_atomic(&path, bytes)
        .inspect_err(|e| tracing::warn!(error = %e, "could not save full shell output"))
        .ok()?;
    Some(path)
}

fn output_dir(ctx: &ToolContext) -> PathBuf {
    crate::core::project::ProjectLayout::new(&ctx.root)
        .state_dir()
        .join("run")
        .join("output")
}

/// Executes the shell tool and returns a structured envelope.
pub async fn execute(input: &Value, ctx: &ToolContext, timeout: Option<Duration>) -> ToolOutput {
    match ShellInput::deserialize(input) {
        Ok(input) => run(&input.into_command(), ctx, timeout).await,
        Err(e) => ToolOutput::failure(
            "invalid_input",
            format!("Invalid input for shell tool: {e}"),
            None,
        ),
    }
}

/// Runs `command` directly.
pub async fn run(command: &str, ctx: &ToolContext, timeout: Option<Duration>) -> ToolOutput {
    if command.trim().is_empty() {
        return ToolOutput::failure("invalid_input", "command cannot be empty", None);
    }

    let child = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(&ctx.root)
        .env("TERM", "dumb")
        .env("NO_COLOR", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => {
            return ToolOutput::failure(
                "spawn_error",
                format!("Failed to execute command '{command}'"),
                Some(format!("Error: {e}")),
            );
        }
    };

    let waited = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
            Ok(output) => output,
            Err(_) => {
                let stderr = Captured {
                    text: format!("Command timed out after {} seconds", limit.as_secs_f32()),
                    ..Captured::empty()
                };
                return envelope(Captured::empty(), stderr, -1, true);
            }
        },
        None => child.wait_with_output().await,
    };

    match waited {
        Ok(output) => {
            let dir = output_dir(ctx);
            envelope(
                Captured::new(&output.stdout, &dir, "stdout"),
                Captured::new(&output.stderr, &dir, "stderr"),
                output.status.code().unwrap_or(-1),
                false,
            )
        }
        Err(e) => ToolOutput::failure(
            "exec_error",
            format!("Failed to execute command '{command}'"),
            Some(format!("Error: {e}")),
        ),
    }
}

fn envelope(stdout: Captured, stderr: Captured, exit_code: i32, timed_out: bool) -> ToolOutput {
    let mut data = json!({
        "stdout": stdout.text,
        "stderr": stderr.text,
        "exit_code": exit_code,
        "timed_out": timed_out,
        "stdout_truncated": stdout.truncated,
        "stderr_truncated": stderr.truncated,
        "stdout_total_bytes": stdout.total_bytes,
        "stderr_total_bytes": stderr.total_bytes,
    });
    if let Some(path) = stdout.spill_file {
        data["stdout_file"] = json!(path);
    }
    if let Some(path) = stderr.spill_file {
        data["stderr_file"] = json!(path);
    }
    ToolOutput::success(data)
}
