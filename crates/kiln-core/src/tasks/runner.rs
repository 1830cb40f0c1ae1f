//! Runs one task spec file through the tool registry.
//!
//! This is the responder side of the RPC protocol: inside the sandbox,
//! `kiln run-task <path>` loads the task spec, runs the named tool and always
//! leaves a `<return_id|id>.result.json` next to the task spec.

use std::path::Path;
use std::panic::AssertUnwindSafe;

use anyhow::Result;
use chrono::Utc;
use futures_util::FutureExt;

use super::hooks::panic_message;
use super::model::{TaskResult, TaskSpec, load_spec_file, new_task_id};
use crate::rpc;
use crate::tools::{ToolContext, ToolRegistry};

/// Executes the task spec at `path` and writes its result next to it.
///
/// Tool failures, unknown tools and panics are recorded as a failed
/// result and returned as `Ok`.
///
/// # Errors
/// Returns an error if the task spec cannot be read (a failed result keyed by
/// the file name is still written) or the result cannot be written.
pub async fn run_task_file(
    path: &Path,
    registry: &ToolRegistry,
    ctx: &ToolContext,
) -> Result<TaskResult> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let spec = match load_spec_file(path) {
        Ok(spec) => spec,
        Err(e) => {
            if let Some(key) = path.file_stem().and_then(|s| s.to_str()) {
                let response = dir.join(format!("{key}{}", rpc::RESPONSE_SUFFIX));
                rpc::write_json_atomic(&response, &TaskResult::failed(format!("{e:#}")))?;
            }
            return Err(e);
        }
    };

    let mut spec = rekey(spec);
    spec.start_time = Some(Utc::now());
    tracing::info!(task_id = %spec.id, name = %spec.name, "running task from file");

    let result = run_spec(&spec, registry, ctx).await;
    spec.end_time = Some(Utc::now());
    rpc::write_response(dir, &spec, &result)?;
    tracing::info!(task_id = %spec.id, status = %result.status, "task result written");
    Ok(result)
}

/// Gives the task spec a fresh runtime id while keeping the requester's key.
fn rekey(mut spec: TaskSpec) -> TaskSpec {
    if spec.return_id.is_none() {
        spec.return_id = Some(spec.id.clone());
    }
    spec.id = new_task_id();
    spec
}

async fn run_spec(spec: &TaskSpec, registry: &ToolRegistry, ctx: &ToolContext) -> TaskResult {
    let Some(handler) = registry.get(&spec.name) else {
        return TaskResult::failed(format!("Tool '{}' not found", spec.name));
    };
    match AssertUnwindSafe(handler(&spec.input, ctx)).catch_unwind().await {
        Ok(output) => match output.into_result() {
            Ok(value) => TaskResult::completed(value),
            Err(e) => TaskResult::failed(format!("{e:#}")),
        },
        Err(panic) => TaskResult::failed(format!(
            "tool '{}' panicked: {}",
            spec.name,
            panic_message(panic.as_ref())
        )),
    }
}
