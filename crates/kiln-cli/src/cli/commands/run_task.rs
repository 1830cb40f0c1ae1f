//! `kiln run-task`: the entrypoint the sandbox invokes for each request.

use std::path::Path;

use anyhow::{Context, Result};
use kiln_core::tasks::runner::run_task_file;

use super::Project;

pub async fn run(project: &Project, path: &Path) -> Result<()> {
    let path = if path.is_relative() {
        project.layout.root().join(path)
    } else {
        path.to_path_buf()
    };
    let result = run_task_file(&path, &project.tools(), &project.tool_context())
        .await
        .with_context(|| format!("run task {}", path.display()))?;
    println!("{}", serde_json::to_string(&result)?);
    Ok(())
}
