//! Task command handlers (persisted specs and results).

use anyhow::{Context, Result};
use kiln_core::dispatch::commands::render_task_table;
use serde_json::json;

use super::Project;

const RECENT: usize = 10;

pub fn list(project: &Project, all: bool) -> Result<()> {
    let mut infos = project.task_store().list_infos().context("list tasks")?;
    if infos.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }
    infos.sort_by(|a, b| b.spec.start_time.cmp(&a.spec.start_time));
    if !all {
        infos.truncate(RECENT);
    }
    println!("{}", render_task_table(&infos));
    Ok(())
}

pub fn show(project: &Project, id: &str) -> Result<()> {
    let store = project.task_store();
    let spec = store.find_spec(id)?;
    let result = store
        .load_result(&spec)
        .with_context(|| format!("load result for '{}'", spec.id))?;
    let value = json!({
        "spec": spec,
        "result": result,
    });
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
