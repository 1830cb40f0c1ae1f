//! Task specs, results, and their on-disk store.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::rpc;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("No task matches '{0}'")]
    UnknownTask(String),
    #[error("'{prefix}' is ambiguous ({count} tasks match)")]
    Ambiguous { prefix: String, count: usize },
    #[error("failed to persist {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Serializable description of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub return_id: Option<String>,
    /// When the work began running, after any wait for a concurrency slot.
    /// Unset while the task is queued.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    /// When the terminal result was recorded.
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl TaskSpec {
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            id: new_task_id(),
            name: name.into(),
            input,
            return_id: None,
            start_time: None,
            end_time: None,
        }
    }

    #[must_use]
    pub fn with_return_id(mut self, return_id: impl Into<String>) -> Self {
        self.return_id = Some(return_id.into());
        self
    }

    /// Key naming both the request and the response file.
    pub fn correlation_key(&self) -> &str {
        self.return_id.as_deref().unwrap_or(&self.id)
    }
}

pub fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}

/// Outcome of a task. Always carries a status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub status: TaskStatus,
}

impl TaskResult {
    pub fn completed(output: Value) -> Self {
        Self {
            output: Some(output),
            error: None,
            status: TaskStatus::Completed,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            output: None,
            error: Some(error.into()),
            status: TaskStatus::Failed,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            output: None,
            error: Some("Task was cancelled".to_string()),
            status: TaskStatus::Cancelled,
        }
    }

    /// The completed output, or the recorded error.
    ///
    /// # Errors
    /// Returns the error message of a failed or cancelled result.
    pub fn into_value(self) -> Result<Value> {
        match self.status {
            TaskStatus::Completed => Ok(self.output.unwrap_or(Value::Null)),
            status => Err(anyhow::anyhow!(
                self.error.unwrap_or_else(|| format!("task {status}"))
            )),
        }
    }

    /// One-line rendering of the output or error.
    pub fn summary(&self) -> String {
        match (&self.output, &self.error) {
            (_, Some(error)) => error.clone(),
            (Some(Value::String(s)), None) => s.clone(),
            (Some(value), None) => value.to_string(),
            (None, None) => String::new(),
        }
    }
}

/// Snapshot of an in-memory task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub spec: TaskSpec,
    pub status: TaskStatus,
    pub result: Option<TaskResult>,
}

impl TaskInfo {
    /// Wall-clock duration once both timestamps are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.spec.end_time? - self.spec.start_time?)
    }
}

/// Directory of persisted task specs and results.
#[derive(Debug, Clone)]
pub struct TaskStore {
    dir: PathBuf,
}

impl TaskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn spec_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}{}", rpc::REQUEST_SUFFIX))
    }

    pub fn result_path(&self, spec: &TaskSpec) -> PathBuf {
        rpc::response_path(&self.dir, spec)
    }

    /// # Errors
    /// Returns an error if the task spec cannot be written.
    pub fn save_spec(&self, spec: &TaskSpec) -> Result<PathBuf, TaskError> {
        let path = self.spec_path(&spec.id);
        match rpc::write_json_atomic(&path, spec) {
            Ok(()) => Ok(path),
            Err(e) => Err(TaskError::Persist {
                path,
                source: e.into(),
            }),
        }
    }

    /// # Errors
    /// Returns an error if the result cannot be written.
    pub fn save_result(&self, spec: &TaskSpec, result: &TaskResult) -> Result<PathBuf, TaskError> {
        rpc::write_response(&self.dir, spec, result).map_err(|e| TaskError::Persist {
            path: self.result_path(spec),
            source: e.into(),
        })
    }

    /// # Errors
    /// Returns an error if the task spec is missing or malformed.
    pub fn load_spec(&self, id: &str) -> Result<TaskSpec> {
        load_spec_file(&self.spec_path(id))
    }

    /// Loads the result for `spec`, or `None` if none was written yet.
    ///
    /// # Errors
    /// Returns an error if the result file exists but is malformed.
    pub fn load_result(&self, spec: &TaskSpec) -> Result<Option<TaskResult>> {
        let path = self.result_path(spec);
        if !path.exists() {
            return Ok(None);
        }
        rpc::read_response(&path).map(Some)
    }

    /// Lists persisted specs, newest first. Unreadable files are skipped.
    ///
    /// # Errors
    /// Returns an error if the directory exists but cannot be read.
    pub fn list_specs(&self) -> Result<Vec<TaskSpec>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("read tasks directory {}", self.dir.display()))?;

        let mut specs: Vec<TaskSpec> = entries
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| is_spec_file(path))
            .filter_map(|path| load_spec_file(&path).ok())
            .collect();
        specs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(specs)
    }

    /// Persisted tasks paired with their results, newest first.
    ///
    /// # Errors
    /// Returns an error if the directory exists but cannot be read.
    pub fn list_infos(&self) -> Result<Vec<TaskInfo>> {
        Ok(self
            .list_specs()?
            .into_iter()
            .map(|spec| {
                let result = self.load_result(&spec).ok().flatten();
                let status = result.as_ref().map_or(TaskStatus::Pending, |r| r.status);
                TaskInfo {
                    spec,
                    status,
                    result,
                }
            })
            .collect())
    }

    /// Finds a persisted spec whose id starts with `prefix`.
    ///
    /// # Errors
    /// Returns an error if the prefix is ambiguous or matches nothing.
    pub fn find_spec(&self, prefix: &str) -> Result<TaskSpec> {
        let mut matches: Vec<TaskSpec> = self
            .list_specs()?
            .into_iter()
            .filter(|spec| spec.id.starts_with(prefix))
            .collect();
        match matches.len() {
            0 => Err(TaskError::UnknownTask(prefix.to_string()).into()),
            1 => Ok(matches.remove(0)),
            count => Err(TaskError::Ambiguous {
                prefix: prefix.to_string(),
                count,
            }
            .into()),
        }
    }
}

fn is_spec_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(rpc::REQUEST_SUFFIX) && !name.ends_with(rpc::RESPONSE_SUFFIX)
}

/// Reads a spec file from any location.
///
/// # Errors
/// Returns an error if the file is missing or malformed.
pub fn load_spec_file(path: &Path) -> Result<TaskSpec> {
    let bytes = fs::read(path).with_context(|| format!("read task spec {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse task spec {}", path.display()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_status_serializes_lowercase() {
        let value = serde_json::to_value(TaskStatus::Cancelled).unwrap();
        assert_eq!(value, json!("cancelled"));
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn test_spec_file_layout() {
        let spec = TaskSpec::new("shell", json!({"command": "ls"})).with_return_id("r1");
        let value = serde_json::to_value(&spec).unwrap();
        for key in ["id", "name", "input", "return_id", "start_time", "end_time"] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
        assert_eq!(spec.correlation_key(), "r1");
    }

    #[test]
    fn test_result_file_layout() {
        let value = serde_json::to_value(TaskResult::failed("boom")).unwrap();
        assert_eq!(
            value,
            json!({"output": null, "error": "boom", "status": "failed"})
        );
    }

    #[test]
    fn test_store_saves_spec_by_id_and_result_by_return_id() {
        let temp = TempDir::new().unwrap();
        let store = TaskStore::new(temp.path());
        let spec = TaskSpec::new("echo", json!("x")).with_return_id("ret");

        let spec_path = store.save_spec(&spec).unwrap();
        assert_eq!(spec_path, temp.path().join(format!("{}.json", spec.id)));
        assert!(store.load_result(&spec).unwrap().is_none());

        let result_path = store
            .save_result(&spec, &TaskResult::completed(json!("x")))
            .unwrap();
        assert_eq!(result_path, temp.path().join("ret.result.json"));
        assert_eq!(store.load_spec(&spec.id).unwrap(), spec);
        assert_eq!(
            store.load_result(&spec).unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[test]
    fn test_list_specs_skips_results_and_sorts_newest_first() {
        let temp = TempDir::new().unwrap();
        let store = TaskStore::new(temp.path());

        let mut older = TaskSpec::new("a", json!(null));
        older.start_time = Some(Utc::now() - chrono::Duration::seconds(10));
        let mut newer = TaskSpec::new("b", json!(null));
        newer.start_time = Some(Utc::now());
        store.save_spec(&older).unwrap();
        store.save_spec(&newer).unwrap();
        store
            .save_result(&older, &TaskResult::completed(json!(1)))
            .unwrap();
        fs::write(temp.path().join("garbage.json"), "not json").unwrap();

        let specs = store.list_specs().unwrap();
        let names: Vec<_> = specs.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn test_find_spec_by_prefix() {
        let temp = TempDir::new().unwrap();
        let store = TaskStore::new(temp.path());
        let spec = TaskSpec::new("a", json!(null));
        store.save_spec(&spec).unwrap();

        assert_eq!(store.find_spec(&spec.id[..8]).unwrap().id, spec.id);
        let err = store.find_spec("zzzz-not-an-id").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TaskError>(),
            Some(TaskError::UnknownTask(_))
        ));
    }

    #[test]
    fn test_summary_prefers_error() {
        assert_eq!(TaskResult::failed("bad").summary(), "bad");
        assert_eq!(TaskResult::completed(json!("ok")).summary(), "ok");
        assert_eq!(TaskResult::completed(json!({"n": 1})).summary(), r#"{"n":1}"#);
    }

    #[test]
    fn test_list_infos_pairs_results() {
        let temp = TempDir::new().unwrap();
        let store = TaskStore::new(temp.path());
        let done = TaskSpec::new("done", json!(null));
        let waiting = TaskSpec::new("waiting", json!(null));
        store.save_spec(&done).unwrap();
        store.save_spec(&waiting).unwrap();
        store.save_result(&done, &TaskResult::failed("nope")).unwrap();

        let infos = store.list_infos().unwrap();
        let by_name = |name: &str| infos.iter().find(|i| i.spec.name == name).unwrap();
        assert_eq!(by_name("done").status, TaskStatus::Failed);
        assert_eq!(by_name("waiting").status, TaskStatus::Pending);
        assert!(by_name("waiting").result.is_none());
    }

    #[test]
    fn test_into_value() {
        assert_eq!(TaskResult::completed(json!(3)).into_value().unwrap(), json!(3));
        let err = TaskResult::cancelled().into_value().unwrap_err();
        assert_eq!(err.to_string(), "Task was cancelled");
    }
}
