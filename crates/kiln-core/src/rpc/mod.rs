//! Filesystem request/response protocol.
//!
//! A requester writes `<key>.json` into a shared directory and the
//! responder eventually writes `<key>.result.json` next to it, where
//! `key` is the task's return id (falling back to its id). Every write
//! goes through a temp file in the same directory followed by a rename,
//! so a reader sees either nothing or a complete document. The two sides
//! never need to be alive at the same time.

pub mod watcher;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::tasks::model::{TaskResult, TaskSpec};

pub use watcher::ResultWatcher;

pub const REQUEST_SUFFIX: &str = ".json";
pub const RESPONSE_SUFFIX: &str = ".result.json";

/// Writes `bytes` to `path` atomically (temp file + fsync + rename).
///
/// # Errors
/// Returns an error if the directory cannot be created or the file cannot
/// be written or renamed into place.
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".tmp-")
        .suffix(".part")
        .tempfile_in(dir)
        .with_context(|| format!("create temp file in {}", dir.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("write temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("sync temp file for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("rename temp file to {}", path.display()))?;
    Ok(())
}

/// Serializes `value` as pretty JSON and writes it atomically.
///
/// # Errors
/// Returns an error if serialization or the atomic write fails.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    write_bytes_atomic(path, &bytes)
}

/// Canonical request path for `spec` inside `dir`.
pub fn request_path(dir: &Path, spec: &TaskSpec) -> PathBuf {
    dir.join(format!("{}{REQUEST_SUFFIX}", spec.correlation_key()))
}

/// Canonical response path for `spec` inside `dir`.
pub fn response_path(dir: &Path, spec: &TaskSpec) -> PathBuf {
    dir.join(format!("{}{RESPONSE_SUFFIX}", spec.correlation_key()))
}

/// Publishes a request file for `spec` and returns its path.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_request(dir: &Path, spec: &TaskSpec) -> Result<PathBuf> {
    let path = request_path(dir, spec);
    write_json_atomic(&path, spec)?;
    Ok(path)
}

/// Publishes the response for `spec` next to its request and returns its path.
///
/// Concurrent writers sharing a return id overwrite each other; the last
/// rename wins.
///
/// # Errors
/// Returns an error if the file cannot be written.
pub fn write_response(dir: &Path, spec: &TaskSpec, result: &TaskResult) -> Result<PathBuf> {
    let path = response_path(dir, spec);
    write_json_atomic(&path, result)?;
    Ok(path)
}

/// Reads a response file.
///
/// # Errors
/// Returns an error if the file is missing or is not a valid result.
pub fn read_response(path: &Path) -> Result<TaskResult> {
    let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse result {}", path.display()))
}
