//! Content digests that decide when the sandbox image is stale.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::rpc::write_json_atomic;

pub const BUILD_STAMP_FILE: &str = ".sandbox_state.json";
pub const REFRESH_STAMP_FILE: &str = ".refresh_stamp";

const SHORT_LEN: usize = 12;

/// Everything that forces an image rebuild when it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildStamp {
    pub settings: String,
    pub version: String,
    pub program: String,
    pub extra_packages: String,
}

impl BuildStamp {
    /// Reads a stamp; a missing or unreadable file means "no stamp".
    pub fn load(path: &Path) -> Option<Self> {
        let bytes = fs::read(path).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    /// # Errors
    /// Returns an error if the stamp cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }
}

fn short(hasher: Sha256) -> String {
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(SHORT_LEN);
    hex
}

/// Short sha256 of a string.
pub fn digest_str(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    short(hasher)
}

/// Short sha256 of one file's bytes.
///
/// # Errors
/// Returns an error if the file cannot be read.
pub fn digest_file(path: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(fs::read(path)?);
    Ok(short(hasher))
}

/// Short sha256 over every file below `dir` (relative path + contents,
/// sorted). A missing directory digests as empty.
///
/// # Errors
/// Returns an error if a file cannot be read.
pub fn digest_tree(dir: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    hash_tree(&mut hasher, dir)?;
    Ok(short(hasher))
}

fn hash_tree(hasher: &mut Sha256, dir: &Path) -> io::Result<()> {
    let mut files = Vec::new();
    collect_files(dir, &mut files)?;
    files.sort();
    for file in files {
        let rel = file.strip_prefix(dir).unwrap_or(&file);
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(fs::read(&file)?);
        hasher.update([0]);
    }
    Ok(())
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Digest for the refresh check: the settings tree plus a fixed list of
/// watched files (missing files hash as absent).
///
/// # Errors
/// Returns an error if an existing file cannot be read.
pub fn refresh_digest(settings_dir: &Path, watched: &[PathBuf]) -> io::Result<String> {
    let mut hasher = Sha256::new();
    hash_tree(&mut hasher, settings_dir)?;
    for path in watched {
        hasher.update(path.to_string_lossy().as_bytes());
        match fs::read(path) {
            Ok(bytes) => hasher.update(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => hasher.update(b"<absent>"),
            Err(e) => return Err(e),
        }
    }
    Ok(short(hasher))
}

pub fn load_refresh_stamp(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// # Errors
/// Returns an error if the stamp cannot be written.
pub fn save_refresh_stamp(path: &Path, digest: &str) -> Result<()> {
    crate::rpc::write_bytes_atomic(path, digest.as_bytes())
}
