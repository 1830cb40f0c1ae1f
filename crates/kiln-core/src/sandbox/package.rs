//! Packages the kiln program for the sandbox image.
//!
//! The binary is cached under `$KILN_HOME/packages/` by version and
//! content digest, so repeated builds copy it once.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::stamp::digest_file;
use crate::rpc::write_bytes_atomic;

pub const PROGRAM_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramPackage {
    pub path: PathBuf,
    pub version: String,
    pub digest: String,
}

/// Returns the cached package for `source`, copying it in on first use.
///
/// # Errors
/// Returns an error if the source cannot be read or the cache written.
pub fn package_program(source: &Path, packages_dir: &Path) -> Result<ProgramPackage> {
    let digest =
        digest_file(source).with_context(|| format!("read program {}", source.display()))?;
    let path = packages_dir.join(format!("kiln-{PROGRAM_VERSION}-{digest}"));

    if !path.exists() {
        let bytes = fs::read(source).with_context(|| format!("read program {}", source.display()))?;
        write_bytes_atomic(&path, &bytes)?;
        make_executable(&path)?;
        tracing::info!(path = %path.display(), "cached program package");
    }

    Ok(ProgramPackage {
        path,
        version: PROGRAM_VERSION.to_string(),
        digest,
    })
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
        .with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Recursively copies `src` into `dst`. A missing `src` yields an empty `dst`.
///
/// # Errors
/// Returns an error if a directory or file cannot be copied.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    let entries = match fs::read_dir(src) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
