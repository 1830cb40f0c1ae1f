//! Build descriptor assets.
//!
//! The project keeps editable copies of the Dockerfile template and the
//! entrypoint under `.kiln/sandbox/`; they are seeded from the embedded
//! defaults the first time a build runs.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use crate::rpc::write_bytes_atomic;

pub const DOCKERFILE_TEMPLATE: &str = "Dockerfile.j2";
pub const ENTRYPOINT: &str = "entrypoint.sh";

const DEFAULT_DOCKERFILE: &str = include_str!("assets/Dockerfile.j2");
const DEFAULT_ENTRYPOINT: &str = include_str!("assets/entrypoint.sh");

/// Variables visible to the Dockerfile template.
#[derive(Debug, Serialize)]
pub struct TemplateVars<'a> {
    /// Extra OS packages.
    pub packages: &'a [String],
    /// Staged program binary, relative to the build context.
    pub program: &'a str,
    pub entrypoint: &'a str,
    /// Staged settings snapshot directory, relative to the build context.
    pub settings: &'a str,
    pub mount_point: &'a str,
    pub version: &'a str,
}

/// Asset paths inside `sandbox_dir`, in the order they are watched.
pub fn asset_paths(sandbox_dir: &Path) -> Vec<PathBuf> {
    vec![
        sandbox_dir.join(DOCKERFILE_TEMPLATE),
        sandbox_dir.join(ENTRYPOINT),
    ]
}

/// Writes the default template and entrypoint if they are missing.
///
/// Existing files are left alone so local edits survive.
///
/// # Errors
/// Returns an error if a default cannot be written.
pub fn ensure_assets(sandbox_dir: &Path) -> Result<()> {
    for (name, contents) in [
        (DOCKERFILE_TEMPLATE, DEFAULT_DOCKERFILE),
        (ENTRYPOINT, DEFAULT_ENTRYPOINT),
    ] {
        let path = sandbox_dir.join(name);
        if !path.exists() {
            write_bytes_atomic(&path, contents.as_bytes())?;
            tracing::debug!(path = %path.display(), "seeded sandbox asset");
        }
    }
    Ok(())
}

/// Renders the project's Dockerfile template.
///
/// # Errors
/// Returns an error if the template cannot be read, references an
/// unknown variable, or fails to render.
pub fn render_dockerfile(sandbox_dir: &Path, vars: &TemplateVars<'_>) -> Result<String> {
    let path = sandbox_dir.join(DOCKERFILE_TEMPLATE);
    let source =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    render(&source, vars).with_context(|| format!("render {}", path.display()))
}

fn render(source: &str, vars: &TemplateVars<'_>) -> std::result::Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("Dockerfile", source)?;
    let output = env.get_template("Dockerfile")?.render(vars)?;
    Ok(output.replace("\r\n", "\n"))
}
