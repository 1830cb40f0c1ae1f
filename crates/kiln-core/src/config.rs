//! Configuration management for kiln.
//!
//! Two TOML files are layered: the global `$KILN_HOME/config.toml` and
//! the project file `<root>/.kiln/settings/config.toml`. Project values
//! win, table by table.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub mod paths {
    //! Path resolution for kiln configuration and data directories.
    //!
    //! KILN_HOME resolution order:
    //! 1. KILN_HOME environment variable (if set)
    //! 2. ~/.config/kiln (default)
    //! 3. ./.kiln-home when no home directory can be determined

    use std::path::PathBuf;

    /// Returns the kiln home directory.
    pub fn kiln_home() -> PathBuf {
        if let Ok(home) = std::env::var("KILN_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".kiln-home"),
            |h| h.join(".config").join("kiln"),
        )
    }

    /// Returns the path to the global config.toml file.
    pub fn config_path() -> PathBuf {
        kiln_home().join("config.toml")
    }

    /// Returns the directory holding cached program packages.
    pub fn packages_dir() -> PathBuf {
        kiln_home().join("packages")
    }
}

/// How the project tree is exposed inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskMode {
    /// Bind-mount the host project root.
    #[default]
    Mount,
    /// Copy the project into a container volume.
    Copy,
}

/// Tool filtering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolsMode {
    #[default]
    Blacklist,
    Whitelist,
}

/// Task engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TasksConfig {
    /// Maximum concurrently running tasks (0 or unset = CPU count).
    pub max_concurrency: Option<usize>,
    /// Tool execution timeout in seconds (0 = no timeout).
    pub tool_timeout_secs: u64,
}

impl TasksConfig {
    /// Effective concurrency bound.
    pub fn max_concurrency(&self) -> usize {
        match self.max_concurrency {
            Some(n) if n > 0 => n,
            _ => std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
        }
    }

    /// Returns the tool timeout as a Duration, or None if disabled.
    pub fn tool_timeout(&self) -> Option<Duration> {
        (self.tool_timeout_secs > 0).then(|| Duration::from_secs(self.tool_timeout_secs))
    }
}

/// Sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// When true, work must run inside the sandbox; nothing falls back to the host.
    pub enabled: bool,
    pub disk: DiskMode,
    /// Extra OS packages installed into the image.
    pub extra_packages: Vec<String>,
    pub image_tag: String,
    /// Container runtime CLI.
    pub runtime: String,
    pub mount_point: String,
    /// Program binary to package into the image (defaults to the running executable).
    pub program_path: Option<PathBuf>,
    /// Dispatch wait timeout in seconds (0 = wait forever).
    pub dispatch_timeout_secs: u64,
}

impl SandboxConfig {
    pub const DEFAULT_IMAGE_TAG: &'static str = "kiln-sandbox";
    pub const DEFAULT_RUNTIME: &'static str = "docker";
    pub const DEFAULT_MOUNT_POINT: &'static str = "/mnt/project";

    pub fn dispatch_timeout(&self) -> Option<Duration> {
        (self.dispatch_timeout_secs > 0).then(|| Duration::from_secs(self.dispatch_timeout_secs))
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            disk: DiskMode::default(),
            extra_packages: Vec::new(),
            image_tag: Self::DEFAULT_IMAGE_TAG.to_string(),
            runtime: Self::DEFAULT_RUNTIME.to_string(),
            mount_point: Self::DEFAULT_MOUNT_POINT.to_string(),
            program_path: None,
            dispatch_timeout_secs: 0,
        }
    }
}

/// Which tools may be invoked.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ToolsConfig {
    pub mode: ToolsMode,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
}

impl ToolsConfig {
    /// Filters a list of tool names based on the configured mode.
    ///
    /// Matching is case-insensitive.
    pub fn filter_tools<'a>(&self, all: &[&'a str]) -> Vec<&'a str> {
        let contains = |list: &[String], name: &str| list.iter().any(|t| t.eq_ignore_ascii_case(name));
        all.iter()
            .copied()
            .filter(|name| match self.mode {
                ToolsMode::Whitelist => contains(&self.whitelist, name),
                ToolsMode::Blacklist => !contains(&self.blacklist, name),
            })
            .collect()
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default log filter when KILN_LOG is unset.
    pub log_level: String,
    pub tasks: TasksConfig,
    pub sandbox: SandboxConfig,
    pub tools: ToolsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Self::DEFAULT_LOG_LEVEL.to_string(),
            tasks: TasksConfig::default(),
            sandbox: SandboxConfig::default(),
            tools: ToolsConfig::default(),
        }
    }
}

fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

impl Config {
    pub const DEFAULT_LOG_LEVEL: &'static str = "info";

    /// Loads the global config, overlaid by the project settings of `root`.
    ///
    /// # Errors
    /// Returns an error if either file exists but cannot be read or parsed.
    pub fn load_for(root: &Path) -> Result<Self> {
        let project = crate::core::project::ProjectLayout::new(root).config_path();
        Self::load_layered(&paths::config_path(), &project)
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        let table = read_table(path)?.unwrap_or_default();
        toml::Value::Table(table)
            .try_into()
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Loads `base` and overlays `overlay` on top of it.
    ///
    /// # Errors
    /// Returns an error if either file exists but cannot be read or parsed.
    pub fn load_layered(base: &Path, overlay: &Path) -> Result<Self> {
        let mut merged = read_table(base)?.unwrap_or_default();
        if let Some(project) = read_table(overlay)? {
            merge_tables(&mut merged, project);
        }
        toml::Value::Table(merged).try_into().with_context(|| {
            format!(
                "Failed to parse config from {} and {}",
                base.display(),
                overlay.display()
            )
        })
    }

    /// Looks up a nested value by key path, e.g. `["sandbox", "disk"]`.
    pub fn lookup(&self, keys: &[&str]) -> Option<toml::Value> {
        let mut current = toml::Value::try_from(self).ok()?;
        for key in keys {
            current = current.as_table_mut()?.remove(*key)?;
        }
        Some(current)
    }

    /// Initializes a new config file with the commented default template.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        crate::rpc::write_bytes_atomic(path, default_config_template().as_bytes())
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}

fn read_table(path: &Path) -> Result<Option<toml::Table>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let table = contents
        .parse::<toml::Table>()
        .with_context(|| format!("Failed to parse config from {}", path.display()))?;
    Ok(Some(table))
}

fn merge_tables(target: &mut toml::Table, source: toml::Table) {
    for (key, value) in source {
        match (target.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}
