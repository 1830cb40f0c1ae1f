//! Sandbox lifecycle.
//!
//! Builds a cache-aware container image, runs one container per
//! (user, project, session), and hands task specs to it through the
//! filesystem RPC directory.
//!
//! ```text
//! Stopped --start--> Building --ok--> Starting --up--> Running --stop--> Stopped
//!            any Building/Starting failure --------------------------> Stopped
//! ```

pub mod package;
pub mod runtime;
pub mod stamp;
pub mod template;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub use runtime::{ContainerRuntime, DockerCli, RuntimeOutput};
pub use stamp::BuildStamp;

use self::package::{ProgramPackage, copy_tree, package_program};
use self::stamp::{BUILD_STAMP_FILE, REFRESH_STAMP_FILE};
use self::template::{ENTRYPOINT, TemplateVars};
use crate::config::{DiskMode, SandboxConfig, paths};
use crate::core::project::ProjectLayout;
use crate::core::session::{SANDBOX_MARKER_ENV, SESSION_ENV};
use crate::rpc::{self, ResultWatcher};
use crate::tasks::{TaskResult, TaskSpec};

const STAGED_PROGRAM: &str = "kiln";
const STAGED_SETTINGS: &str = "settings";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("sandbox build failed:\n{0}")]
    BuildFailed(String),
    #[error("sandbox failed to start:\n{0}")]
    StartFailed(String),
    #[error("sandbox is not running (start it with `:sandbox-start` or `kiln sandbox start`)")]
    NotRunning,
    #[error("no active sandbox session")]
    NoSession,
    #[error("gave up after {waited:?} waiting for the result of '{key}' (the task may still be running)")]
    DispatchTimeout { key: String, waited: Duration },
    #[error("`{command}` failed:\n{diagnostic}")]
    Command { command: String, diagnostic: String },
    #[error("{} is outside the project root", .0.display())]
    OutsideProject(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Stopped,
    Building,
    Starting,
    Running,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Building => "building",
            Self::Starting => "starting",
            Self::Running => "running",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    UpToDate,
    Built { stamp: BuildStamp },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning,
    Started { container_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Handed to the container; nobody waits for the result.
    Dispatched { request: PathBuf },
    Completed(TaskResult),
}

/// One project's sandbox for one session.
pub struct Sandbox {
    layout: ProjectLayout,
    config: SandboxConfig,
    session_id: String,
    container_name: String,
    runtime: Arc<dyn ContainerRuntime>,
    packages_dir: PathBuf,
    watcher: ResultWatcher,
    state: Mutex<SandboxState>,
}

impl fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sandbox")
            .field("root", &self.layout.root())
            .field("container_name", &self.container_name)
            .field("runtime", &self.runtime.program())
            .field("state", &self.current_state())
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Sandbox driven by the configured runtime CLI.
    pub fn new(layout: ProjectLayout, config: SandboxConfig, session_id: impl Into<String>) -> Self {
        let runtime = Arc::new(DockerCli::new(config.runtime.clone()));
        Self::with_runtime(layout, config, session_id, runtime)
    }

    pub fn with_runtime(
        layout: ProjectLayout,
        config: SandboxConfig,
        session_id: impl Into<String>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let session_id = session_id.into();
        let container_name = container_name_for(&current_user(), layout.root(), &session_id);
        Self {
            layout,
            config,
            session_id,
            container_name,
            runtime,
            packages_dir: paths::packages_dir(),
            watcher: ResultWatcher::new(),
            state: Mutex::new(SandboxState::Stopped),
        }
    }

    #[must_use]
    pub fn with_packages_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.packages_dir = dir.into();
        self
    }

    #[must_use]
    pub fn with_watcher(mut self, watcher: ResultWatcher) -> Self {
        self.watcher = watcher;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// True when work must run inside the sandbox.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    pub fn image_tag(&self) -> &str {
        &self.config.image_tag
    }

    /// Lifecycle state, reconciled with the runtime when idle.
    pub fn state(&self) -> SandboxState {
        match self.current_state() {
            SandboxState::Stopped | SandboxState::Running => {
                let observed = if self.is_running() {
                    SandboxState::Running
                } else {
                    SandboxState::Stopped
                };
                self.set_state(observed);
                observed
            }
            transient => transient,
        }
    }

    fn current_state(&self) -> SandboxState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SandboxState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    // ----------------------------------------------------------------- build

    /// Builds the image unless it exists and its stamp is unchanged.
    ///
    /// # Errors
    /// `Unavailable` when the runtime cannot be reached, `BuildFailed` with
    /// the build tool's raw output when the build exits non-zero.
    pub fn build(&self, force: bool) -> Result<BuildOutcome, SandboxError> {
        self.ensure_available()?;
        let sandbox_dir = self.layout.sandbox_dir();
        template::ensure_assets(&sandbox_dir)?;

        let program = package_program(&self.program_source()?, &self.packages_dir)?;
        let stamp = self.stamp_for(&program.digest)?;
        let stamp_path = sandbox_dir.join(BUILD_STAMP_FILE);

        if !force && self.image_exists()? && BuildStamp::load(&stamp_path).as_ref() == Some(&stamp)
        {
            tracing::info!(image = %self.config.image_tag, "sandbox image up to date");
            return Ok(BuildOutcome::UpToDate);
        }

        // Removed on drop, whatever happens below.
        let stage = tempfile::Builder::new()
            .prefix(".build-")
            .tempdir_in(&sandbox_dir)?;
        self.stage_context(stage.path(), &program)?;
        tracing::info!(
            image = %self.config.image_tag,
            program = %program.digest,
            settings = %stamp.settings,
            "building sandbox image"
        );

        let dockerfile = stage.path().join("Dockerfile");
        let output = self.runtime.exec(&[
            "build".to_string(),
            "-t".to_string(),
            self.config.image_tag.clone(),
            "-f".to_string(),
            dockerfile.display().to_string(),
            stage.path().display().to_string(),
        ])?;
        if !output.success {
            tracing::error!(image = %self.config.image_tag, "sandbox image build failed");
            return Err(SandboxError::BuildFailed(output.diagnostic()));
        }

        stamp.save(&stamp_path)?;
        stamp::save_refresh_stamp(&sandbox_dir.join(REFRESH_STAMP_FILE), &self.refresh_digest()?)?;
        tracing::info!(image = %self.config.image_tag, "sandbox image built");
        Ok(BuildOutcome::Built { stamp })
    }

    fn stamp_for(&self, program_digest: &str) -> io::Result<BuildStamp> {
        Ok(BuildStamp {
            settings: stamp::digest_tree(&self.layout.settings_dir())?,
            version: package::PROGRAM_VERSION.to_string(),
            program: program_digest.to_string(),
            extra_packages: self.config.extra_packages.join(","),
        })
    }

    /// True when the saved build stamp no longer matches the settings tree,
    /// the program or the extra packages.
    ///
    /// # Errors
    /// Returns an error if the program or settings cannot be read.
    pub fn is_stale(&self) -> Result<bool, SandboxError> {
        let digest = stamp::digest_file(&self.program_source()?)?;
        let current = self.stamp_for(&digest)?;
        let saved = BuildStamp::load(&self.layout.sandbox_dir().join(BUILD_STAMP_FILE));
        Ok(saved.as_ref() != Some(&current))
    }

    fn program_source(&self) -> Result<PathBuf, SandboxError> {
        match &self.config.program_path {
            Some(path) => Ok(path.clone()),
            None => Ok(std::env::current_exe()?),
        }
    }

    fn stage_context(&self, dir: &Path, program: &ProgramPackage) -> Result<(), SandboxError> {
        let sandbox_dir = self.layout.sandbox_dir();
        fs::copy(&program.path, dir.join(STAGED_PROGRAM))?;
        fs::copy(sandbox_dir.join(ENTRYPOINT), dir.join(ENTRYPOINT))?;
        copy_tree(&self.layout.settings_dir(), &dir.join(STAGED_SETTINGS))?;

        let dockerfile = template::render_dockerfile(
            &sandbox_dir,
            &TemplateVars {
                packages: &self.config.extra_packages,
                program: STAGED_PROGRAM,
                entrypoint: ENTRYPOINT,
                settings: STAGED_SETTINGS,
                mount_point: &self.config.mount_point,
                version: &program.version,
            },
        )?;
        fs::write(dir.join("Dockerfile"), dockerfile)?;
        Ok(())
    }

    /// True when settings, the Dockerfile template, the entrypoint or the
    /// prompt files changed since the last successful build.
    ///
    /// # Errors
    /// Returns an error if a watched file exists but cannot be read.
    pub fn needs_refresh(&self) -> Result<bool, SandboxError> {
        let current = self.refresh_digest()?;
        let saved = stamp::load_refresh_stamp(&self.layout.sandbox_dir().join(REFRESH_STAMP_FILE));
        Ok(saved.as_deref() != Some(current.as_str()))
    }

    fn refresh_digest(&self) -> io::Result<String> {
        stamp::refresh_digest(
            &self.layout.settings_dir(),
            &template::asset_paths(&self.layout.sandbox_dir()),
        )
    }

    // ------------------------------------------------------------- lifecycle

    /// Builds if needed, then starts the container. A container left over
    /// from an older image is replaced.
    ///
    /// # Errors
    /// Any build or start failure; the sandbox is left stopped.
    pub fn start(&self, force_build: bool) -> Result<StartOutcome, SandboxError> {
        if self.session_id.is_empty() {
            return Err(SandboxError::NoSession);
        }
        self.set_state(SandboxState::Building);
        let result = self.start_inner(force_build);
        self.set_state(if result.is_ok() {
            SandboxState::Running
        } else {
            SandboxState::Stopped
        });
        result
    }

    fn start_inner(&self, force_build: bool) -> Result<StartOutcome, SandboxError> {
        let rebuilt = matches!(self.build(force_build)?, BuildOutcome::Built { .. });
        if self.is_running() {
            if !rebuilt {
                tracing::info!(container = %self.container_name, "sandbox already running");
                return Ok(StartOutcome::AlreadyRunning);
            }
            // The running container still uses the superseded image.
            tracing::info!(container = %self.container_name, "recreating sandbox on rebuilt image");
            self.run_checked(&["rm", "-f", "-v", &self.container_name])?;
        }

        self.set_state(SandboxState::Starting);
        self.layout.ensure()?;
        let output = self.runtime.exec(&self.run_args()?)?;
        if !output.success {
            return Err(SandboxError::StartFailed(output.diagnostic()));
        }
        let container_id = output.stdout.trim().to_string();

        if !self.is_running() {
            let logs = self
                .runtime
                .exec(&["logs".to_string(), self.container_name.clone()])
                .map(|o| o.diagnostic())
                .unwrap_or_default();
            return Err(SandboxError::StartFailed(format!(
                "container {} exited immediately\n{logs}",
                self.container_name
            )));
        }

        if self.config.disk == DiskMode::Copy {
            self.copy_project_in()?;
        }

        tracing::info!(container = %self.container_name, id = %container_id, "sandbox started");
        Ok(StartOutcome::Started { container_id })
    }

    fn run_args(&self) -> Result<Vec<String>, SandboxError> {
        let mut args: Vec<String> = vec!["run".into(), "-dit".into(), "--name".into()];
        args.push(self.container_name.clone());
        for mount in self.mounts()? {
            args.push("--mount".into());
            args.push(mount);
        }
        for env in [
            "CI=true".to_string(),
            format!("{SESSION_ENV}={}", self.session_id),
            format!("{SANDBOX_MARKER_ENV}=1"),
        ] {
            args.push("-e".into());
            args.push(env);
        }
        args.push("-w".into());
        args.push(self.config.mount_point.clone());
        args.push(self.config.image_tag.clone());
        Ok(args)
    }

    fn mounts(&self) -> Result<Vec<String>, SandboxError> {
        let mount_point = &self.config.mount_point;
        Ok(match self.config.disk {
            DiskMode::Mount => vec![format!(
                "type=bind,src={},dst={mount_point}",
                self.layout.root().display()
            )],
            // The tree lives in a volume; results still have to reach the host.
            DiskMode::Copy => {
                let rpc_dir = self.layout.rpc_dir();
                vec![
                    format!("type=volume,dst={mount_point}"),
                    format!(
                        "type=bind,src={},dst={}",
                        rpc_dir.display(),
                        self.container_path(&rpc_dir)?
                    ),
                ]
            }
        })
    }

    fn copy_project_in(&self) -> Result<(), SandboxError> {
        let output = self.runtime.exec(&[
            "cp".to_string(),
            format!("{}/.", self.layout.root().display()),
            format!("{}:{}", self.container_name, self.config.mount_point),
        ])?;
        if !output.success {
            return Err(SandboxError::StartFailed(output.diagnostic()));
        }
        Ok(())
    }

    /// Removes the container. Returns false when nothing was running.
    ///
    /// # Errors
    /// Returns an error if the runtime refuses to remove the container.
    pub fn stop(&self) -> Result<bool, SandboxError> {
        if !self.is_running() {
            self.set_state(SandboxState::Stopped);
            return Ok(false);
        }
        self.run_checked(&["rm", "-f", "-v", &self.container_name])?;
        self.set_state(SandboxState::Stopped);
        tracing::info!(container = %self.container_name, "sandbox stopped");
        Ok(true)
    }

    /// # Errors
    /// Any stop or start failure.
    pub fn restart(&self) -> Result<StartOutcome, SandboxError> {
        self.stop()?;
        self.start(false)
    }

    /// Never fails: an unreachable runtime counts as "not running".
    pub fn is_running(&self) -> bool {
        running_from(self.runtime.exec(&self.ps_args()))
    }

    fn ps_args(&self) -> Vec<String> {
        vec![
            "ps".into(),
            "-q".into(),
            "-f".into(),
            format!("name=^{}$", self.container_name),
        ]
    }

    /// Runtime-reported container status, or `stopped`.
    ///
    /// # Errors
    /// Returns an error if inspecting a running container fails.
    pub fn status(&self) -> Result<String, SandboxError> {
        if !self.is_running() {
            return Ok(SandboxState::Stopped.to_string());
        }
        let out = self.run_checked(&["inspect", "-f", "{{.State.Status}}", &self.container_name])?;
        Ok(out.trim().to_string())
    }

    /// Last `tail` lines of container output.
    ///
    /// # Errors
    /// `NotRunning` when there is no container, or the runtime failure.
    pub fn logs(&self, tail: usize) -> Result<String, SandboxError> {
        if !self.is_running() {
            return Err(SandboxError::NotRunning);
        }
        let tail = tail.to_string();
        let output = self.runtime.exec(&[
            "logs".to_string(),
            "--tail".to_string(),
            tail,
            self.container_name.clone(),
        ])?;
        if !output.success {
            return Err(self.command_error(&["logs", &self.container_name], &output));
        }
        Ok(format!("{}{}", output.stdout, output.stderr))
    }

    // -------------------------------------------------------------- dispatch

    /// Runs `spec` inside the container through the RPC directory.
    ///
    /// A stale image is rebuilt and the container recreated before anything
    /// is written. Returns `Dispatched` right after handing the task spec
    /// over when `wait` is false or the task spec has no return id; otherwise
    /// waits (up to `dispatch_timeout_secs`) for the result file.
    ///
    /// # Errors
    /// `NotRunning`/`NoSession` before anything is written, a rebuild
    /// failure, `DispatchTimeout` when a finite wait expires, or the
    /// exec/protocol failure.
    pub async fn dispatch_task(
        &self,
        spec: &TaskSpec,
        wait: bool,
    ) -> Result<DispatchOutcome, SandboxError> {
        if self.session_id.is_empty() {
            return Err(SandboxError::NoSession);
        }
        if !running_from(self.exec_async(self.ps_args()).await) {
            return Err(SandboxError::NotRunning);
        }
        if self.is_stale()? {
            tracing::info!(container = %self.container_name, "sandbox image stale; rebuilding before dispatch");
            self.start(false)?;
        }

        let rpc_dir = self.layout.rpc_dir();
        let request = rpc::request_path(&rpc_dir, spec);
        let inside = self.container_path(&request)?;
        let response = rpc::response_path(&rpc_dir, spec);
        match fs::remove_file(&response) {
            Ok(()) => tracing::debug!(path = %response.display(), "removed stale result"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        rpc::write_request(&rpc_dir, spec)?;

        let args: Vec<String> = [
            "exec",
            "-d",
            "-w",
            self.config.mount_point.as_str(),
            self.container_name.as_str(),
            STAGED_PROGRAM,
            "run-task",
            inside.as_str(),
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        let output = self.exec_async(args.clone()).await?;
        if !output.success {
            let refs: Vec<&str> = args.iter().map(String::as_str).collect();
            return Err(self.command_error(&refs, &output));
        }
        tracing::info!(task_id = %spec.id, name = %spec.name, path = %inside, "task dispatched to sandbox");

        if !wait || spec.return_id.is_none() {
            return Ok(DispatchOutcome::Dispatched { request });
        }

        let timeout = self.config.dispatch_timeout();
        if !self.watcher.await_file(&response, timeout).await {
            let key = spec.correlation_key().to_string();
            tracing::warn!(%key, ?timeout, "sandbox dispatch timed out");
            return Err(SandboxError::DispatchTimeout {
                key,
                waited: timeout.unwrap_or_default(),
            });
        }
        Ok(DispatchOutcome::Completed(rpc::read_response(&response)?))
    }

    /// Rewrites a host path under the project root onto the container mount.
    ///
    /// # Errors
    /// `OutsideProject` when `host` is not below the project root.
    pub fn container_path(&self, host: &Path) -> Result<String, SandboxError> {
        let rel = host
            .strip_prefix(self.layout.root())
            .map_err(|_| SandboxError::OutsideProject(host.to_path_buf()))?;
        let mut inside = self.config.mount_point.trim_end_matches('/').to_string();
        for component in rel.components() {
            match component {
                Component::Normal(part) => {
                    inside.push('/');
                    inside.push_str(&part.to_string_lossy());
                }
                Component::CurDir => {}
                _ => return Err(SandboxError::OutsideProject(host.to_path_buf())),
            }
        }
        Ok(inside)
    }

    // --------------------------------------------------------------- helpers

    fn ensure_available(&self) -> Result<(), SandboxError> {
        let output = self.runtime.exec(&["info".to_string()])?;
        if output.success {
            Ok(())
        } else {
            Err(SandboxError::Unavailable(output.diagnostic()))
        }
    }

    fn image_exists(&self) -> Result<bool, SandboxError> {
        let out = self.run_checked(&["images", "-q", &self.config.image_tag])?;
        Ok(!out.trim().is_empty())
    }

    fn run_checked(&self, args: &[&str]) -> Result<String, SandboxError> {
        let owned: Vec<String> = args.iter().map(ToString::to_string).collect();
        let output = self.runtime.exec(&owned)?;
        if output.success {
            Ok(output.stdout)
        } else {
            Err(self.command_error(args, &output))
        }
    }

    fn command_error(&self, args: &[&str], output: &RuntimeOutput) -> SandboxError {
        SandboxError::Command {
            command: format!("{} {}", self.runtime.program(), args.join(" ")),
            diagnostic: output.diagnostic(),
        }
    }

    async fn exec_async(&self, args: Vec<String>) -> Result<RuntimeOutput, SandboxError> {
        let runtime = Arc::clone(&self.runtime);
        tokio::task::spawn_blocking(move || runtime.exec(&args))
            .await
            .map_err(|e| SandboxError::Unavailable(format!("runtime call aborted: {e}")))?
    }
}

fn running_from(output: Result<RuntimeOutput, SandboxError>) -> bool {
    match output {
        Ok(output) => output.success && !output.stdout.trim().is_empty(),
        Err(e) => {
            tracing::debug!(error = %e, "runtime unreachable; treating sandbox as stopped");
            false
        }
    }
}

fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .ok()
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| "user".to_string())
}

/// `kiln-sandbox-<user>-<project hash>-<session>`, restricted to the
/// characters container names allow.
pub fn container_name_for(user: &str, root: &Path, session_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(root.to_string_lossy().as_bytes());
    let mut project = format!("{:x}", hasher.finalize());
    project.truncate(8);

    let clean = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect()
    };

    let mut name = format!("kiln-sandbox-{}-{project}", clean(user));
    if !session_id.is_empty() {
        name.push('-');
        name.push_str(&clean(session_id));
    }
    name
}
