//! Container runtime seam.
//!
//! The lifecycle only ever talks to the runtime through
//! [`ContainerRuntime::exec`], one CLI invocation at a time, so tests can
//! swap in a scripted runtime that records calls.

use std::io::ErrorKind;
use std::process::{Command, Stdio};

use super::SandboxError;

/// Captured result of one runtime invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl RuntimeOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Raw diagnostic text: stderr, then stdout, untouched.
    pub fn diagnostic(&self) -> String {
        match (self.stderr.trim().is_empty(), self.stdout.trim().is_empty()) {
            (false, false) => format!("{}\n{}", self.stderr, self.stdout),
            (false, true) => self.stderr.clone(),
            _ => self.stdout.clone(),
        }
    }
}

pub trait ContainerRuntime: Send + Sync {
    /// Program name, used in diagnostics.
    fn program(&self) -> &str;

    /// Runs `<program> <args..>` to completion and captures its output.
    ///
    /// # Errors
    /// Returns `SandboxError::Unavailable` when the program cannot be
    /// launched at all. A non-zero exit is not an error here.
    fn exec(&self, args: &[String]) -> Result<RuntimeOutput, SandboxError>;
}

/// Shells out to a docker-compatible CLI (`docker`, `podman`, ...).
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
}

impl DockerCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ContainerRuntime for DockerCli {
    fn program(&self) -> &str {
        &self.program
    }

    fn exec(&self, args: &[String]) -> Result<RuntimeOutput, SandboxError> {
        tracing::debug!(program = %self.program, ?args, "runtime command");
        let output = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => {
                    SandboxError::Unavailable(format!("'{}' not found on PATH", self.program))
                }
                _ => SandboxError::Unavailable(format!("failed to run '{}': {e}", self.program)),
            })?;

        Ok(RuntimeOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
