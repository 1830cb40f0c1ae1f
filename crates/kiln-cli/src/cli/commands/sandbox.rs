//! Sandbox command handlers.
//!
//! Lifecycle calls shell out to the container runtime, so they run on the
//! blocking pool.

use std::sync::Arc;

use anyhow::Result;
use kiln_core::sandbox::{BuildOutcome, Sandbox, SandboxError, StartOutcome};

async fn blocking<T, F>(sandbox: Arc<Sandbox>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Sandbox) -> Result<T, SandboxError> + Send + 'static,
{
    Ok(tokio::task::spawn_blocking(move || f(&sandbox)).await??)
}

pub async fn build(sandbox: Arc<Sandbox>, force: bool) -> Result<()> {
    match blocking(sandbox, move |s| s.build(force)).await? {
        BuildOutcome::UpToDate => println!("Sandbox image is up to date."),
        BuildOutcome::Built { stamp } => {
            println!("Built sandbox image (settings {}, program {}).", stamp.settings, stamp.program);
        }
    }
    Ok(())
}

pub async fn start(sandbox: Arc<Sandbox>, force: bool) -> Result<()> {
    let name = sandbox.container_name().to_string();
    let outcome = blocking(sandbox, move |s| {
        if !force && s.needs_refresh()? {
            eprintln!("Sandbox settings changed since the last build; rebuilding.");
        }
        s.start(force)
    })
    .await?;
    match outcome {
        StartOutcome::AlreadyRunning => println!("Sandbox already running: {name}"),
        StartOutcome::Started { container_id } => {
            let short: String = container_id.chars().take(12).collect();
            println!("Sandbox started: {short} {name}");
        }
    }
    Ok(())
}

pub async fn stop(sandbox: Arc<Sandbox>) -> Result<()> {
    if blocking(sandbox, Sandbox::stop).await? {
        println!("Sandbox stopped.");
    } else {
        println!("Sandbox was not running.");
    }
    Ok(())
}

pub async fn restart(sandbox: Arc<Sandbox>) -> Result<()> {
    let name = sandbox.container_name().to_string();
    blocking(sandbox, Sandbox::restart).await?;
    println!("Sandbox restarted: {name}");
    Ok(())
}

pub async fn status(sandbox: Arc<Sandbox>) -> Result<()> {
    println!("container: {}", sandbox.container_name());
    println!("image:     {}", sandbox.image_tag());
    println!("session:   {}", sandbox.session_id());
    let (state, status, stale) = blocking(sandbox, |s| {
        let state = s.state();
        let status = s.status().unwrap_or_else(|e| format!("unknown ({e})"));
        Ok((state, status, s.needs_refresh().unwrap_or(false)))
    })
    .await?;
    println!("state:     {state}");
    println!("status:    {status}");
    if stale {
        println!("note:      settings changed since the last build");
    }
    Ok(())
}

pub async fn logs(sandbox: Arc<Sandbox>, tail: usize) -> Result<()> {
    let logs = blocking(sandbox, move |s| s.logs(tail)).await?;
    print!("{logs}");
    Ok(())
}
