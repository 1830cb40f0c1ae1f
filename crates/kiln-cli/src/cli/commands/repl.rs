//! Interactive line loop and `kiln -c`.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use kiln_core::core::interrupt;
use kiln_core::dispatch::{Dispatcher, Reply};
use kiln_core::sandbox::{Sandbox, StartOutcome};
use kiln_core::tasks::TaskResult;
use tokio::io::{AsyncBufReadExt, BufReader};

use super::Project;

const PROMPT: &str = "kiln> ";

/// Reads lines from stdin until EOF, `:exit`, or termination.
pub async fn run(project: &Project) -> Result<()> {
    let dispatcher = project.dispatcher();
    dispatcher.tasks().initialize()?;

    let started = if dispatcher.sandbox().is_enabled() {
        bring_up(Arc::clone(dispatcher.sandbox())).await
    } else {
        false
    };

    let result = read_loop(&dispatcher).await;

    dispatcher.tasks().shutdown();
    if started {
        let sandbox = Arc::clone(dispatcher.sandbox());
        match tokio::task::spawn_blocking(move || sandbox.stop()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => eprintln!("Failed to stop sandbox: {e}"),
            Err(e) => tracing::error!(error = %e, "sandbox stop panicked"),
        }
    }
    result
}

async fn read_loop(dispatcher: &Dispatcher) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{PROMPT}");
        std::io::stdout().flush().context("flush stdout")?;

        let line = tokio::select! {
            line = lines.next_line() => line.context("read stdin")?,
            () = interrupt::wait_for_terminate() => {
                println!();
                return Ok(());
            }
        };
        let Some(line) = line else {
            println!();
            return Ok(());
        };

        match dispatcher.dispatch(&line, true).await {
            Ok(Reply::Exit) => return Ok(()),
            Ok(reply) => print_reply(&reply),
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "dispatch failed");
                eprintln!("Error: {e:#}");
            }
        }
    }
}

/// Dispatches one line. Notices become errors so scripts see a non-zero exit.
pub async fn run_once(project: &Project, line: &str) -> Result<()> {
    let dispatcher = project.dispatcher();
    dispatcher.tasks().initialize()?;
    let reply = dispatcher.dispatch(line, true).await;
    dispatcher.tasks().shutdown();

    match reply? {
        Reply::Notice(text) => bail!("{text}"),
        Reply::Task {
            result: Some(result),
            ..
        } if result.error.is_some() => bail!("{}", result.summary()),
        reply => {
            print_reply(&reply);
            Ok(())
        }
    }
}

/// Starts the mandatory sandbox. Failures are shown and leave it stopped,
/// so later tool calls are refused rather than run on the host.
async fn bring_up(sandbox: Arc<Sandbox>) -> bool {
    eprintln!("Starting sandbox {}...", sandbox.container_name());
    let outcome = tokio::task::spawn_blocking(move || {
        if let Ok(true) = sandbox.needs_refresh() {
            eprintln!("Sandbox settings changed since the last build; rebuilding.");
        }
        sandbox.start(false)
    })
    .await;
    match outcome {
        Ok(Ok(StartOutcome::Started { .. })) => true,
        Ok(Ok(StartOutcome::AlreadyRunning)) => false,
        Ok(Err(e)) => {
            eprintln!("{e}");
            false
        }
        Err(e) => {
            tracing::error!(error = %e, "sandbox start panicked");
            false
        }
    }
}

fn print_reply(reply: &Reply) {
    match reply {
        Reply::Silent | Reply::Exit => {}
        Reply::Text(text) => print_text(text),
        Reply::Notice(text) => eprintln!("{}", text.trim_end()),
        Reply::Task { id, result: None } => println!("Task {id} scheduled"),
        Reply::Task {
            result: Some(result),
            ..
        } => print_result(result),
    }
}

fn print_text(text: &str) {
    if !text.is_empty() {
        println!("{}", text.trim_end_matches('\n'));
    }
}

fn print_result(result: &TaskResult) {
    match (&result.output, &result.error) {
        (_, Some(error)) => eprintln!("[{}] {error}", result.status),
        (Some(output), None) => match serde_json::to_string_pretty(output) {
            Ok(text) => print_text(&text),
            Err(_) => print_text(&result.summary()),
        },
        (None, None) => println!("[{}]", result.status),
    }
}
