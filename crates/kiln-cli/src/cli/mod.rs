//! CLI entry and dispatch.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kiln_core::core::interrupt;

mod commands;

#[derive(Parser)]
#[command(name = "kiln")]
#[command(version)]
#[command(about = "Task engine and sandboxed tool dispatch for a project")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Project root (default: current directory)
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Session id; selects which sandbox container lifecycle commands target
    #[arg(long, global = true, env = "KILN_SESSION_ID", value_name = "ID")]
    session: Option<String>,

    /// Dispatch a single line and exit
    #[arg(short = 'c', long = "command", value_name = "LINE")]
    line: Option<String>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run a task spec file and write its result next to it
    RunTask {
        /// Path of the task spec (`<id>.json`)
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Manage the project sandbox
    Sandbox {
        #[command(subcommand)]
        command: SandboxCommands,
    },
    /// Inspect persisted tasks
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum SandboxCommands {
    /// Build the sandbox image if its inputs changed
    Build {
        /// Rebuild even when the stamp matches
        #[arg(long)]
        force: bool,
    },
    /// Build if needed and start the sandbox container
    Start {
        /// Rebuild the image first
        #[arg(long)]
        force: bool,
    },
    /// Stop and remove the sandbox container
    Stop,
    /// Stop, then start the sandbox container
    Restart,
    /// Show sandbox state
    Status,
    /// Print container output
    Logs {
        /// Number of lines from the end
        #[arg(long, default_value_t = 120)]
        tail: usize,
    },
}

#[derive(clap::Subcommand)]
enum TaskCommands {
    /// Lists persisted tasks
    List {
        /// Show every task instead of the most recent ones
        #[arg(long)]
        all: bool,
    },
    /// Shows one task's spec and result
    Show {
        /// Task id or unique prefix
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the global config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = interrupt::init() {
        tracing::debug!(error = %e, "ctrl-c handler not installed");
    }

    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    let result = rt.block_on(async move { dispatch(cli).await });
    // A pending stdin read would otherwise hold shutdown open.
    rt.shutdown_timeout(Duration::from_millis(200));
    result
}

async fn dispatch(cli: Cli) -> Result<()> {
    let Cli {
        command,
        root,
        session,
        line,
    } = cli;

    if command.is_some() && line.is_some() {
        anyhow::bail!("-c cannot be combined with a subcommand");
    }

    let Some(command) = command else {
        let project = commands::Project::open(&root, session)?;
        return match line {
            Some(line) => commands::repl::run_once(&project, &line).await,
            None => commands::repl::run(&project).await,
        };
    };

    match command {
        Commands::RunTask { path } => {
            let project = commands::Project::open(&root, session)?;
            commands::run_task::run(&project, &path).await
        }

        Commands::Sandbox { command } => {
            let project = commands::Project::open(&root, session)?;
            let sandbox = project.sandbox();
            match command {
                SandboxCommands::Build { force } => commands::sandbox::build(sandbox, force).await,
                SandboxCommands::Start { force } => commands::sandbox::start(sandbox, force).await,
                SandboxCommands::Stop => commands::sandbox::stop(sandbox).await,
                SandboxCommands::Restart => commands::sandbox::restart(sandbox).await,
                SandboxCommands::Status => commands::sandbox::status(sandbox).await,
                SandboxCommands::Logs { tail } => commands::sandbox::logs(sandbox, tail).await,
            }
        }

        Commands::Tasks { command } => {
            let project = commands::Project::open(&root, session)?;
            match command {
                TaskCommands::List { all } => commands::tasks::list(&project, all),
                TaskCommands::Show { id } => commands::tasks::show(&project, &id),
            }
        }

        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
        },
    }
}
