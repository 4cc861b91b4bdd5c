// ABOUTME: CLI entry point for the hivemind brain.
// ABOUTME: Dispatches to serve, config, and client subcommands that talk to the hub socket.

mod serve;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hivemind_brain::{BrainConfig, Client, EventFilter, EventType, TaskStatus, WorkflowTask};
use hivemind_log::LogMode;
use std::path::PathBuf;
use std::time::Duration;

/// Instance id used when a client subcommand does not name one.
const CLI_INSTANCE: &str = "hivemind-cli";

#[derive(Parser)]
#[command(name = "hivemind")]
#[command(about = "Coordination hub for coding agents sharing a repository")]
#[command(version)]
struct Cli {
    /// Brain socket path (defaults to the configured path)
    #[arg(long, global = true, env = "HIVEMIND_SOCKET")]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the brain hub with a headless supervisor
    Serve {
        /// Path to configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Program spawned agents run when a request does not name one
        #[arg(long, default_value = "claude")]
        program: String,
        /// Maximum instances the headless supervisor runs at once
        #[arg(long, default_value_t = hivemind_brain::supervisor::DEFAULT_INSTANCE_LIMIT)]
        max_instances: usize,
        /// Log to ~/.hivemind/logs/brain.log instead of stderr
        #[arg(long)]
        log_file: bool,
    },

    /// Configuration file commands
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Check that the hub is answering
    Ping,

    /// Show agents and messages visible to an instance
    State {
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = CLI_INSTANCE)]
        id: String,
    },

    /// Report what an instance is working on
    Status {
        #[arg(long)]
        repo: String,
        #[arg(long)]
        id: String,
        #[arg(long)]
        feature: String,
        /// Claimed file (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long)]
        role: Option<String>,
    },

    /// Send a message to one instance, or broadcast when --to is omitted
    Send {
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = CLI_INSTANCE)]
        id: String,
        #[arg(long, default_value = "")]
        to: String,
        content: String,
    },

    /// Task graph commands
    #[command(subcommand)]
    Workflow(WorkflowCommands),

    /// Stream hub events as JSON lines until interrupted
    Watch {
        /// Event type to include (repeatable)
        #[arg(long = "type")]
        types: Vec<String>,
        /// Source instance to include (repeatable)
        #[arg(long = "instance")]
        instances: Vec<String>,
        /// Only events spawned under this parent instance
        #[arg(long)]
        parent: Option<String>,
        /// Seconds each long poll may wait
        #[arg(long, default_value_t = 15)]
        timeout: u64,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a config file with default values
    Init {
        #[arg(long)]
        path: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// Print the repository's task graph
    Show {
        #[arg(long)]
        repo: String,
    },

    /// Replace the task graph with tasks from a JSON file
    Define {
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = CLI_INSTANCE)]
        id: String,
        /// JSON array of tasks ({"id", "title", "depends_on", "prompt", "role"})
        #[arg(long)]
        file: PathBuf,
    },

    /// Report a task as done (or failed)
    Complete {
        #[arg(long)]
        repo: String,
        #[arg(long, default_value = CLI_INSTANCE)]
        id: String,
        #[arg(long)]
        task: String,
        #[arg(long)]
        failed: bool,
        #[arg(long, default_value = "")]
        error: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            program,
            max_instances,
            log_file,
        } => {
            hivemind_log::init(if log_file {
                LogMode::File("brain")
            } else {
                LogMode::Daemon
            });
            let options = serve::ServeOptions {
                config_path: config,
                socket: cli.socket,
                program,
                max_instances,
            };
            serve::run(options).await
        }
        command => {
            hivemind_log::init(LogMode::Command("hivemind_cli"));
            run_client(cli.socket, command).await
        }
    }
}

async fn run_client(socket: Option<PathBuf>, command: Commands) -> Result<()> {
    if let Commands::Config(ConfigCommands::Init { path, force }) = command {
        return config_init(path, force);
    }

    let socket = match socket {
        Some(path) => path,
        None => BrainConfig::load_or_default(&BrainConfig::default_path())?.socket_path_expanded(),
    };
    let client = Client::new(socket);

    match command {
        Commands::Ping => {
            client.ping().await?;
            println!("ok");
        }
        Commands::State { repo, id } => {
            print_json(&client.get_state(&repo, &id).await?)?;
        }
        Commands::Status {
            repo,
            id,
            feature,
            files,
            role,
        } => {
            let result = client
                .update_status(&repo, &id, &feature, &files, role.as_deref())
                .await?;
            for conflict in &result.conflicts {
                eprintln!("warning: {conflict}");
            }
        }
        Commands::Send {
            repo,
            id,
            to,
            content,
        } => {
            client.send_message(&repo, &id, &to, &content).await?;
        }
        Commands::Workflow(cmd) => run_workflow(&client, cmd).await?,
        Commands::Watch {
            types,
            instances,
            parent,
            timeout,
        } => {
            let filter = EventFilter {
                types: types.iter().map(|t| EventType::from_wire(t)).collect(),
                instances,
                parent_title: parent.unwrap_or_default(),
            };
            watch(&client, &filter, Duration::from_secs(timeout)).await?;
        }
        Commands::Serve { .. } | Commands::Config(_) => {}
    }
    Ok(())
}

async fn run_workflow(client: &Client, cmd: WorkflowCommands) -> Result<()> {
    match cmd {
        WorkflowCommands::Show { repo } => {
            print_json(&client.get_workflow(&repo, CLI_INSTANCE).await?)?;
        }
        WorkflowCommands::Define { repo, id, file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read tasks from {}", file.display()))?;
            let tasks: Vec<WorkflowTask> = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse tasks from {}", file.display()))?;
            print_json(&client.define_workflow(&repo, &id, &tasks).await?)?;
        }
        WorkflowCommands::Complete {
            repo,
            id,
            task,
            failed,
            error,
        } => {
            let status = if failed {
                TaskStatus::Failed
            } else {
                TaskStatus::Done
            };
            print_json(&client.complete_task(&repo, &id, &task, status, &error).await?)?;
        }
    }
    Ok(())
}

async fn watch(client: &Client, filter: &EventFilter, wait: Duration) -> Result<()> {
    let subscriber_id = client.subscribe(filter).await?;
    tracing::info!(subscriber = %subscriber_id, "Watching events");

    let result = stream_events(client, &subscriber_id, wait).await;

    if let Err(e) = client.unsubscribe(&subscriber_id).await {
        tracing::warn!(error = %e, "Failed to unsubscribe");
    }
    result
}

async fn stream_events(client: &Client, subscriber_id: &str, wait: Duration) -> Result<()> {
    loop {
        let events = tokio::select! {
            _ = serve::shutdown_signal() => return Ok(()),
            polled = client.poll_events(subscriber_id, wait) => polled?,
        };
        for event in events {
            println!("{}", serde_json::to_string(&event)?);
        }
    }
}

fn config_init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let path = path.unwrap_or_else(BrainConfig::default_path);
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    BrainConfig::default().save(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
