//! CLI commands

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::core::AppState;
use crate::mcp::McpServer;
use crate::session::MessageRole;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Orchestration engine for concurrent agent conversation sessions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ~/.conductor/config.yml)
    #[arg(long)]
    config: Option<String>,

    /// Database path, overriding the config file
    #[arg(long)]
    database: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List sessions
    Sessions {
        /// Filter by workspace ID
        #[arg(long)]
        workspace_id: Option<String>,
    },

    /// Show a session and its messages
    Show {
        /// Session ID
        session_id: String,

        /// Only print the last N messages
        #[arg(long)]
        tail: Option<usize>,
    },

    /// Delete a session
    Delete {
        /// Session ID
        session_id: String,
    },

    /// List all workspaces
    Workspaces,

    /// Create a new workspace
    CreateWorkspace {
        /// Workspace name
        name: String,

        /// Project root the agents work in
        #[arg(long)]
        root_path: Option<String>,
    },

    /// Print the effective configuration
    Config,

    /// Start the MCP tool server
    Serve {
        /// Port number (default from config)
        #[arg(long)]
        port: Option<u16>,

        /// Keep everything in memory
        #[arg(long)]
        ephemeral: bool,
    },
}

fn short(id: &str) -> String {
    id.chars().take(8).collect()
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(database) = cli.database {
        config.database_path = database;
    }

    // Create a multi-threaded runtime for CLI operations
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        match cli.command {
            Commands::Config => {
                print!("{}", serde_yaml::to_string(&config)?);
                Ok(())
            }

            Commands::Serve { port, ephemeral } => {
                let state = if ephemeral {
                    AppState::ephemeral(config).await?
                } else {
                    AppState::open(config).await?
                };
                let manager = state.session_manager.clone();

                let mut server = McpServer::new(state);
                if let Some(port) = port {
                    server = server.with_port(port);
                }

                tokio::select! {
                    result = server.run() => result?,
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("Shutting down, flushing pending writes");
                    }
                }
                manager.flush_all().await;
                Ok(())
            }

            command => {
                let state = AppState::open(config).await?;
                run_local(&state, command).await
            }
        }
    })
}

async fn run_local(state: &AppState, command: Commands) -> Result<()> {
    let manager = &state.session_manager;

    match command {
        Commands::Sessions { workspace_id } => {
            let sessions = manager.list_sessions(workspace_id.as_deref());
            if sessions.is_empty() {
                println!("No sessions found");
            }
            for session in sessions {
                println!(
                    "[{}] {} - {} ({}){}",
                    short(&session.id),
                    session.name.as_deref().unwrap_or("(unnamed)"),
                    short(&session.workspace_id),
                    session.permission_mode.as_str(),
                    session
                        .parent_id
                        .as_deref()
                        .map(|p| format!(" child of {}", short(p)))
                        .unwrap_or_default()
                );
            }
        }

        Commands::Show { session_id, tail } => {
            let info = manager.session_info(&session_id)?;
            let messages = manager.messages(&session_id).await?;
            println!("{}", serde_json::to_string_pretty(&info)?);

            let skip = tail.map_or(0, |n| messages.len().saturating_sub(n));
            for message in messages.iter().skip(skip) {
                let label = match message.role {
                    MessageRole::Tool => format!("tool:{}", message.tool_name.as_deref().unwrap_or("?")),
                    role => role.as_str().to_string(),
                };
                println!("\n--- {} ---\n{}", label, message.content);
            }
        }

        Commands::Delete { session_id } => {
            manager.delete_session(&session_id).await?;
            println!("Deleted session: {}", session_id);
        }

        Commands::Workspaces => {
            let workspaces = state.workspaces().list().await?;
            if workspaces.is_empty() {
                println!("No workspaces found");
            }
            for workspace in workspaces {
                println!(
                    "[{}] {} - {}",
                    short(&workspace.id),
                    workspace.name,
                    workspace.root_path.as_deref().unwrap_or("-")
                );
            }
        }

        Commands::CreateWorkspace { name, root_path } => {
            let workspace = state
                .workspaces()
                .create(name, root_path)
                .await
                .context("Failed to create workspace")?;
            println!("Created workspace: {} ({})", workspace.name, workspace.id);
        }

        // Handled in `run` without opening the database
        Commands::Config | Commands::Serve { .. } => {}
    }

    manager.flush_all().await;
    Ok(())
}
