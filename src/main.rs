use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "anvil")]
#[command(version, about = "Bounded-retry build factory")]
pub struct Cli {
    /// Log at debug level regardless of configuration
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory holding .anvil/ (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the build status server
    Serve {
        /// Address to bind
        #[arg(long, env = "ANVIL_HOST")]
        host: Option<String>,

        /// Port to serve on
        #[arg(short, long, env = "ANVIL_PORT")]
        port: Option<u16>,

        /// Database path
        #[arg(long, env = "ANVIL_DB_PATH")]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS)
        #[arg(long)]
        dev: bool,
    },
    /// Create .anvil/ with a default anvil.toml, database and workspace root
    Init,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default anvil.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Serve {
            host,
            port,
            db_path,
            dev,
        } => {
            cmd::cmd_serve(
                &project_dir,
                cli.verbose,
                host.clone(),
                *port,
                db_path.clone(),
                *dev,
            )
            .await?;
        }
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
