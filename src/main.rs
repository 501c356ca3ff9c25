use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "code-sentinel")]
#[command(version, about = "Autonomous bug-testing agent for Node.js repositories")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to sentinel.toml. A missing file means defaults.
    #[arg(
        short,
        long,
        global = true,
        env = "SENTINEL_CONFIG",
        default_value = code_sentinel::config::DEFAULT_CONFIG_FILE
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP service and resume unfinished jobs
    Serve {
        /// Port to serve on (overrides [server].port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind (overrides [server].host)
        #[arg(long)]
        host: Option<String>,
    },
    /// Run one job in the foreground and print its report
    Run {
        /// GitHub repository URL
        repo_url: String,

        /// Description of the bug to reproduce
        bug: String,

        /// External user id the job is recorded under
        #[arg(long, default_value = "cli")]
        user: String,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a job and its report
    Status {
        job_id: i64,

        #[arg(long)]
        json: bool,
    },
    /// List recent jobs
    List {
        /// Only jobs in this status (e.g. TESTING, FAILED)
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
    /// Cancel an active job
    Cancel { job_id: i64 },
    /// Compare the bugs found by two runs of the same repository
    Compare { base: i64, target: i64 },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and list any problems
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let config = code_sentinel::config::Config::load(&cli.config)?;
    let _guard = code_sentinel::logging::init(&config.logging, cli.verbose);

    match &cli.command {
        Commands::Serve { port, host } => {
            cmd::cmd_serve(config, *port, host.clone()).await?;
        }
        Commands::Run {
            repo_url,
            bug,
            user,
            json,
        } => {
            cmd::cmd_run(&config, repo_url, bug, user, *json).await?;
        }
        Commands::Status { job_id, json } => cmd::cmd_status(&config, *job_id, *json).await?,
        Commands::List { status, limit } => {
            cmd::cmd_list(&config, status.as_deref(), *limit).await?
        }
        Commands::Cancel { job_id } => cmd::cmd_cancel(&config, *job_id).await?,
        Commands::Compare { base, target } => cmd::cmd_compare(&config, *base, *target).await?,
        Commands::Config { command } => cmd::cmd_config(&cli.config, &config, command.clone())?,
    }

    Ok(())
}
