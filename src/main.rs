//! # Main — CLI Entry Point for the Crowd-Mapping Workers
//!
//! Routes subcommands to the batch jobs in the `crowdmap` library. Each job
//! runs once, or repeatedly with `--schedule`.
//!
//! ## Subcommands
//!
//! - `create-projects`: turn pending drafts into projects in both stores
//! - `synchronize` (alias `transfer-results`): move results into the
//!   relational store, then refresh users and project metadata
//! - `delete` / `archive`: remove or archive projects in both stores
//! - `partition`: offline preview of the grid for a GeoJSON AOI
//! - `init-db`: apply the relational schema
//!
//! ## Global Options
//!
//! - `--environment production|development`: selects `.env.{environment}`
//! - `--config`: optional TOML configuration file
//! - `--schedule m|h|d`: repeat every 10 minutes, hourly or daily
//!
//! Per-project failures are logged and reported but do not change the exit
//! code; only configuration and startup failures exit non-zero.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use crowdmap::config::Environment;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "crowdmap", version, about = "Partition crowd-mapping projects and keep both stores in sync")]
struct Cli {
    /// Deployment environment; selects the `.env.{environment}` file
    #[arg(long, value_enum, global = true, default_value_t = Environment::Development, env = "CROWDMAP_ENVIRONMENT")]
    environment: Environment,

    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Repeat the command: every 10 minutes (m), hourly (h) or daily (d)
    #[arg(long, value_enum, global = true)]
    schedule: Option<Schedule>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Schedule {
    M,
    H,
    D,
}

impl Schedule {
    fn interval(self) -> Duration {
        match self {
            Schedule::M => Duration::from_secs(10 * 60),
            Schedule::H => Duration::from_secs(60 * 60),
            Schedule::D => Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create projects from pending drafts
    CreateProjects {
        /// Only these draft ids (defaults to every draft)
        #[arg(long = "project-id")]
        project_ids: Vec<String>,
    },
    /// Transfer results, then update user and project data
    #[command(alias = "transfer-results")]
    Synchronize {
        /// Only these projects (defaults to every project with results)
        #[arg(long = "project-id")]
        project_ids: Vec<String>,
        /// Projects transferred concurrently (overrides SYNC_WORKERS)
        #[arg(long)]
        workers: Option<usize>,
        /// Skip the user import after the transfer
        #[arg(long)]
        skip_user_data: bool,
        /// Skip the project metadata refresh after the transfer
        #[arg(long)]
        skip_project_data: bool,
    },
    /// Delete projects from both stores
    Delete {
        /// Project ids
        #[arg(long = "project-id", required = true)]
        project_ids: Vec<String>,
    },
    /// Archive projects: purge live data, keep relational history
    Archive {
        /// Project ids
        #[arg(long = "project-id", required = true)]
        project_ids: Vec<String>,
    },
    /// Partition a GeoJSON AOI and print the groups as GeoJSON
    Partition {
        /// GeoJSON file (FeatureCollection, Feature or geometry)
        #[arg(long)]
        file: PathBuf,
        /// Tile zoom level
        #[arg(long, default_value_t = 18)]
        zoom: i64,
        /// Maximum group width in tiles
        #[arg(long, default_value_t = crowdmap::project::DEFAULT_GRID_GROUP_WIDTH)]
        group_width: u32,
        /// Write the GeoJSON here instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Create the relational tables if missing
    InitDb,
}

fn main() -> Result<()> {
    // Initialize structured logging: LOG_FORMAT=json for log shipping, human-readable otherwise
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();

    match &cli.command {
        Commands::Partition {
            file,
            zoom,
            group_width,
            output,
        } => cli::run_partition(file, *zoom, *group_width, output.as_deref()),
        _ => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cli::run_job(&cli))
        }
    }
}
