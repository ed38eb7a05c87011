use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use suumo_storage::{SnapshotReader, SnapshotStore};
use suumo_sync::{
    report_daily_markdown, CategoryRegistry, FixtureSource, Registration, ScheduleFailure,
    ScheduleRegistry, SyncConfig, SyncPipeline, SyncRunSummary,
};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "suumo-cli")]
#[command(about = "SUUMO station listing collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape every enabled category once and record today's snapshot.
    Run {
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Read `<dir>/<category>/*.html` instead of fetching SUUMO.
        #[arg(long)]
        fixtures: Option<PathBuf>,
        /// Observation date (YYYY-MM-DD); defaults to today in local time.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Create the database, apply migrations and finish any interrupted write.
    Migrate {
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Serve the read-only dashboard.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Print a markdown digest of the most recent runs.
    Report {
        #[arg(long, default_value_t = 7)]
        runs: usize,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },
}

#[derive(Debug, Subcommand)]
enum ScheduleCommand {
    /// Add or replace a daily run at HH:MM local time.
    Register {
        name: String,
        #[arg(long)]
        at: String,
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    Unregister {
        name: String,
    },
    List,
    /// Run registered schedules in the foreground until Ctrl-C.
    Daemon,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env().context("reading SUUMO_* configuration")?;

    let Some(command) = cli.command else {
        let summary = suumo_sync::run_sync_once_from_env().await?;
        return print_summary(&summary);
    };

    match command {
        Commands::Run {
            output_dir,
            fixtures,
            date,
        } => {
            let config = override_output(config, output_dir);
            let pipeline = match fixtures {
                Some(dir) => {
                    let registry = CategoryRegistry::load_or_default(&config.categories_path()).await?;
                    SyncPipeline::from_parts(config, registry, Box::new(FixtureSource::new(dir)))?
                }
                None => SyncPipeline::new(config).await?,
            };
            let summary = match date {
                Some(date) => pipeline.run_once_on(date).await?,
                None => pipeline.run_once().await?,
            };
            print_summary(&summary)?;
        }
        Commands::Migrate { output_dir } => {
            let config = override_output(config, output_dir);
            let store = SnapshotStore::open(&config.output_dir).await?;
            println!(
                "database ready: {} ({} committed runs)",
                store.layout().database_path().display(),
                store.list_runs().await?.len()
            );
        }
        Commands::Serve { port, output_dir } => {
            let config = override_output(config, output_dir);
            let port = port.unwrap_or(config.web_port);
            let state = suumo_web::AppState::new(config.output_dir, config.workspace_root);
            suumo_web::serve(state, port).await?;
        }
        Commands::Report { runs, output_dir } => {
            let config = override_output(config, output_dir);
            let reader = SnapshotReader::open(&config.output_dir);
            print!("{}", report_daily_markdown(&reader, runs).await?);
        }
        Commands::Schedule { command } => schedule(command, config).await?,
    }

    Ok(())
}

fn override_output(config: SyncConfig, output_dir: Option<PathBuf>) -> SyncConfig {
    match output_dir {
        Some(dir) => config.with_output_dir(dir),
        None => config,
    }
}

fn print_summary(summary: &SyncRunSummary) -> Result<()> {
    println!(
        "run complete: observed_at={} listings={} drafts={} filtered_out={} duplicates={}",
        summary.observed_at,
        summary.listings,
        summary.drafts,
        summary.filtered_out,
        summary.duplicates_collapsed
    );
    println!("{}", serde_json::to_string_pretty(summary)?);
    Ok(())
}

async fn schedule(command: ScheduleCommand, config: SyncConfig) -> Result<()> {
    let mut registry = ScheduleRegistry::load(&config.schedule_file).await?;
    match command {
        ScheduleCommand::Register {
            name,
            at,
            output_dir,
        } => {
            let output_dir = output_dir.unwrap_or_else(|| config.output_dir.clone());
            let outcome = registry.register(&name, &at, &output_dir).await?;
            let verb = match outcome {
                Registration::Created => "registered",
                Registration::Replaced => "updated",
            };
            println!("{verb} `{name}`: daily at {at} -> {}", output_dir.display());
        }
        ScheduleCommand::Unregister { name } => match registry.unregister(&name).await {
            Ok(()) => println!("unregistered `{name}`"),
            Err(ScheduleFailure::NotFound(name)) => {
                warn!(schedule = %name, "no such schedule; nothing to unregister");
            }
            Err(err) => return Err(err.into()),
        },
        ScheduleCommand::List => {
            if registry.entries().is_empty() {
                println!("no schedules in {}", registry.path().display());
            }
            for entry in registry.entries() {
                println!("{}\t{}\t{}", entry.name, entry.at, entry.output_dir.display());
            }
        }
        ScheduleCommand::Daemon => suumo_sync::schedule::run_daemon(&registry, &config).await?,
    }
    Ok(())
}
