mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use csps_common::MigrationId;
use csps_config::{AppConfig, ConfigLoader, DatabaseDriver};
use csps_db::history::csps_history;
use csps_db::{Migrator, MigratorSettings, Target};
use csps_display::{mission_status_info, report_status_info};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "csps", version, about = "CSPS schema migrations and status labels")]
struct Cli {
    /// Config file (.yml, .yaml or .toml); environment variables override it
    #[arg(short, long, global = true, env = "CSPS_CONFIG")]
    config: Option<PathBuf>,

    /// Run against a SQLite database file instead of MySQL
    #[arg(long, global = true)]
    sqlite: Option<PathBuf>,

    /// Debug logging, including every executed statement
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(flatten)]
    Migrate(MigrateCommand),
    /// Print the display label for a status code
    Label {
        #[arg(value_enum)]
        domain: Domain,
        code: String,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum MigrateCommand {
    /// Apply pending migrations
    Up {
        /// Stop after this migration identifier
        #[arg(long)]
        to: Option<MigrationId>,
        /// Print the statements that would run, without running them
        #[arg(long)]
        dry_run: bool,
    },
    /// Revert the most recently applied migrations
    Down {
        #[arg(long, default_value_t = 1)]
        steps: usize,
    },
    /// Show applied and pending migrations
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Clear a migration lock left behind by a crashed run
    Unlock,
}

#[derive(Clone, Copy, ValueEnum)]
enum Domain {
    Mission,
    Report,
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

fn load_config(file: &Option<PathBuf>, sqlite: &Option<PathBuf>) -> Result<AppConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = file {
        loader = loader.with_file(path);
    }
    let mut config = loader.load().context("failed to load configuration")?;
    if let Some(path) = sqlite {
        config.database.driver = DatabaseDriver::Sqlite;
        config.database.sqlite_path = Some(path.clone());
    }
    Ok(config)
}

fn print_label(domain: Domain, code: &str, json: bool) -> Result<()> {
    let descriptor = match domain {
        Domain::Mission => mission_status_info(code),
        Domain::Report => report_status_info(code),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&descriptor)?);
    } else {
        output::print_label(code, &descriptor);
    }
    Ok(())
}

async fn migrate(command: MigrateCommand, config: &AppConfig) -> Result<()> {
    let driver = csps_db::connect(config)
        .await
        .with_context(|| format!("cannot reach {}", config.database.display_target()))?;
    let mut migrator = Migrator::new(
        driver,
        csps_history(),
        MigratorSettings::from(&config.migrations),
    )?;

    match command {
        MigrateCommand::Up { to, dry_run } => {
            let target = to.map(Target::UpTo).unwrap_or_default();
            if dry_run {
                let plan = migrator.pending(target).await?;
                output::print_plan(&plan);
            } else {
                let report = migrator.up(target).await?;
                output::print_run(&report);
            }
        }
        MigrateCommand::Down { steps } => {
            let reverted = migrator.down(steps).await?;
            output::print_reverted(&reverted);
        }
        MigrateCommand::Status { json } => {
            let status = migrator.status().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                output::print_status(&status, &config.database.display_target());
            }
        }
        MigrateCommand::Unlock => {
            migrator.force_unlock().await?;
            info!("migration lock `{}` cleared", config.migrations.lock_name);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match cli.command {
        Command::Label { domain, code, json } => print_label(domain, &code, json),
        Command::Migrate(command) => {
            let config = load_config(&cli.config, &cli.sqlite)?;
            migrate(command, &config).await
        }
    }
}
