use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use recur::config::Config;
use recur::models::SeriesStatus;

mod commands;

#[derive(Parser)]
#[command(
    name = "recur",
    version,
    about = "Recurring billing document scheduler",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); environment variables are used otherwise
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the configuration
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler loop until interrupted
    Run,

    /// Run a single generation tick plus notifications
    Tick {
        /// Evaluate as of this instant instead of now (RFC 3339)
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Send upcoming-due notifications once
    Notify {
        /// Override the lookahead window in hours
        #[arg(long)]
        lookahead_hours: Option<u32>,
    },

    /// Project expected amounts over the next months
    Forecast {
        /// Number of months to project
        #[arg(short, long, default_value = "6")]
        months: u32,

        /// Print JSON instead of a table
        #[arg(long, default_value = "false")]
        json: bool,
    },

    /// Preview the next occurrences of a series
    Upcoming {
        /// Series ID
        id: String,

        /// Number of occurrences to list
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Create a recurring series
    Create(commands::CreateArgs),

    /// Update the configuration of a series
    Update(commands::UpdateArgs),

    /// List series
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<SeriesStatus>,

        /// Filter by team
        #[arg(short, long)]
        team: Option<String>,

        /// Maximum number of series
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Show a series and its generated documents
    Show {
        /// Series ID
        id: String,
    },

    /// Show where a generated document sits in its series
    Document {
        /// Document ID
        id: String,
    },

    /// Pause an active series
    Pause {
        /// Series ID
        id: String,
    },

    /// Resume a paused series
    Resume {
        /// Series ID
        id: String,
    },

    /// Cancel a series
    Cancel {
        /// Series ID
        id: String,
    },

    /// Print Prometheus metrics after an optional tick
    Metrics {
        /// Run one tick first so the output has values
        #[arg(long, default_value = "false")]
        tick: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref())?;

    // Initialize tracing/logging
    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    tracing::info!(
        database = %config.database.sqlite_path.display(),
        "recur starting"
    );

    match cli.command {
        Commands::Run => {
            tracing::info!(
                tick_interval_secs = config.scheduler.tick_interval_secs,
                "Starting run command"
            );
            commands::run(config).await?;
        }

        Commands::Tick { at } => {
            tracing::info!(at = ?at, "Starting tick command");
            commands::tick(config, at.unwrap_or_else(Utc::now)).await?;
        }

        Commands::Notify { lookahead_hours } => {
            tracing::info!(lookahead_hours = ?lookahead_hours, "Starting notify command");
            commands::notify(config, lookahead_hours).await?;
        }

        Commands::Forecast { months, json } => {
            tracing::info!(months = %months, "Starting forecast command");
            commands::forecast(config, months, json)?;
        }

        Commands::Upcoming { id, limit } => {
            commands::upcoming(config, &id, limit)?;
        }

        Commands::Create(args) => {
            tracing::info!(
                team = %args.team,
                frequency = %args.frequency,
                "Starting create command"
            );
            commands::create(config, args)?;
        }

        Commands::Update(args) => {
            tracing::info!(series_id = %args.id, "Starting update command");
            commands::update(config, args)?;
        }

        Commands::List {
            status,
            team,
            limit,
        } => {
            commands::list(config, status, team, limit)?;
        }

        Commands::Show { id } => {
            commands::show(config, &id)?;
        }

        Commands::Document { id } => {
            commands::document(config, &id)?;
        }

        Commands::Pause { id } => {
            commands::pause(config, &id)?;
        }

        Commands::Resume { id } => {
            commands::resume(config, &id)?;
        }

        Commands::Cancel { id } => {
            commands::cancel(config, &id)?;
        }

        Commands::Metrics { tick } => {
            commands::metrics(config, tick).await?;
        }
    }

    tracing::info!("recur completed successfully");
    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("recur=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("recur={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
