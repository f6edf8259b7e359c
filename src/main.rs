use anyhow::Context;
use clap::{Parser, Subcommand};
use scrollback::config::{Config, ScrapeConfig};
use scrollback::db::Database;
use scrollback::models::{JobStatus, ScrapeType};
use scrollback::source::DiscordApiSource;
use scrollback::{ScrapeError, ScrapeOrchestrator, ThreadReconstructor};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Archives Discord channel history into SQLite and rebuilds reply threads.
#[derive(Parser, Debug)]
#[command(name = "scrollback", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database tables if they do not exist.
    InitDb,
    /// Drop every table and recreate an empty database.
    ResetDb {
        /// Required; the reset deletes all archived data.
        #[arg(long)]
        yes: bool,
    },
    /// Check the scrape config file and print what it covers.
    ValidateConfig,
    /// Scrape channels. With no channel ids, every configured channel is scraped.
    Scrape {
        channels: Vec<String>,
        #[arg(long = "type", default_value = "full")]
        scrape_type: ScrapeType,
    },
    /// Continue an interrupted job in a new, linked job.
    Resume { job_id: i64 },
    /// Show one job.
    Status { job_id: i64 },
    /// List jobs, newest first.
    Jobs {
        #[arg(long)]
        status: Option<JobStatus>,
    },
    /// List stored messages of a channel, newest first.
    Messages {
        channel_id: String,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Print the reply thread rooted at a message.
    Thread { message_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    run(cli.command, &config).await
}

async fn run(command: Commands, config: &Config) -> anyhow::Result<()> {
    match command {
        Commands::ValidateConfig => validate_config(config)?,
        Commands::InitDb => {
            open_database(config)?;
            info!("Database ready at {}", config.database_url);
        }
        Commands::ResetDb { yes } => {
            if !yes {
                anyhow::bail!("refusing to reset without --yes");
            }
            open_database(config)?.reset()?;
            warn!("Database at {} was reset", config.database_url);
        }
        Commands::Scrape {
            channels,
            scrape_type,
        } => {
            let scrape_config = ScrapeConfig::load(&config.scrape_config_path)?;
            let channels = if channels.is_empty() {
                scrape_config
                    .servers
                    .iter()
                    .flat_map(|s| s.channels.iter().map(|c| c.id.clone()))
                    .collect()
            } else {
                channels
            };
            let db = open_database(config)?;
            let orchestrator = build_orchestrator(config, &db, scrape_config)?;
            orchestrator.recover_stale_jobs().await?;
            let cancel = cancel_on_ctrl_c();

            let mut failures = 0;
            for channel_id in channels {
                if cancel.is_cancelled() {
                    break;
                }
                let job_id = match orchestrator.create_job(&channel_id, scrape_type).await {
                    Ok(job_id) => job_id,
                    Err(e) => {
                        error!("Cannot scrape channel {}: {}", channel_id, e);
                        failures += 1;
                        continue;
                    }
                };
                match orchestrator
                    .execute_job_with_cancel(job_id, cancel.clone())
                    .await
                {
                    Ok(job) => print_json(&job)?,
                    Err(ScrapeError::Cancelled) => {
                        warn!("Job {} interrupted; resume with `scrollback resume {}`", job_id, job_id);
                        break;
                    }
                    Err(e) => {
                        error!("Scrape of channel {} failed: {}", channel_id, e);
                        failures += 1;
                    }
                }
            }
            if failures > 0 {
                anyhow::bail!("{} scrape job(s) failed", failures);
            }
        }
        Commands::Resume { job_id } => {
            let scrape_config = ScrapeConfig::load(&config.scrape_config_path)?;
            let db = open_database(config)?;
            let orchestrator = build_orchestrator(config, &db, scrape_config)?;
            orchestrator.recover_stale_jobs().await?;
            let job = orchestrator.resume_job(job_id).await?;
            print_json(&job)?;
        }
        Commands::Status { job_id } => {
            let job = open_database(config)?
                .get_job(job_id)?
                .ok_or(ScrapeError::JobNotFound(job_id))?;
            print_json(&job)?;
        }
        Commands::Jobs { status } => {
            print_json(&open_database(config)?.list_jobs(status)?)?;
        }
        Commands::Messages {
            channel_id,
            limit,
            offset,
        } => {
            let db = open_database(config)?;
            print_json(&db.get_messages_by_channel(&channel_id, limit, offset)?)?;
        }
        Commands::Thread { message_id } => {
            let view = ThreadReconstructor::new(open_database(config)?)
                .thread_view(&message_id)?
                .with_context(|| format!("Message not found: {}", message_id))?;
            print_json(&view)?;
        }
    }

    Ok(())
}

fn open_database(config: &Config) -> anyhow::Result<Database> {
    if config.database_url != ":memory:" {
        if let Some(parent) = Path::new(&config.database_url).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }
    }

    let db = Database::new(config).context("Failed to open database")?;
    db.execute_init().context("Failed to initialize database")?;
    Ok(db)
}

fn build_orchestrator(
    config: &Config,
    db: &Database,
    scrape_config: ScrapeConfig,
) -> anyhow::Result<ScrapeOrchestrator> {
    let source = DiscordApiSource::from_config(config, &scrape_config.scraping)?;
    let settings = scrape_config.scraping.clone();
    Ok(ScrapeOrchestrator::new(
        db.clone(),
        Arc::new(scrape_config),
        Arc::new(source),
        settings,
    ))
}

fn validate_config(config: &Config) -> anyhow::Result<()> {
    let scrape_config = ScrapeConfig::load(&config.scrape_config_path)?;
    info!(
        "{} is valid: {} server(s), {} channel(s)",
        config.scrape_config_path,
        scrape_config.servers.len(),
        scrape_config.channel_count()
    );
    for server in &scrape_config.servers {
        println!("{} ({})", server.name, server.id);
        for channel in &server.channels {
            println!("  #{} ({})", channel.name, channel.id);
        }
    }
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping the current scrape");
            trigger.cancel();
        }
    });
    token
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
