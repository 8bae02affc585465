use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use pepper_bot::{BotConfig, BotHandler, ChatNotifier, TelegramClient};
use pepper_core::SystemClock;
use pepper_storage::{MemoryStore, PgStore, Store};
use pepper_sync::{Dispatcher, PipelineScheduler, ScrapePipeline, SyncConfig};
use pepper_web::{AppState, WebConfig};

#[derive(Debug, Parser)]
#[command(name = "pepper")]
#[command(about = "PepperBot discount tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// HTTP API, periodic jobs and the Telegram bot.
    Serve,
    /// Run one scrape and print its summary.
    Scrape,
    /// Run one notification dispatch pass.
    Dispatch,
    /// Apply database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let sync_config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(sync_config).await?,
        Commands::Scrape => {
            let store = open_store(&sync_config).await?;
            let pipeline = ScrapePipeline::from_config(&sync_config, store)?;
            let summary = pipeline.run_once().await;
            println!(
                "scrape complete: run_id={} status={:?} parsed={} inserted={} updated={}",
                summary.run_id, summary.status, summary.parsed, summary.inserted, summary.updated
            );
        }
        Commands::Dispatch => {
            let store = open_store(&sync_config).await?;
            let Some(client) = telegram_client()? else {
                bail!("TELEGRAM_BOT_TOKEN is required to dispatch notifications");
            };
            let dispatcher = Dispatcher::new(
                store,
                Arc::new(SystemClock),
                Arc::new(ChatNotifier::new(client)),
            );
            let summary = dispatcher.run_pass().await?;
            println!(
                "dispatch complete: deals={} filters={} matches={} created={} send_failures={}",
                summary.deals,
                summary.filters,
                summary.matches,
                summary.created,
                summary.send_failures
            );
        }
        Commands::Migrate => {
            let Some(url) = sync_config.database_url.as_deref() else {
                bail!("DATABASE_URL is required to run migrations");
            };
            PgStore::connect(url).await?.migrate().await?;
            println!("migrations applied");
        }
    }

    Ok(())
}

async fn open_store(config: &SyncConfig) -> Result<Arc<dyn Store>> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = PgStore::connect(url).await.context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store, data will not persist");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn telegram_client() -> Result<Option<Arc<TelegramClient>>> {
    let config = BotConfig::from_env();
    if config.token.is_none() {
        return Ok(None);
    }
    Ok(Some(Arc::new(TelegramClient::new(&config)?)))
}

async fn serve(sync_config: SyncConfig) -> Result<()> {
    let store = open_store(&sync_config).await?;
    let client = telegram_client()?;

    let dispatcher = client.as_ref().map(|client| {
        Arc::new(Dispatcher::new(
            store.clone(),
            Arc::new(SystemClock),
            Arc::new(ChatNotifier::new(client.clone())),
        ))
    });
    let pipeline = Arc::new(ScrapePipeline::from_config(&sync_config, store.clone())?);
    let scheduler = Arc::new(PipelineScheduler::new(&sync_config, pipeline, dispatcher));
    if sync_config.scheduler_enabled {
        scheduler.start().await?;
    } else {
        info!("periodic jobs disabled by PEPPER_SCHEDULER_ENABLED");
    }

    let bot_task = match client {
        Some(client) => {
            let handler = Arc::new(BotHandler::new(store.clone(), client.clone()));
            Some(tokio::spawn(pepper_bot::run_polling(client, handler)))
        }
        None => {
            warn!("TELEGRAM_BOT_TOKEN not set; bot and notification dispatch disabled");
            None
        }
    };

    let served = pepper_web::serve(AppState::new(store, scheduler.clone(), WebConfig::from_env())).await;

    if let Some(task) = bot_task {
        task.abort();
    }
    scheduler.shutdown().await?;
    served
}
