mod api;
mod collector;
mod config;
mod fetcher;
mod model;
mod stats;
mod store;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use crate::{config::Settings, fetcher::PriceFetcher, store::SqliteStore};

#[derive(Debug, Parser)]
#[command(name = "coinpulse", version)]
struct Cli {
    /// Override PORT for the query API
    #[arg(long)]
    port: Option<u16>,

    /// Run a single fetch cycle, print the rows written and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let mut settings = Settings::load()?;
    if let Some(p) = cli.port {
        settings.api_port = p;
    }

    let store = SqliteStore::open(&settings.sqlite_path)?;
    store.init_db()?;
    let fetcher = Arc::new(PriceFetcher::new(&settings)?);

    log::info!(
        "app.start sqlite={} upstream={} cron=\"{}\" tz={}",
        store.path(),
        settings.price_api_base_url,
        settings.schedule_cron,
        settings.schedule_tz
    );

    if cli.once {
        let rows = collector::run_cycle(&fetcher, &store, settings.fetch_max_attempts).await?;
        println!("{rows}");
        return store.close();
    }

    let mut scheduler = collector::start(&settings, fetcher, store.clone()).await?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("app.signal.error {}", e);
        }
        log::info!("app.shutdown");
    };
    let served = api::serve(&settings, store.clone(), shutdown).await;

    if let Err(e) = scheduler.shutdown().await {
        log::warn!("collector.shutdown.error {}", e);
    }
    store.close()?;
    served
}
