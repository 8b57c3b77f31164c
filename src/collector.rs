use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::{
    config::Settings,
    fetcher::PriceFetcher,
    model::{Coin, PriceSnapshot},
    store::SqliteStore,
};

/// One fetch-and-persist cycle. Returns how many rows were written.
///
/// A fetch that yields no data is skipped, not an error. Rows are written one by
/// one under a shared capture time; the first failed write stops the rest and
/// earlier rows stay in place.
pub async fn run_cycle(fetcher: &PriceFetcher, store: &SqliteStore, max_attempts: u32) -> Result<usize> {
    let Some(quotes) = fetcher.fetch(max_attempts).await else {
        log::warn!("collector.skip reason=no_data");
        return Ok(0);
    };

    let captured_at = Utc::now();
    let snapshots = Coin::all()
        .map(|coin| {
            let quote = quotes.get(&coin).copied().unwrap_or_default();
            PriceSnapshot::from_quote(coin, &quote, captured_at)
        })
        .collect::<Vec<_>>();

    let store = store.clone();
    let written = tokio::task::spawn_blocking(move || -> Result<usize> {
        let mut n = 0;
        for snap in &snapshots {
            store.insert_snapshot(snap)?;
            n += 1;
        }
        Ok(n)
    })
    .await
    .context("collector write task")??;

    log::info!("collector.saved rows={} captured_at={}", written, captured_at.to_rfc3339());
    Ok(written)
}

async fn run_logged(fetcher: &PriceFetcher, store: &SqliteStore, max_attempts: u32) {
    if let Err(e) = run_cycle(fetcher, store, max_attempts).await {
        log::error!("collector.error {:#}", e);
    }
}

/// Registers the fetch cycle on the configured cron schedule and starts it.
pub async fn start(settings: &Settings, fetcher: Arc<PriceFetcher>, store: SqliteStore) -> Result<JobScheduler> {
    let tz = settings.schedule_tz()?;
    let max_attempts = settings.fetch_max_attempts;

    if settings.fetch_on_start {
        let fetcher = fetcher.clone();
        let store = store.clone();
        tokio::spawn(async move { run_logged(&fetcher, &store, max_attempts).await });
    }

    let scheduler = JobScheduler::new().await?;
    let job = Job::new_async_tz(settings.schedule_cron.as_str(), tz, move |_uuid, _lock| {
        let fetcher = fetcher.clone();
        let store = store.clone();
        Box::pin(async move { run_logged(&fetcher, &store, max_attempts).await })
    })
    .with_context(|| format!("schedule job cron={}", settings.schedule_cron))?;

    scheduler.add(job).await?;
    scheduler.start().await?;

    log::info!(
        "collector.scheduled cron=\"{}\" tz={} max_attempts={}",
        settings.schedule_cron,
        settings.schedule_tz,
        max_attempts
    );
    Ok(scheduler)
}
