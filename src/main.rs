use std::fs;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use channels::ChannelClient;
use feedrelay::cli::{Cli, Commands};
use feedrelay::config::Config;
use feedrelay::dedup::MemoryDedupStore;
use feedrelay::dispatch::{self, ChannelSink, DispatchSettings, RateLimitConfig, RetryPolicy, Sink};
use feedrelay::errors::FeederError;
use feedrelay::metrics::Metrics;
use feedrelay::scheduler::{Scheduler, SchedulerSettings};
use feedrelay::services::{
    requeue_undelivered, FeedService, ImportExportService, PollService, PollSettings,
    RECOVERY_LIMIT,
};
use feedrelay::sources::HttpFetcher;
use feedrelay::storage::{SqliteStorage, Store};

const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(300);

fn set_up_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .with_env_var("FEEDER_LOG")
                .from_env_lossy(),
        )
        .init();
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    set_up_logging();

    let config = Config::from_env().context("Failed to load configuration")?;
    let storage = SqliteStorage::new(&config.db_path)
        .with_context(|| format!("Failed to open database at {}", config.db_path))?;
    let store = Store::sqlite(storage, config.store_timeout);

    let cancel = CancellationToken::new();
    let fetcher = HttpFetcher::new(config.fetch_timeout, config.fetch_retries, cancel.clone())?;

    match cli.command {
        Commands::Add {
            url,
            interval,
            sinks,
        } => cmd_add(&url, interval, sinks, FeedService::new(store, fetcher)).await,
        Commands::Remove { id } => cmd_remove(id, FeedService::new(store, fetcher)).await,
        Commands::Enable { id } => cmd_enable(id, FeedService::new(store, fetcher)).await,
        Commands::List => cmd_list(FeedService::new(store, fetcher)).await,
        Commands::Status => cmd_status(&config, store, fetcher).await,
        Commands::Import { path } => {
            cmd_import(&path, ImportExportService::new(store, fetcher)).await
        }
        Commands::Export { output } => {
            cmd_export(output, ImportExportService::new(store, fetcher)).await
        }
        Commands::Run { once } => cmd_run(&config, store, fetcher, cancel, once).await,
    }
}

async fn cmd_add(
    url: &str,
    interval: Option<u64>,
    sinks: Vec<String>,
    service: FeedService,
) -> Result<()> {
    println!("Validating feed: {}", url);

    match service.add(url, interval, sinks).await {
        Ok(source) => {
            println!("Feed added successfully!");
            println!("  Id: {}", source.id);
            println!("  Title: {}", source.display_name());
            println!("  Feed: {}", source.url);
            Ok(())
        }
        Err(FeederError::SourceAlreadyExists(existing)) => {
            println!("Feed already exists: {}", existing);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

async fn cmd_remove(id: Option<i64>, service: FeedService) -> Result<()> {
    let id = match id {
        Some(id) => id,
        None => match select_source(&service).await? {
            Some(id) => id,
            None => return Ok(()),
        },
    };

    service.remove(id).await?;
    println!("Disabled source {}", id);
    Ok(())
}

/// Prompt for one of the enabled sources; `None` when there is nothing to
/// pick or the user cancels.
async fn select_source(service: &FeedService) -> Result<Option<i64>> {
    let sources = service.list_enabled().await?;
    if sources.is_empty() {
        println!("No feeds to remove.");
        return Ok(None);
    }

    println!("Select a feed to remove:\n");
    for (i, source) in sources.iter().enumerate() {
        println!("  {}. {} ({})", i + 1, source.display_name(), source.url);
    }
    println!();

    print!("Enter number (or 'q' to cancel): ");
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();

    if input.eq_ignore_ascii_case("q") {
        println!("Cancelled.");
        return Ok(None);
    }

    let index: usize = input
        .parse()
        .map_err(|_| FeederError::InvalidInput("Invalid number".to_string()))?;
    if index == 0 || index > sources.len() {
        bail!(FeederError::InvalidInput("Number out of range".to_string()));
    }

    Ok(Some(sources[index - 1].id))
}

async fn cmd_enable(id: i64, service: FeedService) -> Result<()> {
    service.enable(id).await?;
    println!("Enabled source {}", id);
    Ok(())
}

async fn cmd_list(service: FeedService) -> Result<()> {
    let sources = service.list().await?;

    if sources.is_empty() {
        println!("No feeds configured.");
        return Ok(());
    }

    println!("Configured feeds:\n");
    for source in sources {
        let state = if source.disabled { " [disabled]" } else { "" };
        println!("  {}. {}{}", source.id, source.display_name(), state);
        println!("    URL: {}", source.url);
        if let Some(secs) = source.interval_secs {
            println!("    Interval: {}s", secs);
        }
        if let Some(last) = source.last_fetched_at {
            println!("    Last fetched: {}", last.to_rfc3339());
        }
        println!();
    }

    Ok(())
}

async fn cmd_status(config: &Config, store: Store, fetcher: HttpFetcher) -> Result<()> {
    let service = FeedService::new(store.clone(), fetcher);
    let report = service.status().await?;

    println!(
        "Sources: {} total, {} disabled",
        report.total_sources,
        report.disabled.len()
    );
    for source in &report.disabled {
        println!(
            "  ! {} ({} failures): {}",
            source.display_name(),
            source.failure_count,
            source.last_error.as_deref().unwrap_or("disabled by operator")
        );
    }

    println!("\nDeliveries:");
    for sink in &config.sinks {
        let summary = report
            .deliveries
            .iter()
            .find(|s| &s.sink_id == sink)
            .cloned()
            .unwrap_or_default();
        let sink_id = sink.clone();
        let pending = store
            .run("undelivered_for_sink", move |s| {
                s.entries.undelivered_for_sink(&sink_id, RECOVERY_LIMIT)
            })
            .await?
            .len();
        println!(
            "  {}: {} delivered, {} failed, {} pending",
            sink, summary.delivered, summary.failed, pending
        );
    }

    Ok(())
}

async fn cmd_import(path: &str, service: ImportExportService) -> Result<()> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read {}", path))?;

    println!("Importing feeds from {}...\n", path);

    let result = service.import_opml(&content).await?;

    if !result.added.is_empty() {
        println!("Added {} feeds:", result.added.len());
        for source in &result.added {
            println!("  + {} ({})", source.display_name(), source.url);
        }
        println!();
    }

    if !result.duplicates.is_empty() {
        println!("Skipped {} duplicates:", result.duplicates.len());
        for url in &result.duplicates {
            println!("  - {}", url);
        }
        println!();
    }

    if !result.invalid.is_empty() {
        println!("Failed {} feeds:", result.invalid.len());
        for (url, error) in &result.invalid {
            println!("  ! {}: {}", url, error);
        }
        println!();
    }

    println!(
        "Import complete: {} added, {} duplicates, {} failed",
        result.added.len(),
        result.duplicates.len(),
        result.invalid.len()
    );

    Ok(())
}

async fn cmd_export(output: Option<String>, service: ImportExportService) -> Result<()> {
    let opml = service.export_opml().await?;

    match output {
        Some(path) => {
            fs::write(&path, &opml).with_context(|| format!("Failed to write {}", path))?;
            println!("Exported feeds to {}", path);
        }
        None => {
            println!("{}", opml);
        }
    }

    Ok(())
}

async fn cmd_run(
    config: &Config,
    store: Store,
    fetcher: HttpFetcher,
    cancel: CancellationToken,
    once: bool,
) -> Result<()> {
    let (url, token) = config.channel_credentials()?;
    let client = Arc::new(
        ChannelClient::new(url, token, config.fetch_timeout)
            .context("Failed to create channel client")?,
    );
    let sinks: Vec<Arc<dyn Sink>> = config
        .sinks
        .iter()
        .map(|name| Arc::new(ChannelSink::new(name.clone(), client.clone())) as Arc<dyn Sink>)
        .collect();

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupted, shutting down"),
                Err(e) => error!(error = %e, "Failed to listen for interrupt"),
            }
            cancel.cancel();
        }
    });

    let metrics = Arc::new(Metrics::new());
    let (dispatch, mut workers) = dispatch::start(
        sinks,
        store.clone(),
        metrics.clone(),
        DispatchSettings {
            queue_capacity: config.queue_capacity,
            retry: RetryPolicy::new(config.delivery_max_attempts),
            rate_limit: RateLimitConfig::new(config.rate_limit_requests, config.rate_limit_window),
        },
        cancel.clone(),
    );

    let recovered = requeue_undelivered(&store, &dispatch, RECOVERY_LIMIT, &cancel).await?;
    if recovered > 0 {
        info!(recovered, "Recovered undelivered entries");
    }

    let poller = PollService::new(
        Arc::new(fetcher),
        store.clone(),
        Arc::new(MemoryDedupStore::new()),
        dispatch.clone(),
        metrics.clone(),
        PollSettings {
            failure_threshold: config.failure_threshold,
            dedup_ttl: config.dedup_ttl,
            max_entries_per_poll: config.max_entries_per_poll,
        },
    );
    let scheduler = Scheduler::new(
        store,
        Arc::new(poller),
        SchedulerSettings {
            default_interval: config.poll_interval,
            max_jitter: config.max_jitter,
            workers: config.poll_workers,
            shutdown_grace: config.shutdown_grace,
            quiet_window: config.quiet_window,
            tick: Duration::from_secs(1),
        },
    );

    if once {
        let polled = scheduler.run_once(cancel.clone()).await?;
        info!(sources = polled, "Poll cycle finished, draining deliveries");
    } else {
        let reporter = tokio::spawn(log_metrics(metrics.clone(), cancel.clone()));
        scheduler.run(cancel.clone()).await;
        reporter.abort();
    }

    // Workers drain their queues once every handle is gone
    drop(scheduler);
    drop(dispatch);
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "Delivery worker failed");
        }
    }

    let snapshot = metrics.snapshot();
    info!(metrics = %serde_json::to_string(&snapshot)?, "Final metrics");
    if once {
        println!("{}", snapshot.render_text());
    }

    Ok(())
}

async fn log_metrics(metrics: Arc<Metrics>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(METRICS_LOG_INTERVAL);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                match serde_json::to_string(&metrics.snapshot()) {
                    Ok(json) => info!(metrics = %json, "Metrics"),
                    Err(e) => error!(error = %e, "Failed to serialize metrics"),
                }
            }
        }
    }
}
