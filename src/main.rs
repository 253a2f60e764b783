use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;

use filing_ingest::logging::configure_logging;
use filing_ingest::{
    BatchWriter, CircuitBreaker, Config, FetchClient, HealthcheckPinger, LivenessReporter,
    NoLiveness, Pipeline, RateLimiter, ReqwestTransport, ShutdownSignal, Store, Watchlist,
    WatchlistWatcher,
};

fn main() -> Result<()> {
    let config = Config::parse();
    configure_logging(&config.log_level, config.log_json);

    if let Err(e) = config.validate() {
        error!("{}", e);
        return Err(e.into());
    }

    let shutdown = ShutdownSignal::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("shutdown requested; finishing in-flight work");
            shutdown.trigger();
        })
        .context("Failed to install signal handler")?;
    }

    info!("🗄️  filing-ingest v{}", filing_ingest::VERSION);
    run(&config, &shutdown)
}

fn run(config: &Config, shutdown: &ShutdownSignal) -> Result<()> {
    // 1. Watchlist (+ background reload)
    let watchlist = Arc::new(Watchlist::load(&config.cik_file)?);
    info!(
        "watching {} CIK(s) from {}",
        watchlist.current().len(),
        config.cik_file.display()
    );
    let watcher = WatchlistWatcher::spawn(
        watchlist.clone(),
        Duration::from_secs(config.watch_poll_secs.max(1)),
        shutdown.clone(),
    )
    .context("Failed to start watchlist watcher")?;

    // 2. Fetch client shared by discovery and every worker
    let fetch_config = config.fetch_config();
    let transport = ReqwestTransport::new(fetch_config.request_timeout)
        .context("Failed to build HTTP client")?;
    let client = Arc::new(FetchClient::new(
        Box::new(transport),
        RateLimiter::per_second(config.rate_limit),
        CircuitBreaker::new(config.breaker_config()),
        fetch_config,
    ));

    // 3. Store
    let store = Store::open(&config.database)?;
    let writer = BatchWriter::new(store, config.batch_config());

    // 4. Liveness
    let liveness: Box<dyn LivenessReporter> = match &config.healthcheck_url {
        Some(url) => Box::new(
            HealthcheckPinger::new(url.as_str()).context("Failed to build healthcheck client")?,
        ),
        None => Box::new(NoLiveness),
    };

    let mut pipeline = Pipeline::new(
        config.pipeline_config(),
        watchlist,
        client,
        writer,
        liveness,
        shutdown.clone(),
    )?;

    let outcome = if config.once {
        pipeline.run_tick().map(|report| {
            info!(
                "single tick done: {} persisted, {} failed",
                report.persisted, report.failed
            );
        })
    } else {
        pipeline.run()
    };

    shutdown.trigger();
    watcher.join();

    outcome.map_err(anyhow::Error::from)
}
