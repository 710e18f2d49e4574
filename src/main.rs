use anyhow::{anyhow, Result};
use fleet_coordinator::{
    blockchain::{BlockchainClient, ChainFeed},
    config::Config,
    external::{DryRunExecutor, NonceSource},
    fleet::{FleetController, ProcessLauncher},
    protocol::WORKER_ORDINAL_ENV,
    worker::{stdio_channels, BackoffPolicy, Worker, WorkerExit, WorkerParams},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

#[tokio::main]
async fn main() -> Result<()> {
    // Workers keep stdout for the protocol, so every process logs to stderr.
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    match std::env::var(WORKER_ORDINAL_ENV) {
        Ok(ordinal) => {
            let ordinal = ordinal
                .parse()
                .map_err(|e| anyhow!("Invalid {}={}: {}", WORKER_ORDINAL_ENV, ordinal, e))?;
            run_worker(config, ordinal).await
        }
        Err(_) => run_controller(config).await,
    }
}

async fn run_controller(config: Config) -> Result<()> {
    info!("Starting fleet controller");

    let launcher = ProcessLauncher::current_exe()?;
    let size = config.fleet.resolved_size();
    let stagger = config.fleet.stagger_delay();
    let (controller, _handle) = FleetController::new(config.fleet.clone(), launcher);

    let mut controller = match config.feed.account_address {
        Some(_) => match BlockchainClient::new(&config.relay, &config.feed).await {
            Ok(client) => {
                let source: Arc<dyn NonceSource> = Arc::new(client);
                controller.with_nonce_source(source)
            }
            Err(e) => {
                warn!("Nonce source unavailable, workers must supply baselines: {}", e);
                controller
            }
        },
        None => controller,
    };

    controller.spawn_fleet(size, stagger);
    let cancel = controller.cancel_token();
    let fleet = tokio::spawn(controller.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            cancel.cancel();
        }
        _ = cancel.cancelled() => {}
    }

    let metrics = fleet.await?;
    info!(
        "Fleet controller shutdown complete ({} workers spawned, {} exits)",
        metrics.workers_spawned, metrics.workers_exited
    );
    info!("Final fleet metrics: {}", metrics.export_json()?);
    Ok(())
}

async fn run_worker(config: Config, ordinal: u64) -> Result<()> {
    let cancel = CancellationToken::new();
    let feed = Arc::new(ChainFeed::new(&config.feed)?);

    let worker = Worker::new(WorkerParams {
        ordinal,
        config: config.worker.clone(),
        backoff: BackoffPolicy::from(&config.backoff),
        feed,
        executor: Arc::new(DryRunExecutor),
        channels: stdio_channels(),
        cancel: cancel.clone(),
    })?;

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_cancel.cancel();
        }
    });

    match worker.run().await {
        WorkerExit::Shutdown => {
            info!("Worker {} shut down", ordinal);
            Ok(())
        }
        WorkerExit::Terminated { reason } => {
            error!("Worker {} terminated: {}", ordinal, reason);
            std::process::exit(1);
        }
    }
}
