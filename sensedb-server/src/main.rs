//! SenseDB Server - daemon hosting ingestion queues and the retention scheduler

mod api;

use anyhow::Context;
use api::AppState;
use clap::Parser;
use sensedb_core::config::SenseConfig;
use sensedb_core::ingest::TelemetryIngestor;
use sensedb_core::retention::{
    CommandCompactor, Compactor, DiskProbe, RetentionEngine, RetentionState, SnapshotCompactor,
};
use sensedb_core::store::{MemoryStores, SNAPSHOT_FILE};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "SenseDB telemetry ingestion and retention daemon", long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long, env = "SENSEDB_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides config file)
    #[arg(long, env = "SENSEDB_HTTP_ADDR")]
    http_addr: Option<String>,

    /// Data directory holding the snapshot (overrides config file)
    #[arg(long, env = "SENSEDB_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Path whose volume retention watches (overrides config file)
    #[arg(long, env = "SENSEDB_MONITORED_PATH")]
    monitored_path: Option<PathBuf>,

    /// Log level or filter directive (overrides config file)
    #[arg(long, env = "SENSEDB_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<SenseConfig> {
        let mut config = match &self.config {
            Some(path) => SenseConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => SenseConfig::default(),
        };

        if let Some(addr) = self.http_addr {
            config.server.http_addr = addr;
        }
        if let Some(data_dir) = self.data_dir {
            config.storage.data_dir = data_dir;
        }
        if let Some(path) = self.monitored_path {
            config.retention.monitored_path = path;
        }
        if let Some(level) = self.log_level {
            config.server.log_level = level;
        }

        config.validate()?;
        Ok(config)
    }
}

/// `RUST_LOG` wins over the configured level
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;
    init_tracing(&config.server.log_level);

    info!("Starting SenseDB server {}...", sensedb_core::VERSION);
    info!("Data directory: {:?}", config.storage.data_dir);
    info!("Monitored path: {:?}", config.retention.monitored_path);

    let snapshot_path = config.storage.data_dir.join(SNAPSHOT_FILE);
    let stores = MemoryStores::new();
    if !stores.load(&snapshot_path)? {
        info!("No snapshot at {:?}, starting empty", snapshot_path);
    }

    let state = RetentionState::new();
    let ingestor = Arc::new(TelemetryIngestor::start(&config.queue, &stores, state.clone()));

    let compactor: Arc<dyn Compactor> = match &config.retention.compaction_command {
        Some(command) => Arc::new(CommandCompactor::new(command.clone())),
        None => Arc::new(SnapshotCompactor::new(stores.clone(), &snapshot_path)),
    };
    let retention = Arc::new(RetentionEngine::new(
        config.retention.clone(),
        state,
        Arc::new(DiskProbe::new(&config.retention.monitored_path)),
        compactor,
        stores.recognitions.clone(),
        stores.timeseries.clone(),
    ));

    let shutdown = CancellationToken::new();
    let retention_task = retention.clone().spawn(
        Duration::from_secs(config.retention.check_interval_secs.max(1)),
        shutdown.clone(),
    );
    let snapshot_task = spawn_snapshots(
        stores.clone(),
        snapshot_path.clone(),
        config.storage.snapshot_interval_secs,
        shutdown.clone(),
    );

    let app = api::create_router(AppState {
        stores: stores.clone(),
        ingestor: ingestor.clone(),
        retention,
        started_at: Instant::now(),
    });

    let listener = tokio::net::TcpListener::bind(&config.server.http_addr)
        .await
        .with_context(|| format!("binding {}", config.server.http_addr))?;
    info!("SenseDB server listening on {}", config.server.http_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    info!("Draining queues...");
    shutdown.cancel();
    for (name, task) in [("retention", retention_task), ("snapshot", snapshot_task)] {
        if let Err(e) = task.await {
            warn!("{} task ended abnormally: {}", name, e);
        }
    }
    ingestor.shutdown().await;

    let final_stores = stores.clone();
    let final_path = snapshot_path.clone();
    tokio::task::spawn_blocking(move || final_stores.save(final_path)).await??;
    info!("SenseDB server stopped");

    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Cannot listen for shutdown signal: {}", e),
        },
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

/// Write a snapshot every `interval_secs`; 0 disables it
fn spawn_snapshots(
    stores: MemoryStores,
    path: PathBuf,
    interval_secs: u64,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if interval_secs == 0 {
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let stores = stores.clone();
                    let path = path.clone();
                    match tokio::task::spawn_blocking(move || stores.save(path)).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!("Periodic snapshot failed: {}", e),
                        Err(e) => error!("Periodic snapshot task panicked: {}", e),
                    }
                }
            }
        }
    })
}
