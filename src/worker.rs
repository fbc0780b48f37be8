use std::sync::Arc;
use std::time::Duration;
use anyhow::Result;

use einvoice_engine::{ComplianceService, ComplianceSettings, DrainScheduler};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .init();

    tracing::info!("Starting offline queue worker");

    // Load configuration
    let settings = ComplianceSettings::load()?;
    let config = WorkerConfig::from_env(&settings)?;

    let service = Arc::new(ComplianceService::open(settings).await?);
    let worker = Worker::new(service, config);
    worker.run().await
}

#[derive(Clone)]
struct WorkerConfig {
    drain_interval: Duration,
    run_once: bool,
}

impl WorkerConfig {
    fn from_env(settings: &ComplianceSettings) -> Result<Self> {
        use std::env;

        let drain_interval = match env::var("DRAIN_INTERVAL_SECS") {
            Ok(secs) => Duration::from_secs(secs.parse::<u64>()?.max(1)),
            Err(_) => settings.queue.drain_interval(),
        };

        Ok(WorkerConfig {
            drain_interval,
            run_once: env::var("RUN_ONCE")
                .unwrap_or_else(|_| "false".to_string())
                .parse()?,
        })
    }
}

struct Worker {
    service: Arc<ComplianceService>,
    config: WorkerConfig,
}

impl Worker {
    fn new(service: Arc<ComplianceService>, config: WorkerConfig) -> Self {
        Worker { service, config }
    }

    async fn run(self) -> Result<()> {
        if self.config.run_once {
            let report = self.service.drain_queue().await?;
            tracing::info!(
                attempted = report.attempted,
                completed = report.completed.len(),
                failed = report.failed.len(),
                "Single drain finished"
            );
            return Ok(());
        }

        let handle = DrainScheduler::spawn(self.service.clone(), self.config.drain_interval);

        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown signal received, stopping drain scheduler");
        handle.cancel().await;

        let stats = self.service.queue_stats().await?;
        tracing::info!(
            pending = stats.pending,
            failed = stats.failed,
            "Worker stopped"
        );
        Ok(())
    }
}
