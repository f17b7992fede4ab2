//! Tidepool worker - main entry point

use std::process::ExitCode;
use std::sync::Arc;

use tidepool_core::{
    config::Config,
    jobs::{register_builtin, Collaborators, Dispatcher, JobRegistry, JobScheduler, SubmissionQueue},
    telemetry::{self, TelemetryConfig},
};

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tidepool-worker: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match serve(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker failed");
            eprintln!("tidepool-worker: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let metrics = telemetry::init_telemetry(&TelemetryConfig {
        logging: config.logging.clone(),
        metrics: config.metrics.clone(),
    })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        max_workers = config.max_workers,
        max_queue = config.max_queue,
        metrics_addr = ?metrics.listen_addr,
        "Starting Tidepool worker"
    );

    let mut registry = JobRegistry::new();
    register_builtin(&mut registry, Collaborators::in_memory(), &config.jobs)?;
    let registry = Arc::new(registry);

    let (submitter, receiver) = SubmissionQueue::bounded(config.max_queue)?;
    let dispatcher = Dispatcher::new(config.max_workers)?;
    dispatcher.run(receiver)?;

    let mut scheduler = JobScheduler::new(registry.clone(), submitter.clone());
    for entry in config.schedule.iter().cloned() {
        scheduler.add(entry)?;
    }
    scheduler.start();
    tracing::info!(kinds = ?registry.kinds(), scheduled = scheduler.active(), "Worker ready");

    shutdown_signal().await;

    scheduler.shutdown().await;
    dispatcher.exit().await;
    // Held until here so the queue stays open while the worker runs.
    drop(submitter);

    tracing::info!(stats = ?dispatcher.stats(), "Worker shutdown complete");
    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
