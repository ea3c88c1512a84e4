//! gpuqueue daemon - Main Entry Point
//!
//! Wires the JSON snapshot store, the subprocess runner and the device pool
//! into one queue service, runs the supervised scheduler loop and serves
//! JSON-RPC until SIGINT/SIGTERM.

mod config;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Subscriber};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use config::{DaemonConfig, LogFormat, DAEMON_LOG_FILE};
use gpuqueue_api_rpc::{RpcServer, RpcServerConfig};
use gpuqueue_core::application::worker::constants::{DRAIN_TIMEOUT, GRACEFUL_SHUTDOWN_TIMEOUT};
use gpuqueue_core::application::{
    run_supervised, shutdown_channel, QueueService, RecoveryService, SchedulerConfig,
};
use gpuqueue_core::domain::{DeviceId, DevicePool};
use gpuqueue_core::port::{DeviceDiscovery, SystemTimeProvider, UuidProvider};
use gpuqueue_infra_json::JsonJobStore;
use gpuqueue_infra_system::{CommandDeviceDiscovery, SubprocessRunner};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Extra time granted to the loop on top of its own drain timeout
const SHUTDOWN_SLACK: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = DaemonConfig::from_env().context("Invalid configuration")?;
    std::fs::create_dir_all(&config.state_dir).with_context(|| {
        format!("Failed to create state dir {}", config.state_dir.display())
    })?;

    // 2. Initialize logging (stdout + daily-rolling file)
    let _log_guard = init_logging(&config)?;

    info!("gpuqueue v{} starting...", VERSION);
    info!(
        state_dir = %config.state_dir.display(),
        max_concurrent = config.max_concurrent,
        max_runtime_secs = ?config.max_runtime.map(|d| d.as_secs()),
        "Configuration loaded"
    );

    // 3. Open job store (reconciles jobs left Running by a previous run)
    let time_provider = Arc::new(SystemTimeProvider);
    let store = Arc::new(
        JsonJobStore::open(config.snapshot_path(), time_provider.as_ref())
            .await
            .context("Failed to open job store")?,
    );

    // 4. Setup dependencies (DI wiring)
    let runner = Arc::new(SubprocessRunner::new(
        config.device_env.clone(),
        GRACEFUL_SHUTDOWN_TIMEOUT,
    ));
    let discovery = Arc::new(CommandDeviceDiscovery::new(config.discovery_command.clone()));

    // 5. Kill processes orphaned by the previous run
    let recovery = RecoveryService::new(store.clone(), runner.clone());
    match recovery.reap_orphans().await {
        Ok(count) => info!(orphans = count, "Crash recovery completed"),
        Err(e) => error!(error = %e, "Crash recovery failed"),
    }

    // 6. Build device pool
    let devices = match &config.devices {
        Some(list) => list.iter().map(DeviceId::new).collect(),
        None => discovery.discover().await,
    };
    let pool = Arc::new(DevicePool::new(devices, config.max_concurrent));

    let service = Arc::new(QueueService::new(
        store.clone(),
        pool,
        discovery,
        Arc::new(UuidProvider),
        time_provider,
    ));

    // 7. Start scheduler loop
    let scheduler_config =
        SchedulerConfig::new(config.job_log_dir()).with_max_runtime(config.max_runtime);
    let scheduler = service.scheduler(runner, scheduler_config);
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let mut supervisor = tokio::spawn(run_supervised(scheduler, shutdown_rx));

    // 8. Start JSON-RPC server
    let rpc_config = RpcServerConfig {
        port: config.rpc_port,
        ..Default::default()
    };
    let (_, rpc_handle) = RpcServer::new(rpc_config, service)
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("RPC server start failed: {}", e))?;

    info!("System ready. Waiting for jobs...");

    // 9. Run until a signal arrives or the scheduler gives up
    let loop_result = tokio::select! {
        signal = shutdown_signal() => {
            signal?;
            info!("Shutdown signal received. Exiting gracefully...");
            None
        }
        result = &mut supervisor => Some(result),
    };

    rpc_handle
        .stop()
        .map_err(|e| anyhow::anyhow!("RPC server stop failed: {}", e))?;

    let outcome = match loop_result {
        None => {
            shutdown_tx.shutdown();
            match tokio::time::timeout(DRAIN_TIMEOUT + SHUTDOWN_SLACK, supervisor).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!(error = %e, "Scheduler loop failed during shutdown"),
                Ok(Err(e)) => warn!(error = %e, "Scheduler task panicked during shutdown"),
                Err(_) => warn!("Scheduler loop did not stop in time"),
            }
            Ok(())
        }
        Some(result) => result
            .context("Scheduler task panicked")
            .and_then(|r| r.context("Scheduler loop stopped after repeated faults")),
    };

    // 10. Wait for the last committed state to reach the snapshot
    match tokio::time::timeout(SHUTDOWN_SLACK, store.flush()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Failed to write final job snapshot"),
        Err(_) => error!("Final job snapshot did not complete in time"),
    }
    outcome?;

    info!("Shutdown complete.");
    Ok(())
}

fn init_logging(config: &DaemonConfig) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("gpuqueue=info"))
        .context("Failed to create env filter")?;

    let file_appender = tracing_appender::rolling::daily(&config.state_dir, DAEMON_LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_ansi(false).with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer(config.log_format))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn stdout_layer<S>(format: LogFormat) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match format {
        // Production: JSON structured logging
        LogFormat::Json => fmt::layer().json().boxed(),
        // Development: Pretty formatting with colors
        LogFormat::Pretty => fmt::layer().pretty().boxed(),
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for Ctrl+C"),
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")
}
