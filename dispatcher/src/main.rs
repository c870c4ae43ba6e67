//! Dispatcher process entrypoint.
//!
//! Loads configuration, wires the `sled`-backed store and the delayed
//! scheduler, and runs the reconciler loop: `sleep(poll_frequency)` →
//! goal resolve → topology plan → status aggregate → solver, until a
//! shutdown signal arrives.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use dispatcher_common::clock::SystemClock;
use dispatcher_common::config::{ConfigLoader, DispatcherConfig};
use dispatcher_core::{scheduler, Reconciler};
use dispatcher_store::SledStore;
use tokio::sync::Notify;
use tracing::{error, info};

/// DAQ cluster control-loop dispatcher.
#[derive(Debug, Parser)]
#[command(name = "dispatcher", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "dispatcher.toml")]
    config: PathBuf,

    /// Run a single reconciler tick and exit instead of looping forever.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    let args = Args::parse();

    let config = match DispatcherConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, path = %args.config.display(), "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "configuration failed validation");
        return ExitCode::FAILURE;
    }

    let store = match SledStore::open(&config.store_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, path = %config.store_path.display(), "failed to open store");
            return ExitCode::FAILURE;
        }
    };

    match run(config, store, args.once).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "dispatcher exited on unrecoverable error");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    config: DispatcherConfig,
    store: Arc<SledStore>,
    once: bool,
) -> Result<(), dispatcher_common::error::DispatchError> {
    let hypervisor = dispatcher_core::NoopHypervisor;
    let clock = SystemClock;

    let shutdown = Arc::new(Notify::new());
    let (scheduler_handle, scheduler_join) =
        scheduler::spawn(store.clone(), clock, shutdown.clone()).await;

    let mut reconciler = Reconciler::new(config.master_daq_config.keys().cloned());

    info!(detectors = config.master_daq_config.len(), "dispatcher starting");

    loop {
        if let Err(e) = reconciler
            .tick(&store, &clock, &config, &scheduler_handle, &hypervisor)
            .await
        {
            error!(error = %e, "tick aborted");
        }

        if once {
            break;
        }

        let sleep = tokio::time::sleep(std::time::Duration::from_secs(config.poll_frequency));
        tokio::select! {
            _ = sleep => {}
            _ = shutdown_signal() => {
                info!("shutdown signal received, finishing current tick and exiting");
                break;
            }
        }
    }

    shutdown.notify_waiters();
    if let Err(e) = scheduler_join.await {
        error!(error = %e, "delayed scheduler task panicked during shutdown");
    }

    info!("dispatcher exited cleanly");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
