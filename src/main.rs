//! Process entry point: load `config.yaml`, init logging, drive the
//! `LifecycleManager` for the configured role, and exit cleanly on
//! SIGINT/SIGTERM (spec.md §6).

use std::process::ExitCode;

use tunnel_whisperer::config::{AppConfig, Mode};
use tunnel_whisperer::lifecycle::{ClientManager, ServerManager};
use tunnel_whisperer::paths::ConfigPaths;
use tunnel_whisperer::progress::ProgressSink;
use tunnel_whisperer::{logging, TwError};

#[tokio::main]
async fn main() -> ExitCode {
    let paths = ConfigPaths::resolve();
    let config = match AppConfig::load(&paths) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };

    logging::init(&config.log_level);

    match run(paths, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "exiting with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(paths: ConfigPaths, config: AppConfig) -> Result<(), TwError> {
    let progress = ProgressSink::discard();

    match config.mode {
        Mode::Server => {
            let manager = ServerManager::new(paths, config);
            manager.start(&progress).await?;
            tracing::info!("server running, waiting for shutdown signal");
            wait_for_shutdown_signal().await;
            manager.stop(&progress).await?;
        }
        Mode::Client => {
            let manager = ClientManager::new(paths, config);
            manager.start(&progress).await?;
            tracing::info!("client running, waiting for shutdown signal");
            wait_for_shutdown_signal().await;
            manager.stop(&progress).await?;
        }
        Mode::Unset => {
            return Err(TwError::config(
                "config.yaml has no mode set; expected \"server\" or \"client\"",
            ));
        }
    }

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
