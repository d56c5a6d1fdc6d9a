//! Listend - Always-On Listening Daemon
//!
//! Wires configuration, the inference client, the orchestrator, and the
//! HTTP/WebSocket server, then runs until SIGINT/SIGTERM.

use listend::config::{Config, LogFormat};
use listend::inference::{ClientOptions, HttpInference, InferenceClient};
use listend::manager::{Manager, ManagerConfig};
use listend::server::{self, RateLimitConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// How long startup waits for the inference backend to report SERVING.
const STARTUP_WAIT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Exit code 1 with a readable report on any invalid variable.
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            std::process::exit(1);
        }
    };
    init_logging(&config);
    info!(version = listend::VERSION, "listend starting");

    let options = ClientOptions::default();
    let service = HttpInference::connect(&config.inference_addr, &options)?;
    let client = Arc::new(InferenceClient::new(Arc::new(service), options));

    if let Err(err) = client.wait_ready(STARTUP_WAIT).await {
        error!(error = %err, addr = %config.inference_addr, "inference backend not ready");
        eprintln!("inference backend not ready: {err}");
        std::process::exit(1);
    }

    let (manager, channels) = Manager::new(
        client.clone(),
        frame_source(),
        ManagerConfig::from_config(&config),
    );
    manager.start()?;

    server::serve(
        &config.bind_addr(),
        manager.clone(),
        channels,
        RateLimitConfig::default(),
        shutdown_signal(),
    )
    .await?;

    manager.stop().await;
    client.stop().await;
    info!("listend stopped");
    Ok(())
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.to_lowercase()));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[cfg(feature = "desktop")]
fn frame_source() -> Option<Box<dyn listend::screen::FrameSource>> {
    Some(Box::new(listend::screen::PrimaryDisplay))
}

#[cfg(not(feature = "desktop"))]
fn frame_source() -> Option<Box<dyn listend::screen::FrameSource>> {
    None
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
