//! Ferry - Entry Point
//!
//! Builds the configured engine and runs the proxy listener with graceful
//! shutdown support.

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use ferry::config::{Config, LogConfig};
use ferry::proxy::{create_engine, ProxyServer};

#[tokio::main]
async fn main() -> ferry::Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config.log);

    info!("Starting Ferry with {} engine", config.engine.kind.as_str());

    // For ssh this is the initial handshake; nothing listens until it succeeds.
    let engine = match create_engine(&config.engine, &config.proxy).await {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to start {} engine: {}", config.engine.kind.as_str(), e);
            return Err(e);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy_server = ProxyServer::new(config.proxy.clone(), engine.clone());

    let mut proxy_task = tokio::spawn(async move {
        if let Err(e) = proxy_server.run(shutdown_rx).await {
            error!("Proxy server error: {}", e);
        }
    });

    info!("Proxy listening on {}", config.proxy_addr());

    let server_exited = tokio::select! {
        _ = shutdown_signal() => {
            info!("Shutdown signal received");
            false
        }
        _ = &mut proxy_task => true,
    };

    let _ = shutdown_tx.send(true);
    if !server_exited {
        let _ = proxy_task.await;
    }
    engine.shutdown().await;

    info!("Ferry stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("ferry={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
}
