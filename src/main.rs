//! Revolve - Entry Point
//!
//! Wires the rotator, dialer and SOCKS5 server together, starts the metrics
//! display and handles graceful shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod error;
mod models;
mod proxy;
mod services;

use config::Config;
use proxy::rotation::Rotator;
use proxy::server::{RetryMode, Server};
use proxy::transport::Dialer;
use services::{MetricsDisplay, MetricsDisplayConfig};

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout belongs to the metrics display.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "revolve=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let rotator = Arc::new(Rotator::new(
        config.strategy,
        config.skip_dead,
        config.requests_per,
    ));

    if let Some(path) = &config.proxy_file {
        if let Err(e) = rotator.load_from_file(path) {
            error!("Failed to load proxy file {}: {}", path, e);
            std::process::exit(1);
        }
    }
    rotator.load_from_strings(&config.proxies);

    if rotator.count() == 0 {
        error!("No proxies configured; set REVOLVE_PROXIES or REVOLVE_PROXY_FILE");
        std::process::exit(1);
    }

    let dialer = Arc::new(Dialer::new(
        config.trust_proxy,
        Duration::from_secs(config.dial_timeout_secs),
    ));
    let retry_mode = if config.just_do_it {
        RetryMode::Persistent
    } else {
        RetryMode::Bounded
    };
    let server = Server::new(
        rotator.clone(),
        dialer,
        retry_mode,
        Duration::from_millis(config.retry_delay_ms),
    );

    let listener = match Server::bind(&config.listen_addr) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to listen on {}: {}", config.listen_addr, e);
            std::process::exit(1);
        }
    };
    info!(
        "revolve listening on {} with {} proxies ({} rotation)",
        config.listen_addr,
        rotator.count(),
        config.strategy.as_str()
    );

    let (shutdown_tx, _) = watch::channel(false);

    // With skip-dead enabled an exhausted pool shuts the server down.
    let all_dead = Arc::new(AtomicBool::new(false));
    {
        let flag = all_dead.clone();
        let tx = shutdown_tx.clone();
        rotator.on_all_dead(move || {
            error!("All proxies are dead; shutting down");
            flag.store(true, Ordering::SeqCst);
            let _ = tx.send(true);
        });
    }

    let display_task = if config.metrics_enabled {
        let display = MetricsDisplay::new(
            rotator.clone(),
            server.stats(),
            MetricsDisplayConfig::default(),
        );
        let shutdown = shutdown_tx.subscribe();
        Some(tokio::spawn(async move { display.run(shutdown).await }))
    } else {
        None
    };

    {
        let tx = shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            let _ = tx.send(true);
        });
    }

    let result = server.run(listener, shutdown_tx.subscribe()).await;

    let _ = shutdown_tx.send(true);
    if let Some(task) = display_task {
        let _ = task.await;
    }

    if let Err(e) = result {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
    if all_dead.load(Ordering::SeqCst) {
        std::process::exit(1);
    }
    info!("revolve stopped");
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
