mod api;
mod bootstrap;
mod health;
mod service;
mod worker;

#[cfg(test)]
mod test_support;

use std::time::Duration;

use anyhow::Result;
use signoff_core::config::{AppConfig, LoadOptions};
use tokio::sync::watch;

fn init_logging(config: &AppConfig) {
    use signoff_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = if app.config.scheduler.enabled {
        Some(worker::spawn(
            app.service.clone(),
            worker::WorkerSettings {
                poll_interval: Duration::from_secs(app.config.scheduler.poll_interval_secs),
                batch_limit: app.config.scheduler.batch_limit,
            },
            shutdown_rx.clone(),
        ))
    } else {
        tracing::warn!(
            event_name = "system.server.scheduler_disabled",
            correlation_id = "bootstrap",
            "escalation scheduler disabled; timers fire only through the sweep endpoint"
        );
        None
    };

    let router = api::router(api::ApiState {
        service: app.service.clone(),
        sweep_limit: app.config.scheduler.batch_limit,
    })
    .merge(health::router(health::HealthState {
        db_pool: app.db_pool.clone(),
        service: app.service.clone(),
    }));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "signoff-server listening"
    );

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "signoff-server stopping"
    );
    shutdown_tx.send(true)?;

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, server).await {
        Ok(joined) => joined??,
        Err(_) => tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "in-flight requests did not finish before the grace period"
        ),
    }
    if let Some(worker) = worker {
        if tokio::time::timeout(grace, worker).await.is_err() {
            tracing::warn!(
                event_name = "system.server.worker_timeout",
                correlation_id = "shutdown",
                "escalation worker did not stop before the grace period"
            );
        }
    }

    let pending = app.service.flush("shutdown").await;
    if pending > 0 {
        tracing::error!(
            event_name = "system.server.unsaved_changes",
            correlation_id = "shutdown",
            pending_writes = pending,
            "committed changes could not be stored before exit"
        );
    }
    app.db_pool.close().await;
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
