//! SQS Worker Service
//!
//! Runs an `MqServer` worker pool and exposes its health and metrics over HTTP.
//!
//! ## Architecture
//!
//! ```text
//! mq:Order.inq / mq:Order.priorityq
//!   ↓ (worker threads, one per queue)
//! TypedMessageHandler<Order, OrderProcessor>
//!   ↓ ack on success, requeue or dead-letter on failure
//! mq:Order.outq (or the message's reply queue)
//! ```
//!
//! ## Endpoints
//!
//! - Liveness: `/health`, `/healthz`
//! - Readiness: `/ready`, `/readyz`
//! - Server statistics: `/stats`
//! - Prometheus metrics: `/metrics`

pub mod orders;
pub mod tracing;

use ::tracing::{error, info, warn};
use axum::Router;
use eyre::{Result, WrapErr};
use orders::{Order, OrderProcessor};
use sqs_worker::{
    Environment, FromEnv, HandlerOptions, HealthState, InMemoryQueueService, MqServer,
    MqServerConfig, SharedServiceFactory, env_or_default, health_router, metrics,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;

/// Start the health HTTP server; runs until `shutdown` resolves.
async fn start_health_server(
    health_state: HealthState,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app: Router = health_router(health_state).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Periodically delete empty temporary queues older than `max_age`.
async fn cleanup_temporary_queues(server: MqServer, interval: Duration, max_age: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Ok(age) = chrono::Duration::from_std(max_age) else {
            warn!("Temporary queue max age out of range, cleanup disabled");
            return;
        };
        match server
            .remove_empty_temporary_queues(chrono::Utc::now() - age)
            .await
        {
            Ok(0) => {}
            Ok(removed) => info!(removed, "Removed empty temporary queues"),
            Err(e) => warn!(error = %e, "Temporary queue cleanup failed"),
        }
    }
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_or_default(key, &default.to_string()).parse().unwrap_or(default))
}

/// Run the queue worker service
///
/// 1. Sets up structured logging (JSON for prod, pretty for dev) and Prometheus metrics
/// 2. Loads `MqServerConfig` from the environment
/// 3. Registers the handlers and starts the worker pool
/// 4. Serves health endpoints until SIGINT/SIGTERM, then disposes the server
///
/// # Errors
///
/// Returns an error if the configuration is invalid, a handler registration is rejected,
/// the server fails to start or the health server cannot bind.
pub async fn run() -> Result<()> {
    let environment = Environment::from_env();
    tracing::init_tracing(&environment);
    metrics::init_metrics();

    let app_name = env!("CARGO_PKG_NAME");
    let app_version = env!("CARGO_PKG_VERSION");
    info!(name = %app_name, version = %app_version, ?environment, "Starting sqs worker service");

    let health_port: u16 = std::env::var("SQS_WORKER_HEALTH_PORT")
        .or_else(|_| std::env::var("HEALTH_PORT"))
        .unwrap_or_else(|_| "8083".to_string())
        .parse()
        .unwrap_or(8083);

    let config = MqServerConfig::from_env().wrap_err("Failed to load MQ server configuration")?;
    info!(
        retry_count = config.retry_count,
        polling_interval_ms = config.polling_interval.as_millis() as u64,
        queue_name_prefix = %config.queue_name_prefix,
        priority_queues = config.enable_priority_queues,
        buffering_disabled = config.disable_buffering,
        "MQ server configuration loaded"
    );

    let factory = Arc::new(SharedServiceFactory::new(InMemoryQueueService::shared()));
    let server = MqServer::new(factory, config).wrap_err("Failed to create MQ server")?;

    let order_threads: usize = env_or_default("ORDER_WORKER_THREADS", "2")
        .parse()
        .unwrap_or(2);
    server
        .register_handler_with::<Order, _>(
            OrderProcessor::default(),
            HandlerOptions::default().with_thread_count(order_threads),
        )
        .wrap_err("Failed to register Order handler")?;

    let starting = server.clone();
    tokio::task::spawn_blocking(move || starting.start())
        .await
        .wrap_err("MQ server start task failed")?
        .wrap_err("Failed to start MQ server")?;
    info!(workers = server.worker_ids().len(), "MQ server started");

    tokio::spawn(cleanup_temporary_queues(
        server.clone(),
        env_secs("TEMP_QUEUE_CLEANUP_INTERVAL_SECS", 300),
        env_secs("TEMP_QUEUE_MAX_AGE_SECS", 3600),
    ));

    let health_state = HealthState::new(server.clone(), app_name, app_version);
    let served = start_health_server(health_state, health_port, async {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
    })
    .await;

    info!("Disposing MQ server...");
    tokio::task::spawn_blocking(move || server.dispose())
        .await
        .wrap_err("MQ server dispose task failed")?;

    served?;
    info!("SQS worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        res = ctrl_c => {
            res?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        res = terminate => {
            res?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}
