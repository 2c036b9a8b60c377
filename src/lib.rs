pub mod api;
pub mod app;
pub mod auth;
pub mod catalog;
pub mod config;
pub mod database;
pub mod errors;
pub mod maintenance;
pub mod models;
pub mod queue;
pub mod realtime;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use app::Services;
use config::AppConfig;
use database::DatabaseManager;
use errors::AppError;
use maintenance::MaintenanceJob;

/// Serve the queue API until Ctrl-C.
pub async fn run(config: AppConfig) -> Result<(), AppError> {
    let db = DatabaseManager::new(&config.database_path).await?;
    let services = Services::build(db.pool.clone(), &config);

    let maintenance =
        Arc::new(MaintenanceJob::new(&services, &config)).spawn(config.maintenance_interval());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    log::info!("Queue sync service listening on {}", config.bind_addr);

    axum::serve(listener, api::router(services))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    maintenance.abort();
    db.pool.close().await;
    log::info!("Queue sync service stopped");
    Ok(())
}

/// Run one full maintenance pass and exit.
pub async fn run_maintenance(
    config: AppConfig,
) -> Result<maintenance::MaintenanceReport, AppError> {
    let db = DatabaseManager::new(&config.database_path).await?;
    let services = Services::build(db.pool.clone(), &config);
    let report = MaintenanceJob::new(&services, &config).run_once(true).await?;
    db.pool.close().await;
    Ok(report)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    log::info!("Shutdown requested");
}
