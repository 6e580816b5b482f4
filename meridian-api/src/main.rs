//! Meridian API Server Entry Point
//!
//! Serves the status endpoints over the in-memory backend and runs the
//! maintenance job until Ctrl-C. Business handlers are registered by the
//! embedding platform; this binary registers none.

use std::net::SocketAddr;
use std::sync::Arc;

use meridian_api::{init_tracing, status_router, ApiError, ApiResult, AppState, TelemetryConfig};
use meridian_core::OrchestratorConfig;
use meridian_engine::{
    maintenance_task, MaintenanceConfig, OperationRegistry, SagaCoordinator, SharedStorage,
};
use meridian_storage::InMemoryStorage;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::from_env();
    init_tracing(&telemetry_config)?;

    let storage: SharedStorage = Arc::new(InMemoryStorage::new());
    let coordinator = SagaCoordinator::new(
        storage.clone(),
        Arc::new(OperationRegistry::new()),
        OrchestratorConfig::from_env(),
    );
    let state = AppState::new(storage.clone(), coordinator);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let maintenance = tokio::spawn(maintenance_task(
        storage,
        MaintenanceConfig::from_env(),
        shutdown_rx,
    ));

    let addr = resolve_bind_addr()?;
    tracing::info!(%addr, service = %telemetry_config.service_name, "Starting Meridian API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, status_router(state));
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Ok(metrics) = maintenance.await {
        let snapshot = metrics.snapshot();
        tracing::info!(
            keys_purged = snapshot.idempotency_keys_purged,
            cycles = snapshot.maintenance_cycles,
            "Maintenance stopped"
        );
    }
    Ok(())
}

fn resolve_bind_addr() -> ApiResult<SocketAddr> {
    let host = std::env::var("MERIDIAN_API_BIND").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port_str = std::env::var("PORT")
        .ok()
        .or_else(|| std::env::var("MERIDIAN_API_PORT").ok())
        .unwrap_or_else(|| "3000".to_string());
    let port = port_str
        .parse::<u16>()
        .map_err(|_| ApiError::invalid_format("port", "an integer 0-65535"))?;

    let addr = format!("{}:{}", host, port);
    addr.parse::<SocketAddr>()
        .map_err(|_| ApiError::invalid_format("bind address", "host:port"))
}
