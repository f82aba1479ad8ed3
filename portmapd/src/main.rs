mod api;
mod clock;
mod config;
mod gateway;
mod mapping;
mod ssdp;
mod upnp;

use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::mapping::backoff::ExponentialBackoff;
use crate::mapping::engine::{Mapping, MappingRequest};
use crate::ssdp::client::SsdpClient;
use crate::ssdp::registry::ServiceRegistry;
use crate::upnp::client::SoapClient;

/// Per-request timeout for description fetches and SOAP calls
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("portmapd=info"))
        )
        .init();

    tracing::info!("Starting portmapd");

    // Load config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/portmapd/portmapd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // The gateway only seeds unicast discovery; multicast works without it
    let gateways = match gateway::default_gateways() {
        Ok(gateways) => {
            tracing::info!("Default gateway(s): {:?}", gateways);
            gateways
        }
        Err(e) => {
            tracing::warn!("Could not determine default gateway: {}", e);
            Vec::new()
        }
    };

    // Start discovery
    let ssdp_client = Arc::new(SsdpClient::new(config.discovery.clone(), gateways));
    let registry = ServiceRegistry::new(ssdp_client.clone());
    registry.start().await.context("Failed to start discovery")?;

    // Start the mapping
    let control_client = SoapClient::new(CONTROL_TIMEOUT)?;
    let (mapping, mut changes) = Mapping::start(
        MappingRequest::from(&config.mapping),
        Arc::clone(&registry),
        Arc::new(control_client),
        Box::new(ExponentialBackoff::from(&config.backoff)),
    );
    let mapping = Arc::new(mapping);

    tracing::info!(
        "Mapping {} port {} as {:?}",
        config.mapping.protocol,
        config.mapping.internal_port,
        config.mapping.name
    );

    let watch_mapping = Arc::clone(&mapping);
    let watch_handle = tokio::spawn(async move {
        while changes.recv().await.is_some() {
            match (watch_mapping.is_active(), watch_mapping.external_address()) {
                (true, Some(addr)) => tracing::info!(
                    "Reachable at {}:{} until {}",
                    addr,
                    watch_mapping.external_port(),
                    watch_mapping.expire_time().map(|t| t.to_rfc3339()).unwrap_or_default()
                ),
                _ => tracing::info!("Mapping not active"),
            }
        }
    });

    // Build API router
    let app = api::routes::router(api::routes::AppState {
        registry: Arc::clone(&registry),
        mapping: Arc::clone(&mapping),
    });

    // Bind HTTP server
    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    // Run server with graceful shutdown
    let cancel = tokio_util::sync::CancellationToken::new();
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    // Wait for shutdown signal, or for the mapping to give up on its own
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for ctrl-c")?;
            tracing::info!("Shutdown signal received");
        }
        _ = mapping.wait() => {
            tracing::error!("Mapping gave up after repeated failures");
        }
    }

    // Remove the mapping and wait for the task to finish
    mapping.delete();
    mapping.wait().await;

    cancel.cancel();
    let _ = server_handle.await;

    // Stop discovery; closing the stream ends registry ingestion
    registry.stop();
    ssdp_client.shutdown();

    watch_handle.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}
