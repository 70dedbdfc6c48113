//! Update manager binary.
//!
//! Wires the production collaborators, initializes every deployment and
//! keeps the refresh timer running until interrupted.

use std::sync::Arc;

use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use update_manager::deployment::NoSourceFactory;
use update_manager::device::LocalDevice;
use update_manager::http::ReqwestHttpClient;
use update_manager::notify::{BroadcastSink, UPDATE_RESPONSE_EVENT};
use update_manager::shell::TokioShell;
use update_manager::storage::JsonFileStore;
use update_manager::{Collaborators, Config, Orchestrator};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("update_manager=info".parse()?),
        )
        .init();

    info!("Update manager starting");

    let config = Config::load().await?;
    let storage_path = config.resolved_storage_path()?;
    info!(
        storage = %storage_path.display(),
        clients = config.clients.len(),
        auto_refresh = config.enable_auto_refresh,
        "Configuration loaded"
    );

    let sink = BroadcastSink::new(64);
    let mut notifications = sink.subscribe();
    tokio::spawn(async move {
        while let Ok(notification) = notifications.recv().await {
            if notification.event == UPDATE_RESPONSE_EVENT {
                info!(payload = %notification.payload, "Update progress");
            }
        }
    });

    let collaborators = Collaborators {
        store: Arc::new(JsonFileStore::open(&storage_path).await?),
        http: Arc::new(ReqwestHttpClient::new()?),
        shell: Arc::new(TokioShell),
        sink: Arc::new(sink),
        device: Arc::new(LocalDevice::detect()),
        bus: None,
    };
    let orchestrator = Orchestrator::new(&config, collaborators, Arc::new(NoSourceFactory));
    if let Err(err) = orchestrator.initialize().await {
        error!(error = %err, "Failed to initialize update manager");
        return Err(err.into());
    }

    signal::ctrl_c().await?;
    info!("Shutting down");
    orchestrator.close().await;
    Ok(())
}
