// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use model_runtime::{WorkerBackend, WorkerOptions};
use protocol::{ModelConfig, ModelName};
use tracing::{info, warn};

pub mod api;
pub mod drain;
pub mod error;
pub mod events;
pub mod invoker;
pub mod manager;
pub mod observe;
pub mod registry;
pub mod shutdown;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{GenerateError, UnloadError};
pub use events::EventBus;
pub use manager::{BusyPolicy, LifecycleManager, LifecycleSettings, SwitchPolicy};

pub struct Config {
    pub api_socket: SocketAddr,
    pub observe_socket: Option<SocketAddr>,
    /// Allowed CORS origins; empty allows any.
    pub cors_origins: Vec<String>,
    pub lifecycle: LifecycleSettings,
    pub worker: WorkerOptions,
    pub models: HashMap<ModelName, ModelConfig>,
}

/// Extra time the API listener gets, beyond the render drain, to answer
/// requests still in flight at shutdown.
const SERVER_STOP_GRACE: Duration = Duration::from_secs(5);

/// Serve until a shutdown signal arrives, then stop accepting requests and
/// tear every model down.
pub async fn run(config: Config) -> Result<()> {
    info!(
        "starting easel studio with {} configured model(s)",
        config.models.len()
    );

    let server_grace = config.lifecycle.drain_timeout + SERVER_STOP_GRACE;
    let backend = Arc::new(WorkerBackend::new(config.models, config.worker));
    let manager = Arc::new(LifecycleManager::new(
        backend,
        config.lifecycle,
        EventBus::default(),
    ));

    if let Some(addr) = config.observe_socket {
        observe::spawn_observe_server(addr, manager.clone()).await?;
    }

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let (_, server) = api::spawn_api_server(
        config.api_socket,
        manager.clone(),
        &config.cors_origins,
        async move {
            let _ = stop_rx.await;
        },
    )
    .await?;

    shutdown::wait_for_signal().await;
    info!("shutting down; closing the API listener and tearing down models");
    let _ = stop_tx.send(());
    manager.shutdown().await;

    match tokio::time::timeout(server_grace, server).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("API server task failed: {e}"),
        Err(_) => warn!("API server still busy after {server_grace:?}; exiting anyway"),
    }

    Ok(())
}
