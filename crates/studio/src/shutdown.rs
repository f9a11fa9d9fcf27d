// SPDX-License-Identifier: PolyForm-Shield-1.0

use tokio::signal;
use tracing::{info, warn};

/// Resolve on ctrl-c, or on SIGTERM where the platform has it.
pub async fn wait_for_signal() {
    info!("studio::shutdown: waiting for shutdown signal");

    #[cfg(unix)]
    {
        let mut term = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                warn!("studio::shutdown: cannot listen for SIGTERM: {e}");
                let _ = signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("studio::shutdown: ctrl-c received"),
            _ = term.recv() => info!("studio::shutdown: SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
        info!("studio::shutdown: ctrl-c received");
    }
}
