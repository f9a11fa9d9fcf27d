// SPDX-License-Identifier: PolyForm-Shield-1.0

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use futures::{SinkExt, StreamExt};
use model_runtime::ModelBackend;
use protocol::{LifecycleEvent, StatusReport};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::manager::LifecycleManager;

/// Top-level message sent to observers.
///
/// - `kind = "snapshot"` once, right after connecting
/// - `kind = "event"` for every lifecycle transition afterwards
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ObserveMessage {
    Snapshot { snapshot: StatusReport },
    Event { event: LifecycleEvent },
}

/// Start the read-only observe websocket in the background.
///
/// Returns the bound address.
pub async fn spawn_observe_server<B: ModelBackend>(
    addr: SocketAddr,
    manager: Arc<LifecycleManager<B>>,
) -> Result<SocketAddr> {
    let listener = TcpListener::bind(addr).await?;
    let bound = listener.local_addr()?;
    info!("studio::observe: websocket listening on ws://{bound}");

    tokio::spawn(async move {
        if let Err(e) = accept_loop(listener, manager).await {
            warn!("studio::observe: accept loop stopped: {e}");
        }
    });

    Ok(bound)
}

async fn accept_loop<B: ModelBackend>(
    listener: TcpListener,
    manager: Arc<LifecycleManager<B>>,
) -> Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        info!("studio::observe: accepted connection from {peer_addr}");

        // Subscribe before taking the snapshot so no transition falls between.
        let events_rx = manager.events().subscribe();
        let snapshot = manager.status();

        tokio::spawn(async move {
            if let Err(e) = handle_observer(stream, peer_addr, snapshot, events_rx).await {
                warn!("studio::observe: connection from {peer_addr} ended with error: {e:?}");
            }
        });
    }
}

async fn handle_observer(
    stream: TcpStream,
    peer_addr: SocketAddr,
    snapshot: StatusReport,
    mut events_rx: broadcast::Receiver<LifecycleEvent>,
) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| anyhow!("failed to upgrade websocket from {peer_addr}: {e}"))?;
    let (mut tx, mut rx) = ws_stream.split();

    let text = serde_json::to_string(&ObserveMessage::Snapshot { snapshot })?;
    tx.send(Message::Text(text))
        .await
        .map_err(|e| anyhow!("failed to send snapshot to {peer_addr}: {e}"))?;

    loop {
        tokio::select! {
            biased;

            evt = events_rx.recv() => {
                match evt {
                    Ok(event) => {
                        let text = serde_json::to_string(&ObserveMessage::Event { event })?;
                        if let Err(e) = tx.send(Message::Text(text)).await {
                            warn!("studio::observe: failed to send event to {peer_addr}: {e:?}");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("studio::observe: {peer_addr} fell behind; skipped {skipped} event(s)");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            // Client frames are ignored; reading keeps disconnects visible.
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => {
                        info!("studio::observe: {peer_addr} disconnected");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("studio::observe: websocket error from {peer_addr}: {e:?}");
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::manager::LifecycleSettings;
    use crate::testing::FakeBackend;
    use protocol::GenerateParams;
    use serde_json::Value;
    use tokio_tungstenite::connect_async;

    async fn next_json<S>(rx: &mut S) -> Value
    where
        S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match rx.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn observer_gets_snapshot_then_events() {
        let backend = Arc::new(FakeBackend::new());
        let manager = Arc::new(LifecycleManager::new(
            backend,
            LifecycleSettings::default(),
            EventBus::new(64),
        ));
        let addr = spawn_observe_server("127.0.0.1:0".parse().unwrap(), manager.clone())
            .await
            .unwrap();

        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        let (_tx, mut rx) = ws.split();

        let snapshot = next_json(&mut rx).await;
        assert_eq!(snapshot["kind"], "snapshot");
        assert!(snapshot["snapshot"]["active"].is_null());

        manager
            .generate("flux-schnell", &GenerateParams::default())
            .await
            .unwrap();

        let first = next_json(&mut rx).await;
        assert_eq!(first["kind"], "event");
        assert_eq!(first["event"]["type"], "load_started");
        assert_eq!(first["event"]["model"], "flux-schnell");
    }
}
