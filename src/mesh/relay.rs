//! Relay link: JSON signaling frames over a WebSocket
//!
//! The relay is only used to exchange connection-setup metadata.
//! Inbound frames are validated here and posted into the engine queue;
//! outbound frames arrive over an mpsc from the engine.

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::engine::{EngineEvent, RelayEvent};
use super::types::{ClientFrame, RelayFrame};
use crate::error::Result;

/// Connect to the relay and run the signaling link, reconnecting with a
/// fixed delay until shutdown is signaled.
pub async fn relay_task(
    url: String,
    events: mpsc::Sender<EngineEvent>,
    mut outbound: mpsc::Receiver<ClientFrame>,
    mut shutdown_rx: watch::Receiver<bool>,
    reconnect_delay: Duration,
) {
    loop {
        if let Err(e) = run_link(&url, &events, &mut outbound, &mut shutdown_rx).await {
            warn!("Relay link {} failed: {}", url, e);
        }
        let _ = events.send(EngineEvent::Relay(RelayEvent::Disconnected)).await;

        if *shutdown_rx.borrow() {
            return;
        }
        debug!("Reconnecting to {} in {:?}", url, reconnect_delay);
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
    }
}

async fn run_link(
    url: &str,
    events: &mpsc::Sender<EngineEvent>,
    outbound: &mut mpsc::Receiver<ClientFrame>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<()> {
    info!("Connecting to relay: {}", url);
    let (ws_stream, _) = connect_async(url).await?;
    let (mut write, mut read) = ws_stream.split();

    if events
        .send(EngineEvent::Relay(RelayEvent::Connected))
        .await
        .is_err()
    {
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
            }
            Some(frame) = outbound.recv() => {
                let text = serde_json::to_string(&frame)?;
                write.send(Message::Text(text.into())).await?;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Frames that do not parse as signaling are not
                        // fatal to the link
                        match serde_json::from_str::<RelayFrame>(text.as_str()) {
                            Ok(frame) => {
                                if events
                                    .send(EngineEvent::Relay(RelayEvent::Frame(frame)))
                                    .await
                                    .is_err()
                                {
                                    return Ok(());
                                }
                            }
                            Err(e) => debug!("Ignoring unparseable relay frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!("Relay closed: {}", url);
                        return Ok(());
                    }
                    Some(Err(e)) => {
                        return Err(e.into());
                    }
                    _ => {}
                }
            }
        }
    }
}
