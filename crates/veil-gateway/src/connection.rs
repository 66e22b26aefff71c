use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use veil_types::error::RelayError;
use veil_types::events::{ClientCommand, ServerEvent};

use crate::relay::Relay;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Drive a single WebSocket connection from accept to disconnect.
///
/// State machine: connected (unregistered) until a `register` command binds
/// an identity; then a member of zero or more rooms. Disconnect removes the
/// live binding and all room memberships, nothing else.
pub async fn handle_socket(socket: WebSocket, relay: Relay) {
    let connection_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();

    let mut targeted_rx = relay.attach(connection_id).await;
    let mut broadcast_rx = relay.subscribe();
    let relay_recv = relay.clone();

    info!("connection {connection_id} opened");

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward broadcasts + targeted events to the client, with heartbeat.
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("connection {connection_id} lagged {n} broadcasts behind");
                            continue;
                        }
                        Err(_) => break,
                    };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                result = targeted_rx.recv() => {
                    let Some(event) = result else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("connection {connection_id} missed {missed_heartbeats} pongs, dropping");
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read commands from the client. Each command runs to completion
    // before the next one is picked up.
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(command) => {
                        relay_recv.handle_command(connection_id, command).await;
                    }
                    Err(e) => {
                        warn!(
                            "connection {connection_id} sent a malformed command: {e} -- raw: {}",
                            &text[..text.len().min(200)]
                        );
                        let err = RelayError::MalformedRequest(e.to_string());
                        relay_recv.send_to(connection_id, ServerEvent::error(&err)).await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Whichever half finishes first tears down the other.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    relay.disconnect(connection_id).await;
    info!("connection {connection_id} closed");
}

async fn send_event(
    sender: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("failed to encode event: {e}");
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}
