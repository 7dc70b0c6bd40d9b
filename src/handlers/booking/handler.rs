//! Booking WebSocket handler
//!
//! One socket carries one booking conversation: JSON control messages and
//! binary microphone audio in, JSON events and binary playback audio out.

use axum::{
    Extension,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::{select, time::Duration};
use tracing::{debug, error, info, warn};

use crate::middleware::ClientIp;
use crate::state::AppState;

use super::messages::{BookingIncomingMessage, BookingMessageRoute, BookingOutgoingMessage};
use super::session::BookingSession;

/// Optimized channel buffer size for audio workloads
const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Maximum WebSocket frame size (1 MB)
const MAX_WS_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum WebSocket message size (1 MB)
const MAX_WS_MESSAGE_SIZE: usize = 1024 * 1024;

/// Upper bound on how often the idle check runs
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Time allowed for queued messages to flush after the loop ends
const SENDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Returns the connection slot taken by the middleware when the socket ends.
struct ConnectionSlot {
    state: Arc<AppState>,
    ip: Option<IpAddr>,
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        if let Some(ip) = self.ip {
            self.state.release_connection(ip);
        }
    }
}

/// Booking WebSocket handler
///
/// Upgrades the HTTP connection to a WebSocket carrying one voice booking.
///
/// # Arguments
/// * `ws` - The WebSocket upgrade request from Axum
/// * `state` - Application state containing configuration
/// * `client_ip` - Set by the connection limit middleware when it counted this socket
pub async fn booking_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    client_ip: Option<Extension<ClientIp>>,
) -> Response {
    let ip = client_ip.map(|Extension(ClientIp(ip))| ip);
    info!(client_ip = ?ip, "Booking WebSocket connection upgrade requested");

    // Owned by the upgrade callback, so a failed upgrade releases it too.
    let slot = ConnectionSlot {
        state: state.clone(),
        ip,
    };

    ws.max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .on_failed_upgrade(|e: axum::Error| warn!(error = %e, "Booking WebSocket upgrade failed"))
        .on_upgrade(move |socket| handle_booking_socket(socket, state, slot))
}

/// Handle the booking WebSocket connection
async fn handle_booking_socket(socket: WebSocket, app_state: Arc<AppState>, _slot: ConnectionSlot) {
    info!(
        active_connections = app_state.ws_connection_count(),
        "Booking WebSocket connection established"
    );

    let (mut sender, mut receiver) = socket.split();
    let (message_tx, mut message_rx) = mpsc::channel::<BookingMessageRoute>(CHANNEL_BUFFER_SIZE);

    // Sender task for outgoing messages
    let mut sender_task = tokio::spawn(async move {
        while let Some(route) = message_rx.recv().await {
            let should_close = matches!(route, BookingMessageRoute::Close);

            let result = match route {
                BookingMessageRoute::Outgoing(message) => match serde_json::to_string(&message) {
                    Ok(json_str) => sender.send(Message::Text(json_str.into())).await,
                    Err(e) => {
                        error!("Failed to serialize outgoing message: {}", e);
                        continue;
                    }
                },
                BookingMessageRoute::Audio(data) => sender.send(Message::Binary(data)).await,
                BookingMessageRoute::Close => {
                    info!("Closing booking WebSocket connection");
                    sender.send(Message::Close(None)).await
                }
            };

            if let Err(e) = result {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }

            if should_close {
                break;
            }
        }
    });

    let (mut session, mut signal_rx) = BookingSession::new(app_state.clone(), message_tx.clone());

    // Initial snapshot so the UI can render the idle screen.
    let _ = message_tx
        .send(BookingMessageRoute::Outgoing(BookingOutgoingMessage::state(
            session.machine().snapshot(),
        )))
        .await;

    let idle_timeout = app_state.config.idle_timeout();
    let check_interval = idle_timeout
        .map(|timeout| timeout.min(IDLE_CHECK_INTERVAL))
        .unwrap_or(IDLE_CHECK_INTERVAL);
    let mut last_activity = std::time::Instant::now();

    loop {
        select! {
            msg_result = receiver.next() => {
                last_activity = std::time::Instant::now();

                match msg_result {
                    Some(Ok(msg)) => {
                        if !process_booking_message(msg, &mut session, &message_tx).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Booking WebSocket error: {}", e);
                        break;
                    }
                    None => {
                        info!("Booking WebSocket connection closed by client");
                        break;
                    }
                }
            }
            Some(signal) = signal_rx.recv() => {
                session.handle_signal(signal).await;
            }
            _ = tokio::time::sleep(check_interval), if idle_timeout.is_some() => {
                if let Some(timeout) = idle_timeout
                    && last_activity.elapsed() > timeout
                {
                    warn!(
                        idle_secs = last_activity.elapsed().as_secs(),
                        "Booking WebSocket idle, closing connection"
                    );
                    let _ = message_tx
                        .send(BookingMessageRoute::Outgoing(BookingOutgoingMessage::error(
                            "idle_timeout",
                            "Connection closed due to inactivity",
                        )))
                        .await;
                    let _ = message_tx
                        .send(BookingMessageRoute::Outgoing(BookingOutgoingMessage::Closing {
                            reason: "idle_timeout".to_string(),
                        }))
                        .await;
                    break;
                }
                debug!("Booking WebSocket idle check - still active");
            }
        }
    }

    // Cleanup
    session.shutdown().await;
    let _ = message_tx.send(BookingMessageRoute::Close).await;
    drop(message_tx);
    drop(session);

    if tokio::time::timeout(SENDER_DRAIN_TIMEOUT, &mut sender_task)
        .await
        .is_err()
    {
        sender_task.abort();
    }

    info!("Booking WebSocket connection terminated");
}

/// Process incoming WebSocket message
async fn process_booking_message(
    msg: Message,
    session: &mut BookingSession,
    message_tx: &mpsc::Sender<BookingMessageRoute>,
) -> bool {
    match msg {
        Message::Text(text) => {
            debug!("Received text message: {} bytes", text.len());

            let incoming_msg: BookingIncomingMessage = match serde_json::from_str(&text) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("Failed to parse booking message: {}", e);
                    let _ = message_tx
                        .send(BookingMessageRoute::Outgoing(BookingOutgoingMessage::error(
                            "parse_error",
                            format!("Invalid message format: {e}"),
                        )))
                        .await;
                    return true;
                }
            };

            if let Err(e) = incoming_msg.validate_size() {
                warn!("Message validation failed: {}", e);
                let _ = message_tx
                    .send(BookingMessageRoute::Outgoing(BookingOutgoingMessage::error(
                        "validation_error",
                        e.to_string(),
                    )))
                    .await;
                return true;
            }

            session.handle_message(incoming_msg).await;
            true
        }
        Message::Binary(data) => {
            debug!("Received binary audio: {} bytes", data.len());
            session.handle_audio(data).await;
            true
        }
        Message::Ping(_) => {
            debug!("Received ping");
            true
        }
        Message::Pong(_) => {
            debug!("Received pong");
            true
        }
        Message::Close(_) => {
            info!("Booking WebSocket close received");
            false
        }
    }
}
