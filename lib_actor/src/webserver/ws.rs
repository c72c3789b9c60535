//! WebSocket to the user-space client (`GET /private/ws`).
//!
//! One connection at a time owns the user-egress receiver. Stale messages
//! that piled up while nobody was connected are discarded at connect; the
//! reader and writer halves run concurrently and the connection ends as
//! soon as either does, leaving whatever is still queued for the next
//! connection.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};

use crate::router::QueueReceiver;
use crate::types::{to_value, LogoutRequest, MessageKind, UdsMessage};

use super::AppState;

/// What to do with one incoming text frame.
#[derive(Debug)]
enum FrameAction {
    /// Answer directly on the socket (keepalive).
    Reply(UdsMessage),
    /// Hand over to the router.
    Enqueue(UdsMessage),
    /// Hand over to the router, then drop the connection.
    EnqueueAndClose(UdsMessage),
    Ignore,
}

/// Keepalive is resolved here; `Close` becomes a logout with empty
/// identifiers; everything else goes to broker-ingress untouched.
fn route_client_frame(text: &str) -> FrameAction {
    let message: UdsMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            log::warn!("Unknown message received on websocket: {e}");
            return FrameAction::Ignore;
        }
    };
    match message.msg_type {
        MessageKind::Ping => FrameAction::Reply(UdsMessage::bare(MessageKind::Pong)),
        MessageKind::Close => FrameAction::EnqueueAndClose(UdsMessage::new(
            MessageKind::Logout,
            to_value(&LogoutRequest::null(false)),
        )),
        _ => FrameAction::Enqueue(message),
    }
}

/// Discards everything still queued from before this connection.
fn drain_stale(egress: &mut QueueReceiver) -> usize {
    let mut discarded = 0;
    while egress.try_recv().is_ok() {
        discarded += 1;
    }
    discarded
}

pub async fn websocket(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    upgrade: WebSocketUpgrade,
) -> Response {
    if !addr.ip().is_loopback() {
        return StatusCode::FORBIDDEN.into_response();
    }
    upgrade.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    // Owning the receiver also serializes connections: a second client
    // blocks here until the first one is gone.
    let mut egress = state.user_egress_rx.lock().await;
    let discarded = drain_stale(&mut egress);
    if discarded > 0 {
        log::debug!("Discarded {discarded} stale messages on websocket connect");
    }
    log::debug!("Websocket connection ready");

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match route_client_frame(text.as_str()) {
                    FrameAction::Reply(message) => {
                        if send_message(&mut sink, &message).await.is_err() {
                            break;
                        }
                    }
                    FrameAction::Enqueue(message) => {
                        let _ = state.ingress.send(message);
                    }
                    FrameAction::EnqueueAndClose(message) => {
                        let _ = state.ingress.send(message);
                        break;
                    }
                    FrameAction::Ignore => {}
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // transport level ping/pong/binary
                Some(Err(e)) => {
                    log::error!("Websocket read error: {e}");
                    break;
                }
            },
            queued = egress.recv() => match queued {
                Some(message) => {
                    if send_message(&mut sink, &message).await.is_err() {
                        break;
                    }
                }
                // Producers gone: the server is tearing down
                None => break,
            },
        }
    }
    log::debug!("Websocket connection closed");
}

async fn send_message(
    sink: &mut (impl futures_util::Sink<Message, Error = axum::Error> + Unpin),
    message: &UdsMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).unwrap_or_default();
    sink.send(Message::Text(text.into())).await
}
