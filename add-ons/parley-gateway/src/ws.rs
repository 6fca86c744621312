//! `/ws/audio`: bridges one WebSocket to one voice session.
//!
//! Binary frames carry audio (or the `<END>` marker), text frames carry `<END>` /
//! `<CANCEL>`, and every server message goes out as a JSON text frame.

use crate::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use parley_voice::{ClientFrame, ServerMessage};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// What an inbound WebSocket message means to the session.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Incoming {
    Frame(ClientFrame),
    Skip,
    Closed,
}

pub(crate) fn incoming(message: Message) -> Incoming {
    match message {
        Message::Binary(bytes) => Incoming::Frame(ClientFrame::from_binary(bytes)),
        Message::Text(text) => Incoming::Frame(ClientFrame::from_text(&text)),
        Message::Close(_) => Incoming::Closed,
        // axum answers pings itself
        Message::Ping(_) | Message::Pong(_) => Incoming::Skip,
    }
}

/// JSON text frame for an outbound message; `None` (logged) when it cannot be serialized.
pub(crate) fn outgoing(message: &ServerMessage) -> Option<Message> {
    match message.to_json() {
        Ok(json) => Some(Message::Text(json)),
        Err(e) => {
            warn!(target: "parley::gateway", ?message, "dropping unserializable message: {}", e);
            None
        }
    }
}

pub async fn ws_audio(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let capacity = state.manager.config().synthesis_lookahead + 16;
    let (frame_tx, frame_rx) = mpsc::channel::<ClientFrame>(capacity);
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(capacity);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let Some(frame) = outgoing(&message) else {
                continue;
            };
            if let Err(e) = sender.send(frame).await {
                debug!(target: "parley::gateway", "websocket send failed: {}", e);
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let reader = tokio::spawn(async move {
        while let Some(next) = receiver.next().await {
            let message = match next {
                Ok(m) => m,
                Err(e) => {
                    debug!(target: "parley::gateway", "websocket receive failed: {}", e);
                    break;
                }
            };
            match incoming(message) {
                Incoming::Frame(frame) => {
                    if frame_tx.send(frame).await.is_err() {
                        break;
                    }
                }
                Incoming::Skip => {}
                Incoming::Closed => break,
            }
        }
    });

    // out_tx moves into the session; the writer drains and closes once the session ends.
    match state
        .manager
        .run_session(ReceiverStream::new(frame_rx), out_tx)
        .await
    {
        Ok(summary) => info!(
            target: "parley::gateway",
            id = %summary.id,
            turns = summary.turns_completed,
            reason = ?summary.close_reason,
            "websocket session ended"
        ),
        Err(e) => warn!(target: "parley::gateway", "could not start session: {}", e),
    }

    reader.abort();
    if let Err(e) = writer.await {
        debug!(target: "parley::gateway", "writer task ended abnormally: {}", e);
    }
}
