//! Live event stream over WebSocket.
//!
//! Observers connect to `/api/v1/events` and receive one JSON text
//! frame per [`LiveEvent`]. The stream is lossy: a client that stops
//! reading is unsubscribed by the bus and sees its connection close,
//! at which point it reconnects and re-fetches the job list.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;

use elara_events::LiveBus;

use crate::auth::OperatorAuth;
use crate::state::AppState;

/// GET /api/v1/events
pub async fn events_ws(
    _auth: OperatorAuth,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.bus))
}

async fn handle_socket(socket: WebSocket, bus: Arc<LiveBus>) {
    let (sub_id, mut rx) = bus.subscribe().await;
    tracing::info!(sub_id, "event stream connected");

    let (mut sink, mut stream) = socket.split();

    // Forward bus events to the socket. Ends when the bus drops the
    // subscriber (lagging) or the sink breaks.
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "failed to serialize live event");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    // The stream is one-way; we only watch for the close handshake.
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    bus.unsubscribe(sub_id).await;
    send_task.abort();
    tracing::info!(sub_id, "event stream disconnected");
}
