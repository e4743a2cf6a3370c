//! Live progress subscribe endpoints.
//!
//! GET /speedtests/ws     : WebSocket, one JSON text frame per event
//! GET /speedtests/events : Server-Sent Events, one `data:` line per event
//!
//! Both forward the progress channel's events verbatim. A client that goes
//! away only drops its own subscription; in-flight legs keep running.

use std::convert::Infallible;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::SinkExt;
use futures::stream::{Stream, StreamExt};

use crate::state::AppState;

/// Axum handler: upgrades HTTP to WebSocket.
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut subscription = state.progress().subscribe();
    let subscriber = subscription.id();

    tracing::debug!(subscriber, "progress client connected");

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to serialize progress event");
                        continue;
                    }
                };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.progress().unsubscribe(subscription);
    tracing::debug!(subscriber, "progress client disconnected");
}

pub async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = state
        .progress()
        .subscribe()
        .into_stream()
        .filter_map(|event| async move {
            match Event::default().json_data(&event) {
                Ok(sse_event) => Some(Ok(sse_event)),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize progress event");
                    None
                }
            }
        });

    Sse::new(events).keep_alive(KeepAlive::default())
}
