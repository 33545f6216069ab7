//! WebSocket event stream.
//!
//! Each client gets its own event-bus subscription; envelopes are relayed
//! as text frames exactly as the bus serialized them. A connection snapshot
//! goes out first so late joiners see the current socket state without
//! waiting for a transition.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};

use super::AppState;
use crate::events::BusEvent;

pub async fn event_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (sub_id, mut rx) = state.bus.subscribe();
    tracing::debug!("WS client subscribed ({sub_id})");

    // Current connection state first.
    let snapshot = BusEvent::ConnectionStatus(state.connection.health()).envelope();
    if sink.send(Message::Text(snapshot.into())).await.is_err() {
        state.bus.unsubscribe(sub_id);
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(payload) = event else { break };
                if sink.send(Message::Text(payload.into())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    // Clients don't speak to us; anything but ping/pong and
                    // close is ignored.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.bus.unsubscribe(sub_id);
    tracing::debug!("WS client gone ({sub_id})");
}
