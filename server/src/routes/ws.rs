//! C10 + C7: `GET /api/sessions/ws`, the multiplexed binary buffer protocol (spec §4.5).
//! One socket carries every session a client is subscribed to; subscribe/unsubscribe
//! frames name the session, binary envelopes are tagged with it on the wire.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use vt_core::remote::router::Route;
use vt_core::session::SessionId;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Subscribe { #[serde(rename = "sessionId")] session_id: SessionId },
    Unsubscribe { #[serde(rename = "sessionId")] session_id: SessionId },
    Ping,
}

fn control_frame(json: serde_json::Value) -> Message {
    Message::Text(json.to_string().into())
}

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run(socket, state))
}

async fn run(socket: WebSocket, state: AppState) {
    let (mut sink, mut source) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let mut subscriptions: HashMap<SessionId, tokio::task::JoinHandle<()>> = HashMap::new();

    let _ = outbound_tx.send(control_frame(serde_json::json!({ "type": "connected" })));

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = source.next().await {
        let Message::Text(text) = message else { continue };
        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else { continue };
        match frame {
            ClientFrame::Ping => {
                let _ = outbound_tx.send(control_frame(serde_json::json!({ "type": "pong" })));
            }
            ClientFrame::Subscribe { session_id } => {
                subscriptions.entry(session_id).or_insert_with(|| {
                    spawn_subscription(state.clone(), outbound_tx.clone(), session_id)
                });
            }
            ClientFrame::Unsubscribe { session_id } => {
                if let Some(handle) = subscriptions.remove(&session_id) {
                    handle.abort();
                    match state.hq_router.registry().get_remote_by_session_id(session_id) {
                        Some(remote) => state.buffer_proxy.unsubscribe(remote.id, session_id),
                        None => state.buffers.unsubscribe(session_id),
                    }
                    let _ = outbound_tx.send(control_frame(
                        serde_json::json!({ "type": "unsubscribed", "sessionId": session_id.to_string() }),
                    ));
                }
            }
        }
    }

    for (_, handle) in subscriptions {
        handle.abort();
    }
    let _ = writer.await;
}

fn spawn_subscription(state: AppState, outbound_tx: mpsc::UnboundedSender<Message>, session_id: SessionId) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match state.hq_router.route(session_id) {
            Route::Local => {
                let (initial, mut rx) = match state.buffers.subscribe(session_id) {
                    Ok(pair) => pair,
                    Err(error) => {
                        let _ = outbound_tx.send(control_frame(
                            serde_json::json!({ "type": "error", "sessionId": session_id.to_string(), "message": error.to_string() }),
                        ));
                        return;
                    }
                };
                let _ = outbound_tx.send(control_frame(
                    serde_json::json!({ "type": "subscribed", "sessionId": session_id.to_string() }),
                ));
                let _ = outbound_tx.send(Message::Binary(initial.into()));
                while let Ok(bytes) = rx.recv().await {
                    if outbound_tx.send(Message::Binary(bytes)).is_err() {
                        break;
                    }
                }
            }
            Route::Remote(_) => {
                let Some(remote) = state.hq_router.registry().get_remote_by_session_id(session_id) else {
                    return;
                };
                let mut rx = match state.buffer_proxy.subscribe(&remote, session_id).await {
                    Ok(rx) => rx,
                    Err(error) => {
                        let _ = outbound_tx.send(control_frame(
                            serde_json::json!({ "type": "error", "sessionId": session_id.to_string(), "message": error.to_string() }),
                        ));
                        return;
                    }
                };
                let _ = outbound_tx.send(control_frame(
                    serde_json::json!({ "type": "subscribed", "sessionId": session_id.to_string() }),
                ));
                let tag = session_id.to_string();
                while let Ok(bytes) = rx.recv().await {
                    // The remote's upstream WS carries every session subscribed on that
                    // remote on one connection; only forward envelopes tagged for this one.
                    if vt_core::terminal::envelope_session_id(&bytes) != Some(tag.as_str()) {
                        continue;
                    }
                    if outbound_tx.send(Message::Binary(bytes.into())).is_err() {
                        break;
                    }
                }
            }
        }
    })
}
