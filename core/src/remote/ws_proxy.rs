//! HQ-side proxy for a remote's binary buffer stream (spec §4.5 "In HQ mode"): one
//! upstream WebSocket per remote, shared across every local subscriber of that remote's
//! sessions, the same "one shared connection, many local subscribers" shape the stream
//! watcher (C6) uses for its file tail.

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use super::{Remote, RemoteId};
use crate::error::{Error, Result};
use crate::session::SessionId;

const UPSTREAM_BROADCAST_CAPACITY: usize = 256;

struct Upstream {
    outbound: mpsc::UnboundedSender<String>,
    inbound: broadcast::Sender<Vec<u8>>,
}

/// Shares one upstream WS connection per remote (spec §4.5), multiplexing every local
/// client's subscribe/unsubscribe frames onto it and fanning out every binary envelope
/// it receives to every subscriber (subscribers filter by the envelope's session id).
#[derive(Default)]
pub struct RemoteBufferProxy {
    upstreams: DashMap<RemoteId, Arc<Upstream>>,
}

impl RemoteBufferProxy {
    pub fn new() -> Self {
        Self::default()
    }

    async fn connect(remote: &Remote) -> Result<Arc<Upstream>> {
        let mut ws_url = remote.url.clone();
        let _ = ws_url.set_scheme(if remote.url.scheme() == "https" { "wss" } else { "ws" });
        ws_url.set_path("/api/sessions/ws");

        let mut request = ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::RemoteUnreachable(e.to_string()))?;
        let auth = format!("Bearer {}", remote.token)
            .parse()
            .map_err(|_| Error::RemoteUnreachable("invalid bearer token".into()))?;
        request.headers_mut().insert("Authorization", auth);

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::RemoteUnreachable(e.to_string()))?;
        let (mut write, mut read) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, _) = broadcast::channel::<Vec<u8>>(UPSTREAM_BROADCAST_CAPACITY);

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if write.send(WsMessage::Text(frame.into())).await.is_err() {
                    break;
                }
            }
        });
        tokio::spawn({
            let inbound_tx = inbound_tx.clone();
            async move {
                while let Some(Ok(message)) = read.next().await {
                    if let WsMessage::Binary(bytes) = message {
                        let _ = inbound_tx.send(bytes.to_vec());
                    }
                }
            }
        });

        Ok(Arc::new(Upstream { outbound: outbound_tx, inbound: inbound_tx }))
    }

    /// Subscribe to `session_id` over `remote`'s shared upstream connection, opening it
    /// if this is the first local subscriber for that remote.
    pub async fn subscribe(&self, remote: &Remote, session_id: SessionId) -> Result<broadcast::Receiver<Vec<u8>>> {
        let upstream = match self.upstreams.get(&remote.id) {
            Some(entry) => entry.clone(),
            None => {
                let upstream = Self::connect(remote).await?;
                self.upstreams.insert(remote.id, upstream.clone());
                upstream
            }
        };
        let frame = serde_json::json!({ "type": "subscribe", "sessionId": session_id.to_string() }).to_string();
        let _ = upstream.outbound.send(frame);
        Ok(upstream.inbound.subscribe())
    }

    pub fn unsubscribe(&self, remote_id: RemoteId, session_id: SessionId) {
        if let Some(upstream) = self.upstreams.get(&remote_id) {
            let frame = serde_json::json!({ "type": "unsubscribe", "sessionId": session_id.to_string() }).to_string();
            let _ = upstream.outbound.send(frame);
        }
    }
}
