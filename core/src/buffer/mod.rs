//! C7: buffer aggregator — binary WebSocket snapshot delivery, coalesced per session
//! (spec §4.5). Subscribing gets an immediate full snapshot; thereafter the aggregator
//! re-encodes on a 16ms timer per session and suppresses byte-identical re-sends.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{broadcast, Notify};

use crate::error::{Error, Result};
use crate::session::manager::LiveEvent;
use crate::session::{SessionId, SessionManager};
use crate::terminal::snapshot::encode_ws_envelope;
use crate::terminal::{TerminalEngine, TerminalRegistry};

const BROADCAST_CAPACITY: usize = 64;

struct SessionBroadcast {
    tx: broadcast::Sender<Bytes>,
    subscriber_count: AtomicUsize,
    shutdown: Notify,
}

/// Coalesces live terminal updates into binary snapshot frames for WS subscribers
/// (spec §4.5). Shares `TerminalEngine`s with anything else that reads a session's
/// buffer (e.g. a future text endpoint) via `TerminalRegistry`.
pub struct BufferAggregator {
    session_manager: Arc<SessionManager>,
    terminal_registry: Arc<TerminalRegistry>,
    broadcasts: DashMap<SessionId, Arc<SessionBroadcast>>,
    coalesce: Duration,
}

impl BufferAggregator {
    pub fn new(session_manager: Arc<SessionManager>, terminal_registry: Arc<TerminalRegistry>, coalesce: Duration) -> Self {
        Self { session_manager, terminal_registry, broadcasts: DashMap::new(), coalesce }
    }

    /// Shared with the server's text/buffer routes so every reader of a session's
    /// terminal state goes through the same cached `TerminalEngine`.
    pub fn engine_for(&self, session_id: SessionId) -> Result<Arc<TerminalEngine>> {
        if let Some(engine) = self.terminal_registry.get(session_id) {
            return Ok(engine);
        }
        let session = self.session_manager.get_session(session_id)?.ok_or(Error::SessionNotFound(session_id))?;
        let paths = self
            .session_manager
            .session_paths(session_id)?
            .ok_or(Error::SessionNotFound(session_id))?;
        let scrollback_rows = self.session_manager.config().scrollback_rows;
        let engine = self.terminal_registry.get_or_insert_with(session_id, || {
            TerminalEngine::replay_from_log(&paths.stdout, scrollback_rows)
                .unwrap_or_else(|_| TerminalEngine::new(session.cols, session.rows, scrollback_rows))
        });
        Ok(engine)
    }

    /// Begin receiving binary snapshots for a session (spec §4.5 `{type:"subscribe"}`).
    /// Returns the immediate full-snapshot envelope plus a receiver of further updates.
    pub fn subscribe(&self, session_id: SessionId) -> Result<(Vec<u8>, broadcast::Receiver<Bytes>)> {
        let engine = self.engine_for(session_id)?;
        let state = self
            .broadcasts
            .entry(session_id)
            .or_insert_with(|| {
                let state = Arc::new(SessionBroadcast {
                    tx: broadcast::channel(BROADCAST_CAPACITY).0,
                    subscriber_count: AtomicUsize::new(0),
                    shutdown: Notify::new(),
                });
                self.spawn_coalescer(session_id, engine.clone(), state.clone());
                state
            })
            .clone();
        state.subscriber_count.fetch_add(1, Ordering::SeqCst);

        let initial = encode_ws_envelope(&session_id.to_string(), &engine.snapshot().encode());
        Ok((initial, state.tx.subscribe()))
    }

    /// `{type:"unsubscribe"}` (spec §4.5). When the last subscriber for a session leaves,
    /// the coalescing task stops and the terminal engine stays cached for the next one.
    pub fn unsubscribe(&self, session_id: SessionId) {
        if let Some(state) = self.broadcasts.get(&session_id) {
            if state.subscriber_count.fetch_sub(1, Ordering::SeqCst) <= 1 {
                state.shutdown.notify_waiters();
                drop(state);
                self.broadcasts.remove(&session_id);
            }
        }
    }

    fn spawn_coalescer(&self, session_id: SessionId, engine: Arc<TerminalEngine>, state: Arc<SessionBroadcast>) {
        let Ok(mut live_rx) = self.session_manager.subscribe_live(session_id) else { return };
        let coalesce = self.coalesce;
        tokio::spawn(async move {
            let mut dirty = false;
            let mut last_sent: Option<Vec<u8>> = None;
            let mut ticker = tokio::time::interval(coalesce);
            loop {
                tokio::select! {
                    _ = state.shutdown.notified() => break,
                    event = live_rx.recv() => {
                        match event {
                            Ok(LiveEvent::Output(bytes)) => {
                                engine.feed(&bytes);
                                dirty = true;
                            }
                            Ok(LiveEvent::Resize { cols, rows }) => {
                                engine.resize(cols, rows);
                                dirty = true;
                            }
                            Ok(LiveEvent::Exit(_)) => break,
                            Err(broadcast::error::RecvError::Lagged(_)) => dirty = true,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                    _ = ticker.tick() => {
                        if dirty {
                            let encoded = encode_ws_envelope(&session_id.to_string(), &engine.snapshot().encode());
                            if last_sent.as_deref() != Some(encoded.as_slice()) {
                                let _ = state.tx.send(Bytes::from(encoded.clone()));
                                last_sent = Some(encoded);
                            }
                            dirty = false;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::session::manager::CreateOptions;

    fn aggregator() -> (BufferAggregator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.root = dir.path().to_path_buf();
        let session_manager = Arc::new(SessionManager::new(Arc::new(config)).unwrap());
        let terminal_registry = Arc::new(TerminalRegistry::new());
        (BufferAggregator::new(session_manager, terminal_registry, Duration::from_millis(16)), dir)
    }

    #[tokio::test]
    async fn subscribe_unknown_session_is_not_found() {
        let (aggregator, _dir) = aggregator();
        let err = aggregator.subscribe(SessionId::new()).unwrap_err();
        assert!(matches!(err, Error::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn subscribe_returns_immediate_snapshot() {
        let (aggregator, _dir) = aggregator();
        let opts = CreateOptions { cwd: std::env::temp_dir(), ..CreateOptions::default() };
        let session = aggregator
            .session_manager
            .create_session(vec!["/bin/sh".into()], opts)
            .unwrap();
        let (initial, _rx) = aggregator.subscribe(session.id).unwrap();
        assert_eq!(initial[0], 0xBF);
        let _ = aggregator.session_manager.kill_session(session.id, crate::pty::Signal::Kill);
    }
}
