//! C6: stream watcher — SSE fan-out over a session's asciicast log with at most one file
//! tail per session regardless of subscriber count (spec §4.4).

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc, Notify};

use crate::asciicast::{self, Event};
use crate::session::SessionId;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const POLL_FALLBACK_INTERVAL: Duration = Duration::from_millis(200);
/// Approximates the spec's "1 MiB bounded output buffer" as a bounded mailbox of
/// messages rather than tracked bytes; individual asciicast lines are small and this
/// capacity overflows at a comparable point for typical shell output.
const SINK_CAPACITY: usize = 512;
const BROADCAST_CAPACITY: usize = 1024;

/// One pre-formatted SSE line: `data: <json>\n\n`, `:heartbeat\n\n`, or an
/// `event: error\n\n` terminator (spec §4.4).
pub type SseLine = String;

fn data_line(json: &str) -> SseLine {
    format!("data: {json}\n\n")
}

fn heartbeat_line() -> SseLine {
    ":heartbeat\n\n".to_string()
}

fn error_line(message: &str) -> SseLine {
    format!("event: error\ndata: {message}\n\n")
}

struct Tail {
    log_path: PathBuf,
    broadcast_tx: broadcast::Sender<SseLine>,
    subscriber_count: AtomicUsize,
    shutdown: Notify,
}

/// Delivers a session's live asciicast stream to SSE subscribers (spec §4.4
/// `addClient`/`removeClient`).
pub struct StreamWatcher {
    tails: DashMap<SessionId, Arc<Tail>>,
    next_subscriber_id: AtomicU64,
}

impl Default for StreamWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamWatcher {
    pub fn new() -> Self {
        Self { tails: DashMap::new(), next_subscriber_id: AtomicU64::new(0) }
    }

    /// Attach a new SSE subscriber to `session_id`'s stream, starting the shared tail task
    /// if this is the first subscriber. Returns a subscriber id (for `remove_client`) and
    /// a receiver of formatted SSE lines, already seeded with the header line.
    pub fn add_client(&self, session_id: SessionId, log_path: PathBuf) -> (u64, mpsc::Receiver<SseLine>) {
        let tail = self
            .tails
            .entry(session_id)
            .or_insert_with(|| {
                let tail = Arc::new(Tail {
                    log_path: log_path.clone(),
                    broadcast_tx: broadcast::channel(BROADCAST_CAPACITY).0,
                    subscriber_count: AtomicUsize::new(0),
                    shutdown: Notify::new(),
                });
                tokio::spawn(run_tail(tail.clone()));
                tail
            })
            .clone();
        tail.subscriber_count.fetch_add(1, Ordering::SeqCst);

        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        let mut broadcast_rx = tail.broadcast_tx.subscribe();
        tokio::spawn(async move {
            if let Ok(mut reader) = asciicast::Reader::open(&tail.log_path) {
                if let Ok(header) = reader.read_header() {
                    if let Ok(json) = serde_json::to_string(&header) {
                        let _ = tx.try_send(data_line(&json));
                    }
                }
            }
            loop {
                match broadcast_rx.recv().await {
                    Ok(line) => {
                        if tx.try_send(line).is_err() {
                            let _ = tx.try_send(error_line("subscriber too slow, disconnecting"));
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let _ = tx.try_send(error_line("subscriber too slow, disconnecting"));
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        (subscriber_id, rx)
    }

    /// Detach a subscriber (the id `add_client` returned for it). When the last one
    /// leaves, the shared tail task stops.
    pub fn remove_client(&self, session_id: SessionId, _subscriber_id: u64) {
        if let Some(tail) = self.tails.get(&session_id) {
            if tail.subscriber_count.fetch_sub(1, Ordering::SeqCst) <= 1 {
                tail.shutdown.notify_waiters();
                drop(tail);
                self.tails.remove(&session_id);
            }
        }
    }
}

/// The single per-session tail task: watches `stdout` for new asciicast lines (via
/// `notify` when available, falling back to polling) and broadcasts each as an SSE line.
/// Ends cleanly once an `"x"` exit event has been forwarded.
async fn run_tail(tail: Arc<Tail>) {
    let mut reader = match asciicast::Reader::open(&tail.log_path) {
        Ok(reader) => reader,
        Err(_) => return,
    };
    if reader.read_header().is_err() {
        return;
    }

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<()>();
    let _watcher = install_watcher(&tail.log_path, notify_tx);

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = tail.shutdown.notified() => break,
            _ = heartbeat.tick() => {
                let _ = tail.broadcast_tx.send(heartbeat_line());
            }
            woken = notify_rx.recv() => {
                if woken.is_none() {
                    break;
                }
                if drain_new_events(&mut reader, &tail) {
                    break;
                }
            }
            _ = tokio::time::sleep(POLL_FALLBACK_INTERVAL) => {
                if drain_new_events(&mut reader, &tail) {
                    break;
                }
            }
        }
    }
}

/// Reads and broadcasts newly available events; returns true once an exit event has
/// been forwarded (the stream is then over, per spec §4.4).
fn drain_new_events(reader: &mut asciicast::Reader, tail: &Tail) -> bool {
    let Ok(events) = reader.read_new_events() else { return false };
    let mut saw_exit = false;
    for event in events {
        if let Ok(json) = serde_json::to_string(&event) {
            let _ = tail.broadcast_tx.send(data_line(&json));
        }
        if matches!(event, Event { kind: crate::asciicast::EventKind::Exit(_), .. }) {
            saw_exit = true;
        }
    }
    saw_exit
}

/// Installs an OS-native watch on the log's parent directory (Design Notes §9 preference
/// for notification primitives over polling), falling back silently to the poll branch
/// in `run_tail` when the watch cannot be installed.
fn install_watcher(log_path: &std::path::Path, notify_tx: mpsc::UnboundedSender<()>) -> Option<RecommendedWatcher> {
    let parent = log_path.parent()?;
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = notify_tx.send(());
            }
        },
        NotifyConfig::default(),
    )
    .ok()?;
    watcher.watch(parent, RecursiveMode::NonRecursive).ok()?;
    Some(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asciicast::Header;

    #[tokio::test]
    async fn new_subscriber_receives_header_then_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let header = Header::new(80, 24, Some("/bin/sh".into()));
        let mut writer = asciicast::Writer::create(&path, &header).unwrap();

        let watcher = StreamWatcher::new();
        let session_id = SessionId::new();
        let (subscriber_id, mut rx) = watcher.add_client(session_id, path.clone());

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(first.starts_with("data: "));
        assert!(first.contains("\"width\":80"));

        writer.output("hello").unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(second.contains("hello"));

        watcher.remove_client(session_id, subscriber_id);
    }
}
