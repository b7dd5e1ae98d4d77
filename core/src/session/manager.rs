//! C2: the PTY session manager. Owns every live session's PTY bridge, asciicast writer,
//! control socket, and in-memory metadata; `store` persists the durable slice of that
//! metadata to `session.json`.

use bytes::Bytes;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::UnixListener;
use tokio::sync::broadcast;

use super::control::ControlHandler;
use super::store;
use super::{derive_name, Session, SessionId, SessionPaths, SessionStatus};
use crate::asciicast;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pty::{self, PtySpawnOptions, Signal};

/// Input to `sendInput` (spec §4.1): exactly one of free text or a symbolic key token.
#[derive(Debug, Clone)]
pub enum Input {
    Text(String),
    Key(String),
}

/// `createSession` options (spec §4.1).
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub name: Option<String>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
    pub env: Vec<(String, String)>,
    pub term: String,
    /// Pre-assigned id (spec §6.3: the caller generates the id up front so it can offer
    /// it to the external terminal-spawn socket before deciding whether to spawn
    /// in-process). `None` generates a fresh one as usual.
    pub id: Option<SessionId>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            name: None,
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            cols: 80,
            rows: 24,
            env: Vec::new(),
            term: "xterm-256color".to_string(),
            id: None,
        }
    }
}

/// Events the terminal state engine (C4) consumes live, in the same order they are
/// appended to the asciicast log (spec §4.1: "forwarded in-memory ... no re-read from
/// disk on the hot path").
#[derive(Debug, Clone)]
pub enum LiveEvent {
    Output(Bytes),
    Resize { cols: u16, rows: u16 },
    Exit(i32),
}

const LIVE_BROADCAST_CAPACITY: usize = 1024;
const STARTING_DEADLINE_MILLIS: u64 = 500;

fn validate_size(cols: u16, rows: u16) -> Result<()> {
    if !(1..=1000).contains(&cols) || !(1..=1000).contains(&rows) {
        return Err(Error::InvalidArgument(format!(
            "cols/rows must be in 1..=1000, got {cols}x{rows}"
        )));
    }
    Ok(())
}

/// One live (in this process's lifetime) session: PTY bridge, log writer, control
/// socket, and the authoritative in-memory metadata mirror of `session.json`.
struct LiveSession {
    id: SessionId,
    paths: SessionPaths,
    bridge: pty::PtyBridge,
    resize_tx: pty::ResizeSender,
    meta: RwLock<Session>,
    writer: Mutex<asciicast::Writer>,
    input_log: Mutex<std::fs::File>,
    live_tx: broadcast::Sender<LiveEvent>,
    waiting: AtomicBool,
    promoted: AtomicBool,
    external_size: Mutex<(u16, u16)>,
}

impl LiveSession {
    fn snapshot(&self) -> Session {
        let mut session = self.meta.read().expect("session meta lock poisoned").clone();
        session.last_modified = Some(store::last_modified(&self.paths, session.started_at));
        session.waiting = self.waiting.load(Ordering::Relaxed);
        session
    }

    fn persist(&self) -> Result<()> {
        let session = self.meta.read().expect("session meta lock poisoned").clone();
        store::write_metadata(&self.paths, &session)
    }

    /// Starting -> running transition (spec §4.1): first output byte, first accepted
    /// input, or a 500ms deadline, whichever comes first. Idempotent.
    fn promote_to_running(&self) {
        if self.promoted.swap(true, Ordering::AcqRel) {
            return;
        }
        {
            let mut meta = self.meta.write().expect("session meta lock poisoned");
            if meta.status == SessionStatus::Starting {
                meta.status = SessionStatus::Running;
            }
        }
        let _ = self.persist();
    }

    fn record_output(&self, data: &[u8]) {
        self.promote_to_running();
        let text = String::from_utf8_lossy(data).into_owned();
        let mut writer = self.writer.lock().expect("asciicast writer lock poisoned");
        match writer.output(&text) {
            Ok(()) => self.waiting.store(false, Ordering::Relaxed),
            Err(error) => {
                tracing::warn!(session_id = %self.id, %error, "failed to append output event");
                self.waiting.store(true, Ordering::Relaxed);
            }
        }
        drop(writer);
        let _ = self.live_tx.send(LiveEvent::Output(Bytes::copy_from_slice(data)));
    }

    fn record_exit(&self, exit_code: i32) {
        {
            let mut writer = self.writer.lock().expect("asciicast writer lock poisoned");
            if let Err(error) = writer.exit(exit_code) {
                tracing::warn!(session_id = %self.id, %error, "failed to append exit event");
            }
        }
        {
            let mut meta = self.meta.write().expect("session meta lock poisoned");
            meta.status = SessionStatus::Exited;
            meta.exit_code = Some(exit_code);
        }
        let _ = self.persist();
        let _ = self.live_tx.send(LiveEvent::Exit(exit_code));
        // The control socket has nothing left to control; remove the stale file so it
        // never outlives the session it named (spec SPEC_FULL.md §3).
        let _ = std::fs::remove_file(&self.paths.control);
    }

    fn is_running(&self) -> bool {
        matches!(self.meta.read().expect("session meta lock poisoned").status, SessionStatus::Running | SessionStatus::Starting)
    }

    fn apply_resize(&self, cols: u16, rows: u16, record_as_external: bool) -> Result<()> {
        validate_size(cols, rows)?;
        if !self.is_running() {
            return Err(Error::SessionNotRunning(self.id));
        }
        self.resize_tx
            .send((cols, rows))
            .map_err(|_| Error::SessionNotRunning(self.id))?;
        {
            let mut writer = self.writer.lock().expect("asciicast writer lock poisoned");
            writer.resize(cols, rows)?;
        }
        {
            let mut meta = self.meta.write().expect("session meta lock poisoned");
            meta.cols = cols;
            meta.rows = rows;
        }
        self.persist()?;
        if record_as_external {
            *self.external_size.lock().expect("external size lock poisoned") = (cols, rows);
        }
        let _ = self.live_tx.send(LiveEvent::Resize { cols, rows });
        Ok(())
    }

    fn send_input(&self, input: Input) -> Result<()> {
        if !self.is_running() {
            return Err(Error::SessionNotRunning(self.id));
        }
        let (bytes, logged) = match input {
            Input::Text(text) => (text.clone().into_bytes(), serde_json::json!({ "text": text })),
            Input::Key(key) => (crate::keys::key_to_bytes(&key)?, serde_json::json!({ "key": key })),
        };
        {
            let mut guard = self.bridge.writer.lock().map_err(|_| Error::Io(std::io::Error::other("pty writer lock poisoned")))?;
            std::io::Write::write_all(&mut *guard, &bytes)?;
            std::io::Write::flush(&mut *guard)?;
        }
        self.promote_to_running();
        {
            let mut writer = self.writer.lock().expect("asciicast writer lock poisoned");
            writer.input(&String::from_utf8_lossy(&bytes))?;
        }
        {
            let mut log = self.input_log.lock().expect("stdin audit log lock poisoned");
            let mut line = serde_json::to_vec(&logged).map_err(|e| Error::Io(std::io::Error::other(e)))?;
            line.push(b'\n');
            std::io::Write::write_all(&mut *log, &line)?;
        }
        Ok(())
    }

    fn kill(&self, signal: Signal) -> Result<()> {
        if !self.is_running() {
            return Ok(()); // idempotent: killing an already-exited session is a no-op success
        }
        self.bridge.signal(signal)
    }
}

impl ControlHandler for LiveSession {
    fn input(&self, input: Input) -> Result<()> {
        self.send_input(input)
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.apply_resize(cols, rows, true)
    }

    fn kill(&self, signal: Signal) -> Result<()> {
        LiveSession::kill(self, signal)
    }
}

/// The C2 PTY manager: `createSession`/`listSessions`/`getSession`/`sendInput`/
/// `resizeSession`/`resetSessionSize`/`killSession`/`cleanupSession`/
/// `cleanupExitedSessions`/`getSessionPaths` (spec §4.1).
pub struct SessionManager {
    config: Arc<Config>,
    registry: DashMap<SessionId, Arc<LiveSession>>,
}

impl SessionManager {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        store::ensure_root(&config.root)?;
        let manager = Self { config, registry: DashMap::new() };
        manager.reconcile_stale_sessions()?;
        Ok(manager)
    }

    /// On startup, any `session.json` still claiming `running`/`starting` belongs to a
    /// process this manager never spawned (a prior run of the server); since we hold no
    /// PTY handle for it, reconcile it to `exited` if its pid is no longer alive.
    fn reconcile_stale_sessions(&self) -> Result<()> {
        for id in store::list_session_ids(&self.config.root)? {
            let paths = SessionPaths::new(&self.config.root, id);
            let Ok(mut session) = store::read_metadata(&paths) else { continue };
            if session.status == SessionStatus::Exited {
                continue;
            }
            if !pid_is_alive(session.pid) {
                session.status = SessionStatus::Exited;
                session.exit_code.get_or_insert(-1);
                let _ = store::write_metadata(&paths, &session);
            }
        }
        Ok(())
    }

    pub fn create_session(&self, argv: Vec<String>, opts: CreateOptions) -> Result<Session> {
        if argv.is_empty() {
            return Err(Error::InvalidArgument("command must not be empty".into()));
        }
        validate_size(opts.cols, opts.rows)?;
        let cwd = if opts.cwd.is_dir() {
            opts.cwd.clone()
        } else {
            std::env::current_dir().map_err(Error::Io)?
        };

        let id = opts.id.unwrap_or_else(SessionId::new);
        let paths = SessionPaths::new(&self.config.root, id);
        let name = opts.name.clone().unwrap_or_else(|| derive_name(&argv, &cwd));
        let started_at = chrono::Utc::now();

        store::ensure_session_dir(&paths)?;

        let header = asciicast::Header::new(opts.cols, opts.rows, Some(argv.join(" ")));
        let writer = asciicast::Writer::create(&paths.stdout, &header)?;
        let input_log = std::fs::OpenOptions::new().create(true).append(true).open(&paths.stdin)?;

        let spawn_opts = PtySpawnOptions {
            argv: argv.clone(),
            cwd: Some(cwd.clone()),
            cols: opts.cols,
            rows: opts.rows,
            env: opts.env.clone(),
            term: opts.term.clone(),
        };
        let (bridge, mut output_rx, resize_tx, mut exit_rx) = pty::spawn_pty(spawn_opts)?;
        let pid = bridge.pid();

        let session = Session {
            id,
            name,
            cmdline: argv,
            cwd,
            pid,
            status: SessionStatus::Starting,
            exit_code: None,
            started_at,
            last_modified: None,
            cols: opts.cols,
            rows: opts.rows,
            waiting: false,
        };
        store::write_metadata(&paths, &session)?;

        let (live_tx, _) = broadcast::channel(LIVE_BROADCAST_CAPACITY);
        let live = Arc::new(LiveSession {
            id,
            paths: paths.clone(),
            bridge,
            resize_tx,
            meta: RwLock::new(session.clone()),
            writer: Mutex::new(writer),
            input_log: Mutex::new(input_log),
            live_tx,
            waiting: AtomicBool::new(false),
            promoted: AtomicBool::new(false),
            external_size: Mutex::new((opts.cols, opts.rows)),
        });
        self.registry.insert(id, live.clone());

        // Output task: the hot path from spec §4.1 — each chunk is logged and fanned
        // out in-memory, never re-read from disk.
        tokio::spawn({
            let live = live.clone();
            async move {
                while let Some(chunk) = output_rx.recv().await {
                    live.record_output(&chunk);
                }
            }
        });

        // Wait task: records exactly one "x" event and flips status on child exit.
        tokio::spawn({
            let live = live.clone();
            async move {
                if let Some(exit) = exit_rx.recv().await {
                    live.record_exit(exit.exit_code);
                }
            }
        });

        // Starting -> running deadline: promote after 500ms even with no I/O yet.
        tokio::spawn({
            let live = live.clone();
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(STARTING_DEADLINE_MILLIS)).await;
                live.promote_to_running();
            }
        });

        // Control socket (spec §4.1, §6.2): single listener per session, owned by this process.
        match UnixListener::bind(&paths.control) {
            Ok(listener) => {
                tokio::spawn(crate::session::control::serve(listener, live.clone() as Arc<dyn ControlHandler>));
            }
            Err(error) => {
                tracing::warn!(session_id = %id, %error, "failed to bind control socket");
            }
        }

        Ok(session)
    }

    pub fn list_sessions(&self) -> Result<Vec<Session>> {
        let ids = store::list_session_ids(&self.config.root)?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(session) = self.get_session(id)? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    pub fn get_session(&self, id: SessionId) -> Result<Option<Session>> {
        if let Some(live) = self.registry.get(&id) {
            return Ok(Some(live.snapshot()));
        }
        let paths = SessionPaths::new(&self.config.root, id);
        if !paths.metadata.exists() {
            return Ok(None);
        }
        let mut session = store::read_metadata(&paths)?;
        session.last_modified = Some(store::last_modified(&paths, session.started_at));
        Ok(Some(session))
    }

    fn live(&self, id: SessionId) -> Result<Arc<LiveSession>> {
        self.registry.get(&id).map(|entry| entry.clone()).ok_or(Error::SessionNotFound(id))
    }

    pub fn send_input(&self, id: SessionId, input: Input) -> Result<()> {
        self.live(id)?.send_input(input)
    }

    pub fn resize_session(&self, id: SessionId, cols: u16, rows: u16) -> Result<()> {
        self.live(id)?.apply_resize(cols, rows, true)
    }

    pub fn reset_session_size(&self, id: SessionId) -> Result<()> {
        let live = self.live(id)?;
        let (cols, rows) = *live.external_size.lock().expect("external size lock poisoned");
        live.apply_resize(cols, rows, false)
    }

    pub fn kill_session(&self, id: SessionId, signal: Signal) -> Result<()> {
        self.live(id)?.kill(signal)
    }

    pub fn cleanup_session(&self, id: SessionId) -> Result<()> {
        let session = self.get_session(id)?.ok_or(Error::SessionNotFound(id))?;
        if session.status != SessionStatus::Exited {
            return Err(Error::SessionBusy(id));
        }
        self.registry.remove(&id);
        let paths = SessionPaths::new(&self.config.root, id);
        store::remove_session_dir(&paths)
    }

    pub fn cleanup_exited_sessions(&self) -> Result<Vec<SessionId>> {
        let mut removed = Vec::new();
        for session in self.list_sessions()? {
            if session.status == SessionStatus::Exited && self.cleanup_session(session.id).is_ok() {
                removed.push(session.id);
            }
        }
        Ok(removed)
    }

    pub fn session_paths(&self, id: SessionId) -> Result<Option<SessionPaths>> {
        let paths = SessionPaths::new(&self.config.root, id);
        Ok(if paths.dir.exists() { Some(paths) } else { None })
    }

    /// Subscribe to the in-memory live event stream for a session (used by the terminal
    /// state engine, C4, per spec §4.1's "forwarded in-memory to subscribed terminal
    /// state engines" hot path).
    pub fn subscribe_live(&self, id: SessionId) -> Result<broadcast::Receiver<LiveEvent>> {
        Ok(self.live(id)?.live_tx.subscribe())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(unix)]
fn pid_is_alive(pid: Option<u32>) -> bool {
    match pid {
        Some(pid) => unsafe { libc::kill(pid as libc::pid_t, 0) == 0 },
        None => false,
    }
}

#[cfg(not(unix))]
fn pid_is_alive(pid: Option<u32>) -> bool {
    pid.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (SessionManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.root = dir.path().to_path_buf();
        (SessionManager::new(Arc::new(config)).unwrap(), dir)
    }

    #[test]
    fn empty_argv_is_invalid_argument() {
        let (manager, _dir) = manager();
        let err = manager.create_session(vec![], CreateOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn out_of_range_size_is_invalid_argument() {
        let (manager, _dir) = manager();
        let opts = CreateOptions { cols: 0, ..CreateOptions::default() };
        let err = manager.create_session(vec!["/bin/sh".into()], opts).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn echo_session_exits_with_expected_output() {
        let (manager, _dir) = manager();
        let opts = CreateOptions { cwd: std::env::temp_dir(), ..CreateOptions::default() };
        let session = manager
            .create_session(vec!["/bin/sh".into(), "-c".into(), "printf hello".into()], opts)
            .unwrap();

        // Wait for the child to exit and the wait task to record it.
        for _ in 0..100 {
            if manager.get_session(session.id).unwrap().unwrap().status == SessionStatus::Exited {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let final_session = manager.get_session(session.id).unwrap().unwrap();
        assert_eq!(final_session.status, SessionStatus::Exited);
        assert_eq!(final_session.exit_code, Some(0));

        let paths = manager.session_paths(session.id).unwrap().unwrap();
        let mut reader = asciicast::Reader::open(&paths.stdout).unwrap();
        reader.read_header().unwrap();
        let events = reader.read_new_events().unwrap();
        let output: String = events
            .iter()
            .filter_map(|event| match &event.kind {
                crate::asciicast::EventKind::Output(text) => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert!(output.contains("hello"));
        assert!(matches!(events.last().unwrap().kind, crate::asciicast::EventKind::Exit(0)));
    }

    #[test]
    fn cleanup_running_session_is_busy() {
        let (manager, _dir) = manager();
        let opts = CreateOptions { cwd: std::env::temp_dir(), ..CreateOptions::default() };
        let session = manager.create_session(vec!["/bin/sh".into()], opts).unwrap();
        let err = manager.cleanup_session(session.id).unwrap_err();
        assert!(matches!(err, Error::SessionBusy(_)));
        let _ = manager.kill_session(session.id, Signal::Kill);
    }
}
