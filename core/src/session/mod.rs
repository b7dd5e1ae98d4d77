//! Session entity, on-disk layout, and lifecycle manager (C1/C2, spec §3.1, §4.1).

pub mod control;
pub mod manager;
pub mod store;

pub use manager::{CreateOptions, Input, SessionManager};

use std::path::PathBuf;

/// Unique session identifier (UUID v4, spec §3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Exited,
}

/// A running or terminated PTY-attached child process (spec §3.1).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub cmdline: Vec<String>,
    pub cwd: PathBuf,
    pub pid: Option<u32>,
    pub status: SessionStatus,
    pub exit_code: Option<i32>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
    pub cols: u16,
    pub rows: u16,
    pub waiting: bool,
}

/// On-disk artifacts for a session, rooted at `<root>/<id>/` (spec §6.1).
#[derive(Debug, Clone)]
pub struct SessionPaths {
    pub dir: PathBuf,
    pub metadata: PathBuf,
    pub stdout: PathBuf,
    pub stdin: PathBuf,
    pub control: PathBuf,
    pub notification_stream: PathBuf,
}

impl SessionPaths {
    pub fn new(root: &std::path::Path, id: SessionId) -> Self {
        let dir = root.join(id.to_string());
        Self {
            metadata: dir.join("session.json"),
            stdout: dir.join("stdout"),
            stdin: dir.join("stdin"),
            control: dir.join("control"),
            notification_stream: dir.join("notification-stream"),
            dir,
        }
    }
}

/// Derive a human-friendly name from argv + cwd when the caller doesn't supply one
/// (spec SPEC_FULL.md §3: `basename(argv[0]) · basename(cwd)`).
pub fn derive_name(argv: &[String], cwd: &std::path::Path) -> String {
    let bin = argv
        .first()
        .and_then(|a| std::path::Path::new(a).file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("session");
    let dir = cwd.file_name().and_then(|n| n.to_str()).unwrap_or("/");
    format!("{bin} · {dir}")
}
