//! On-disk session directory layout: atomic `session.json` persistence and directory
//! scanning (spec §3.1, §6.1).

use std::path::Path;

use super::{Session, SessionId, SessionPaths};
use crate::error::Result;

pub fn ensure_root(root: &Path) -> Result<()> {
    std::fs::create_dir_all(root)?;
    Ok(())
}

/// Creates `<root>/<id>/` ahead of the asciicast and control-pipe files that live inside
/// it. Must run before anything opens `paths.stdout`/`paths.stdin` — those opens don't
/// create parent directories themselves.
pub fn ensure_session_dir(paths: &SessionPaths) -> Result<()> {
    std::fs::create_dir_all(&paths.dir)?;
    Ok(())
}

/// Write `session.json` atomically: write to a sibling temp file, then rename over the
/// target. A reader never observes a partial write.
pub fn write_metadata(paths: &SessionPaths, session: &Session) -> Result<()> {
    std::fs::create_dir_all(&paths.dir)?;
    let tmp = paths.dir.join("session.json.tmp");
    let data = serde_json::to_vec_pretty(session).map_err(|e| crate::Error::Io(std::io::Error::other(e)))?;
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, &paths.metadata)?;
    Ok(())
}

pub fn read_metadata(paths: &SessionPaths) -> Result<Session> {
    let data = std::fs::read(&paths.metadata)?;
    serde_json::from_slice(&data).map_err(|e| crate::Error::Io(std::io::Error::other(e)))
}

/// Last-output timestamp: the mtime of the `stdout` log (spec: `lastModified` = "of last
/// output"), falling back to `started_at` when the log has no data yet.
pub fn last_modified(paths: &SessionPaths, started_at: chrono::DateTime<chrono::Utc>) -> chrono::DateTime<chrono::Utc> {
    std::fs::metadata(&paths.stdout)
        .and_then(|m| m.modified())
        .ok()
        .map(chrono::DateTime::<chrono::Utc>::from)
        .unwrap_or(started_at)
}

/// Enumerate all session ids present under `root` by scanning directory names (spec:
/// "enumerate by scanning the store; never blocks on live sessions").
pub fn list_session_ids(root: &Path) -> Result<Vec<SessionId>> {
    let mut ids = Vec::new();
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if let Ok(id) = name.parse::<SessionId>() {
                ids.push(id);
            }
        }
    }
    Ok(ids)
}

pub fn remove_session_dir(paths: &SessionPaths) -> Result<()> {
    match std::fs::remove_dir_all(&paths.dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
