//! C8: remote registry — the remote list and the session→remote index (spec §3.2:
//! "Remote registry owns the remote list and the session→remote index; only the HQ
//! router mutates it").

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;

use super::{Remote, RemoteId};
use crate::error::{Error, Result};
use crate::session::SessionId;

/// Consecutive health-check failures before a remote and its sessions are evicted
/// (spec §4.7 "Three consecutive failures evict the remote").
pub const EVICTION_THRESHOLD: u32 = 3;

/// Owns the set of registered remotes and the reverse `sessionId -> remoteId` index.
/// Only the HQ router mutates this; other readers (e.g. the sessions list route) only
/// call the `get_*` accessors.
pub struct RemoteRegistry {
    remotes: DashMap<RemoteId, Remote>,
    by_name: DashMap<String, RemoteId>,
    session_index: DashMap<SessionId, RemoteId>,
    failure_counts: DashMap<RemoteId, AtomicU32>,
}

impl Default for RemoteRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteRegistry {
    pub fn new() -> Self {
        Self {
            remotes: DashMap::new(),
            by_name: DashMap::new(),
            session_index: DashMap::new(),
            failure_counts: DashMap::new(),
        }
    }

    /// `register(remoteInfo) -> void` (spec §4.7). `(id, name)` must be unique; a
    /// duplicate `name` is `InvalidArgument` (mapped to a conflict status by the server).
    pub fn register(&self, name: String, url: url::Url, token: String) -> Result<Remote> {
        if self.by_name.contains_key(&name) {
            return Err(Error::InvalidArgument(format!("remote name already registered: {name}")));
        }
        let remote = Remote {
            id: RemoteId::new(),
            name: name.clone(),
            url,
            token,
            session_ids: Vec::new(),
            last_seen: chrono::Utc::now(),
        };
        self.by_name.insert(name, remote.id);
        self.failure_counts.insert(remote.id, AtomicU32::new(0));
        self.remotes.insert(remote.id, remote.clone());
        Ok(remote)
    }

    /// `unregister(id) -> void`.
    pub fn unregister(&self, id: RemoteId) {
        if let Some((_, remote)) = self.remotes.remove(&id) {
            self.by_name.remove(&remote.name);
            for session_id in remote.session_ids {
                self.session_index.remove(&session_id);
            }
        }
        self.failure_counts.remove(&id);
    }

    pub fn get_remotes(&self) -> Vec<Remote> {
        self.remotes.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn get_remote(&self, id: RemoteId) -> Option<Remote> {
        self.remotes.get(&id).map(|entry| entry.value().clone())
    }

    pub fn get_remote_by_session_id(&self, session_id: SessionId) -> Option<Remote> {
        let remote_id = *self.session_index.get(&session_id)?;
        self.get_remote(remote_id)
    }

    /// `updateRemoteSessions(remoteId, sessionIds)` — replaces the remote's session set.
    pub fn update_remote_sessions(&self, remote_id: RemoteId, session_ids: Vec<SessionId>) {
        if let Some(mut remote) = self.remotes.get_mut(&remote_id) {
            for old in &remote.session_ids {
                self.session_index.remove(old);
            }
            for new_id in &session_ids {
                self.session_index.insert(*new_id, remote_id);
            }
            remote.session_ids = session_ids;
            remote.last_seen = chrono::Utc::now();
        }
    }

    pub fn add_session_to_remote(&self, remote_id: RemoteId, session_id: SessionId) {
        if let Some(mut remote) = self.remotes.get_mut(&remote_id) {
            if !remote.session_ids.contains(&session_id) {
                remote.session_ids.push(session_id);
            }
            self.session_index.insert(session_id, remote_id);
        }
    }

    pub fn remove_session_from_remote(&self, session_id: SessionId) {
        if let Some((_, remote_id)) = self.session_index.remove(&session_id) {
            if let Some(mut remote) = self.remotes.get_mut(&remote_id) {
                remote.session_ids.retain(|id| *id != session_id);
            }
        }
    }

    /// Record a successful health check: resets the failure streak and bumps `lastSeen`.
    pub fn record_health_success(&self, remote_id: RemoteId) {
        if let Some(counter) = self.failure_counts.get(&remote_id) {
            counter.store(0, Ordering::SeqCst);
        }
        if let Some(mut remote) = self.remotes.get_mut(&remote_id) {
            remote.last_seen = chrono::Utc::now();
        }
    }

    /// Record a failed health check. Returns true if this failure crossed the eviction
    /// threshold, in which case the caller (the HQ's health loop) should also call
    /// `unregister`.
    pub fn record_health_failure(&self, remote_id: RemoteId) -> bool {
        let Some(counter) = self.failure_counts.get(&remote_id) else { return false };
        counter.fetch_add(1, Ordering::SeqCst) + 1 >= EVICTION_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> url::Url {
        url::Url::parse(s).unwrap()
    }

    #[test]
    fn register_rejects_duplicate_name() {
        let registry = RemoteRegistry::new();
        registry.register("a".into(), url("http://localhost:1"), "t".into()).unwrap();
        let err = registry.register("a".into(), url("http://localhost:2"), "t".into()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn session_index_tracks_single_owner() {
        let registry = RemoteRegistry::new();
        let remote = registry.register("a".into(), url("http://localhost:1"), "t".into()).unwrap();
        let session_id = SessionId::new();
        registry.add_session_to_remote(remote.id, session_id);
        assert_eq!(registry.get_remote_by_session_id(session_id).unwrap().id, remote.id);

        registry.remove_session_from_remote(session_id);
        assert!(registry.get_remote_by_session_id(session_id).is_none());
    }

    #[test]
    fn three_consecutive_failures_cross_eviction_threshold() {
        let registry = RemoteRegistry::new();
        let remote = registry.register("a".into(), url("http://localhost:1"), "t".into()).unwrap();
        assert!(!registry.record_health_failure(remote.id));
        assert!(!registry.record_health_failure(remote.id));
        assert!(registry.record_health_failure(remote.id));
    }

    #[test]
    fn unregister_clears_session_index() {
        let registry = RemoteRegistry::new();
        let remote = registry.register("a".into(), url("http://localhost:1"), "t".into()).unwrap();
        let session_id = SessionId::new();
        registry.add_session_to_remote(remote.id, session_id);
        registry.unregister(remote.id);
        assert!(registry.get_remote(remote.id).is_none());
        assert!(registry.get_remote_by_session_id(session_id).is_none());
    }
}
