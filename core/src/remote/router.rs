//! C9: the HQ router. Decides, per session-scoped request, whether to serve it locally
//! or forward it to the remote that owns the session, and runs the periodic health
//! check that evicts unreachable remotes (spec §4.7).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

use super::client::{CreateSessionBody, HttpRemoteClient, RemoteClient};
use super::registry::RemoteRegistry;
use super::{Remote, RemoteId, RemoteTimeouts};
use crate::error::{Error, Result};
use crate::session::{Session, SessionId};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a session-scoped request should be served (spec §4.7 routing rules 1-2).
pub enum Route {
    Local,
    Remote(Arc<dyn RemoteClient>),
}

/// A session as returned by `GET /api/sessions` at the HQ, tagged with its origin
/// (spec §4.7 routing rule 3: "tag each entry with `source ∈ {local,remote}`").
/// One remote's result from a fanned-out `cleanup_exited_on_remotes` call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCleanupOutcome {
    pub remote_id: RemoteId,
    pub remote_name: String,
    pub cleaned_ids: Vec<SessionId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionWithSource {
    #[serde(flatten)]
    pub session: Session,
    pub source: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_name: Option<String>,
}

/// C9: forwards session CRUD/stream/buffer requests to the remote that owns the
/// session, fans `list_sessions` out to every remote in parallel, and runs the
/// periodic health check that evicts a remote after three consecutive failures.
pub struct HqRouter {
    registry: Arc<RemoteRegistry>,
    timeouts: RemoteTimeouts,
    clients: DashMap<RemoteId, Arc<dyn RemoteClient>>,
}

impl HqRouter {
    pub fn new(registry: Arc<RemoteRegistry>) -> Self {
        Self { registry, timeouts: RemoteTimeouts::default(), clients: DashMap::new() }
    }

    pub fn registry(&self) -> &Arc<RemoteRegistry> {
        &self.registry
    }

    fn client_for(&self, remote: &Remote) -> Arc<dyn RemoteClient> {
        self.clients
            .entry(remote.id)
            .or_insert_with(|| Arc::new(HttpRemoteClient::new(remote, self.timeouts)) as Arc<dyn RemoteClient>)
            .clone()
    }

    /// `POST /api/remotes/register` (SPEC_FULL.md §4.7).
    pub fn register(&self, name: String, url: url::Url, token: String) -> Result<Remote> {
        let remote = self.registry.register(name, url, token)?;
        self.client_for(&remote);
        Ok(remote)
    }

    pub fn unregister(&self, id: RemoteId) {
        self.registry.unregister(id);
        self.clients.remove(&id);
    }

    /// Routing rules 1-2: a session id present in the registry's index belongs to a
    /// remote; otherwise the request is local.
    pub fn route(&self, session_id: SessionId) -> Route {
        match self.registry.get_remote_by_session_id(session_id) {
            Some(remote) => Route::Remote(self.client_for(&remote)),
            None => Route::Local,
        }
    }

    /// Routing rule 4: `POST /api/sessions` with an explicit `remoteId` strips it and
    /// forwards to that remote, returning the new session's id.
    pub async fn create_on_remote(&self, remote_id: RemoteId, body: &CreateSessionBody) -> Result<SessionId> {
        let remote = self.registry.get_remote(remote_id).ok_or(Error::RemoteNotFound(remote_id.to_string()))?;
        let client = self.client_for(&remote);
        let session_id = client.create_session(body).await?;
        self.registry.add_session_to_remote(remote_id, session_id);
        Ok(session_id)
    }

    /// Routing rule 3: fan out `list_sessions` to every remote in parallel (5s timeout
    /// each, baked into `RemoteTimeouts::list`); per-remote failures are dropped rather
    /// than failing the aggregate.
    pub async fn list_remote_sessions(&self) -> Vec<SessionWithSource> {
        let remotes = self.registry.get_remotes();
        let calls = remotes.into_iter().map(|remote| {
            let client = self.client_for(&remote);
            async move {
                match client.list_sessions().await {
                    Ok(sessions) => sessions
                        .into_iter()
                        .map(|session| SessionWithSource {
                            session,
                            source: "remote",
                            remote_id: Some(remote.id),
                            remote_name: Some(remote.name.clone()),
                        })
                        .collect(),
                    Err(error) => {
                        tracing::warn!(remote = %remote.name, %error, "remote list_sessions failed");
                        Vec::new()
                    }
                }
            }
        });
        futures_util::future::join_all(calls).await.into_iter().flatten().collect()
    }

    /// Fan out `POST /api/cleanup-exited` to every remote (spec §6.4), dropping each
    /// remote's cleaned session ids from the registry's session index as they come back.
    /// Per-remote failures are logged and excluded from the result, same as `list_remote_sessions`.
    pub async fn cleanup_exited_on_remotes(&self) -> Vec<RemoteCleanupOutcome> {
        let remotes = self.registry.get_remotes();
        let calls = remotes.into_iter().map(|remote| {
            let client = self.client_for(&remote);
            async move {
                match client.cleanup_exited().await {
                    Ok(cleaned_ids) => {
                        for id in &cleaned_ids {
                            self.registry.remove_session_from_remote(*id);
                        }
                        Some(RemoteCleanupOutcome { remote_id: remote.id, remote_name: remote.name.clone(), cleaned_ids })
                    }
                    Err(error) => {
                        tracing::warn!(remote = %remote.name, %error, "remote cleanup_exited failed");
                        None
                    }
                }
            }
        });
        futures_util::future::join_all(calls).await.into_iter().flatten().collect()
    }

    /// Spawns the periodic health-check loop (spec §4.7: every 10s, 5s timeout per
    /// remote, evict after three consecutive failures). Runs until the process exits;
    /// intended to be spawned once at startup when `config.is_hq` is set.
    pub fn spawn_health_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_CHECK_INTERVAL);
            loop {
                interval.tick().await;
                for remote in self.registry.get_remotes() {
                    let client = self.client_for(&remote);
                    let outcome = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, client.health()).await;
                    match outcome {
                        Ok(Ok(())) => self.registry.record_health_success(remote.id),
                        _ => {
                            if self.registry.record_health_failure(remote.id) {
                                tracing::warn!(remote = %remote.name, "evicting remote after repeated health-check failures");
                                self.unregister(remote.id);
                            }
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_session_routes_local() {
        let router = HqRouter::new(Arc::new(RemoteRegistry::new()));
        assert!(matches!(router.route(SessionId::new()), Route::Local));
    }

    #[test]
    fn registered_session_routes_to_its_remote() {
        let router = HqRouter::new(Arc::new(RemoteRegistry::new()));
        let remote = router.register("a".into(), url::Url::parse("http://localhost:1").unwrap(), "t".into()).unwrap();
        let session_id = SessionId::new();
        router.registry().add_session_to_remote(remote.id, session_id);
        assert!(matches!(router.route(session_id), Route::Remote(_)));
    }
}
