//! C8/C9: remote registry and HQ router (spec §3.1 Remote, §4.7).

pub mod client;
pub mod registry;
pub mod router;
pub mod ws_proxy;

pub use client::{HttpRemoteClient, RemoteClient};
pub use registry::RemoteRegistry;
pub use router::HqRouter;
pub use ws_proxy::RemoteBufferProxy;

use std::time::Duration;

use crate::session::SessionId;

/// Unique remote identifier (UUID v4, assigned server-side at registration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct RemoteId(pub uuid::Uuid);

impl RemoteId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RemoteId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RemoteId {
    type Err = uuid::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

/// A peer node registered with a HQ (spec §3.1 "Remote").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remote {
    pub id: RemoteId,
    pub name: String,
    pub url: url::Url,
    /// Bearer token the HQ presents to this remote. Never serialized back out to clients.
    #[serde(skip_serializing)]
    pub token: String,
    pub session_ids: Vec<SessionId>,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

/// Per-call timeout budget (spec §5 "Remote HTTP calls carry per-call timeouts").
#[derive(Debug, Clone, Copy)]
pub struct RemoteTimeouts {
    pub list: Duration,
    pub create: Duration,
    pub input_resize: Duration,
    pub cleanup: Duration,
    pub buffer: Duration,
}

impl Default for RemoteTimeouts {
    fn default() -> Self {
        Self {
            list: Duration::from_secs(5),
            create: Duration::from_secs(10),
            input_resize: Duration::from_secs(5),
            cleanup: Duration::from_secs(10),
            buffer: Duration::from_secs(5),
        }
    }
}

/// Request body for `POST /api/remotes/register` (spec §4.7 Open Question, resolved).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegisterRemote {
    pub name: String,
    pub url: url::Url,
    pub token: String,
}
