//! `AppState`: the collaborators every route handler needs, constructed once at startup
//! and cloned (cheaply, via `Arc`) into each request (Design Notes §9: "explicit
//! collaborators passed to routes at construction" rather than global singletons).

use std::sync::Arc;
use std::time::Duration;

use vt_core::activity::ActivityMonitor;
use vt_core::buffer::BufferAggregator;
use vt_core::config::Config;
use vt_core::remote::{HqRouter, RemoteBufferProxy, RemoteRegistry};
use vt_core::session::SessionManager;
use vt_core::stream::StreamWatcher;
use vt_core::terminal::TerminalRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
    pub terminals: Arc<TerminalRegistry>,
    pub activity: Arc<ActivityMonitor>,
    pub stream_watcher: Arc<StreamWatcher>,
    pub buffers: Arc<BufferAggregator>,
    /// Always constructed so `GET /api/remotes` and friends work uniformly; only
    /// consulted for routing decisions when `config.is_hq` is set (spec §4.7).
    pub hq_router: Arc<HqRouter>,
    /// HQ-side shared upstream WS per remote for `/api/sessions/ws` subscriptions that
    /// land on a remote-owned session (spec §4.5 "In HQ mode").
    pub buffer_proxy: Arc<RemoteBufferProxy>,
}

impl AppState {
    pub fn new(config: Config) -> vt_core::Result<Self> {
        let config = Arc::new(config);
        let sessions = Arc::new(SessionManager::new(config.clone())?);
        let terminals = Arc::new(TerminalRegistry::new());
        let buffers = Arc::new(BufferAggregator::new(
            sessions.clone(),
            terminals.clone(),
            Duration::from_millis(config.coalesce_millis),
        ));
        let hq_router = Arc::new(HqRouter::new(Arc::new(RemoteRegistry::new())));
        if config.is_hq {
            hq_router.clone().spawn_health_loop();
        }
        Ok(Self {
            config,
            sessions,
            terminals,
            activity: Arc::new(ActivityMonitor::new()),
            stream_watcher: Arc::new(StreamWatcher::new()),
            buffers,
            hq_router,
            buffer_proxy: Arc::new(RemoteBufferProxy::new()),
        })
    }
}
