//! Runtime configuration (spec §6.6). Unlike the teacher's global `OnceLock` singleton,
//! `Config` is plain data: the server binary loads it once at startup (file, then env
//! overrides, then CLI overrides) and passes it down via `Arc` to routes — the
//! "explicit collaborators over global singletons" re-architecture the spec's Design
//! Notes call for.

use std::path::PathBuf;
use std::sync::Once;

/// Install rustls's default crypto provider once (required before any TLS use, e.g.
/// outbound HQ->remote reqwest/WS clients). Idempotent; safe to call from multiple entry points.
pub fn ensure_rustls_provider() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session directory root (spec §6.1). Default: `~/.vibetunnel`.
    pub root: PathBuf,
    pub bind_addr: String,
    pub port: u16,
    /// Enables the remote registry + HQ router (spec §4.7).
    pub is_hq: bool,
    /// Bearer token this node presents to its HQ when it is a remote.
    pub remote_token: Option<String>,
    pub scrollback_rows: usize,
    pub coalesce_millis: u64,
    pub heartbeat_seconds: u64,
    pub health_interval_seconds: u64,
    /// External terminal-spawn socket (spec §6.3). Consulted only when a create-session
    /// request carries `spawnTerminal: true`.
    pub external_terminal_socket: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: default_root(),
            bind_addr: "127.0.0.1".to_string(),
            port: 4020,
            is_hq: false,
            remote_token: None,
            scrollback_rows: 2000,
            coalesce_millis: 16,
            heartbeat_seconds: 30,
            health_interval_seconds: 10,
            external_terminal_socket: PathBuf::from("/tmp/vibetunnel-terminal.sock"),
        }
    }
}

fn default_root() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".vibetunnel")
}

impl Config {
    /// Load from a JSON settings file (missing/invalid file -> defaults), then apply
    /// `VT_*` environment variable overrides. CLI overrides (highest precedence) are
    /// applied by the caller (`server::main`) on top of the returned value.
    pub fn load(path: &std::path::Path) -> Self {
        let mut cfg = std::fs::read_to_string(path)
            .ok()
            .and_then(|data| serde_json::from_str::<Config>(&data).ok())
            .unwrap_or_default();
        cfg.apply_env_overrides();
        cfg
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VT_ROOT") {
            self.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VT_BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Ok(v) = std::env::var("VT_PORT") {
            if let Ok(port) = v.parse() {
                self.port = port;
            }
        }
        if let Ok(v) = std::env::var("VT_IS_HQ") {
            self.is_hq = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("VT_REMOTE_TOKEN") {
            self.remote_token = Some(v);
        }
        if let Ok(v) = std::env::var("VT_SCROLLBACK_ROWS") {
            if let Ok(n) = v.parse() {
                self.scrollback_rows = n;
            }
        }
        if let Ok(v) = std::env::var("VT_COALESCE_MILLIS") {
            if let Ok(n) = v.parse() {
                self.coalesce_millis = n;
            }
        }
        if let Ok(v) = std::env::var("VT_HEARTBEAT_SECONDS") {
            if let Ok(n) = v.parse() {
                self.heartbeat_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("VT_HEALTH_INTERVAL_SECONDS") {
            if let Ok(n) = v.parse() {
                self.health_interval_seconds = n;
            }
        }
        if let Ok(v) = std::env::var("VT_EXTERNAL_TERMINAL_SOCKET") {
            self.external_terminal_socket = PathBuf::from(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/settings.json"));
        assert_eq!(cfg.port, 4020);
        assert_eq!(cfg.scrollback_rows, 2000);
    }
}
