//! VibeTunnel server: the Axum HTTP/SSE/WebSocket surface described in spec §4.8,
//! wired over `vt-core`'s session manager, buffer aggregator and HQ router.

pub mod error;
pub mod routes;
pub mod state;
