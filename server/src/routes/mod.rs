//! C10: the HTTP/SSE/WS surface over `vt-core` (spec §4.8).

pub mod remotes;
pub mod sessions;
pub mod stream;
pub mod ws;

use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(sessions::health))
        .route("/api/sessions", get(sessions::list_sessions).post(sessions::create_session))
        .route("/api/sessions/activity", get(sessions::activity_all))
        .route("/api/sessions/ws", get(ws::handle_ws))
        .route("/api/cleanup-exited", post(sessions::cleanup_exited))
        .route(
            "/api/sessions/{id}",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route("/api/sessions/{id}/cleanup", delete(sessions::cleanup_session))
        .route("/api/sessions/{id}/activity", get(sessions::activity_one))
        .route("/api/sessions/{id}/text", get(sessions::get_text))
        .route("/api/sessions/{id}/buffer", get(sessions::get_buffer))
        .route("/api/sessions/{id}/stream", get(stream::stream_session))
        .route("/api/sessions/{id}/input", post(sessions::send_input))
        .route("/api/sessions/{id}/resize", post(sessions::resize_session))
        .route("/api/sessions/{id}/reset-size", post(sessions::reset_session_size))
        .route("/api/remotes", get(remotes::list_remotes).post(remotes::register_remote))
        .route("/api/remotes/{id}", delete(remotes::unregister_remote))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
