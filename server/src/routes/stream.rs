//! C10 + C6: `GET /api/sessions/:id/stream`, a raw `text/event-stream` forwarding of the
//! `StreamWatcher`'s pre-formatted SSE lines (spec §4.4). Forwards upstream bytes
//! verbatim when the session belongs to a remote (spec §4.7 routing rule 5).

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::Response;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use vt_core::remote::router::Route;
use vt_core::Error;
use vt_core::session::SessionId;

use crate::error::ApiResult;
use crate::state::AppState;

/// Detaches the `StreamWatcher` subscriber when the response body stream is dropped,
/// which happens on client disconnect as well as normal completion.
struct RemoveOnDrop {
    watcher: std::sync::Arc<vt_core::stream::StreamWatcher>,
    session_id: SessionId,
    subscriber_id: u64,
}

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        self.watcher.remove_client(self.session_id, self.subscriber_id);
    }
}

pub async fn stream_session(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Response> {
    match state.hq_router.route(id) {
        Route::Local => {
            let paths = state.sessions.session_paths(id)?.ok_or(Error::SessionNotFound(id))?;
            let (subscriber_id, rx) = state.stream_watcher.add_client(id, paths.stdout);
            let guard = RemoveOnDrop { watcher: state.stream_watcher.clone(), session_id: id, subscriber_id };

            let stream = ReceiverStream::new(rx).map(move |line| {
                let _keep_alive = &guard;
                Ok::<_, std::io::Error>(line.into_bytes())
            });
            let body = Body::from_stream(stream);
            Ok(Response::builder()
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(body)
                .expect("static SSE response headers are always valid"))
        }
        Route::Remote(client) => {
            let upstream = client.open_stream(id).await?;
            let body = Body::from_stream(upstream.bytes_stream());
            Ok(Response::builder()
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(body)
                .expect("static SSE response headers are always valid"))
        }
    }
}
