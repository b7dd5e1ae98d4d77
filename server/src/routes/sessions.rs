//! C10: `/api/sessions*` and `/api/cleanup-exited` (spec §4.8).

use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use vt_core::activity::Activity;
use vt_core::remote::client::CreateSessionBody as RemoteCreateSessionBody;
use vt_core::remote::router::{Route, SessionWithSource};
use vt_core::remote::RemoteId;
use vt_core::session::manager::{CreateOptions, Input};
use vt_core::session::{Session, SessionId};
use vt_core::Error;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

const EXTERNAL_SPAWN_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn health() -> StatusCode {
    StatusCode::OK
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub remote_id: Option<RemoteId>,
    #[serde(default)]
    pub spawn_terminal: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSessionResponse {
    session_id: SessionId,
}

#[derive(Debug, Serialize)]
struct SuccessBody {
    success: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResizeResponse {
    success: bool,
    cols: u16,
    rows: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CleanupExitedResponse {
    local_cleaned: u32,
    remote_results: Vec<vt_core::remote::router::RemoteCleanupOutcome>,
    cleaned_ids: Vec<SessionId>,
}

pub async fn list_sessions(State(state): State<AppState>) -> ApiResult<Json<Vec<SessionWithSource>>> {
    let mut sessions: Vec<SessionWithSource> = state
        .sessions
        .list_sessions()?
        .into_iter()
        .map(|session| SessionWithSource { session, source: "local", remote_id: None, remote_name: None })
        .collect();
    if state.config.is_hq {
        sessions.extend(state.hq_router.list_remote_sessions().await);
    }
    Ok(Json(sessions))
}

/// §6.3: best-effort external terminal spawn. Returns `true` on a reported success,
/// `false` on any failure, timeout, or missing socket — in all of those cases the
/// caller falls back to spawning in-process with the same pre-assigned id.
async fn try_spawn_external_terminal(
    socket: &std::path::Path,
    session_id: SessionId,
    working_dir: &str,
    command: &[String],
) -> bool {
    let attempt = async {
        let mut stream = UnixStream::connect(socket).await.ok()?;
        let request = serde_json::json!({
            "workingDir": working_dir,
            "sessionId": session_id.to_string(),
            "command": command,
            "terminal": "vibetunnel",
        });
        let mut line = serde_json::to_vec(&request).ok()?;
        line.push(b'\n');
        stream.write_all(&line).await.ok()?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.ok()?;
        let response: serde_json::Value = serde_json::from_slice(&buf).ok()?;
        response.get("success")?.as_bool()
    };
    matches!(tokio::time::timeout(EXTERNAL_SPAWN_TIMEOUT, attempt).await, Ok(Some(true)))
}

pub async fn create_session(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> ApiResult<Json<CreateSessionResponse>> {
    if body.command.is_empty() {
        return Err(ApiError::Core(Error::InvalidArgument("command must not be empty".into())));
    }

    if let Some(remote_id) = body.remote_id {
        let remote_body = RemoteCreateSessionBody {
            command: body.command,
            working_dir: body.working_dir,
            name: body.name,
        };
        let session_id = state.hq_router.create_on_remote(remote_id, &remote_body).await?;
        return Ok(Json(CreateSessionResponse { session_id }));
    }

    let id = SessionId::new();
    let cwd = body.working_dir.map(std::path::PathBuf::from).unwrap_or_else(|| state.config.root.clone());

    if body.spawn_terminal
        && try_spawn_external_terminal(&state.config.external_terminal_socket, id, &cwd.display().to_string(), &body.command).await
    {
        return Ok(Json(CreateSessionResponse { session_id: id }));
    }

    let opts = CreateOptions { id: Some(id), name: body.name, cwd, ..CreateOptions::default() };
    let session = state.sessions.create_session(body.command, opts)?;
    Ok(Json(CreateSessionResponse { session_id: session.id }))
}

pub async fn get_session(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Json<Session>> {
    match state.hq_router.route(id) {
        Route::Local => {
            let session = state.sessions.get_session(id)?.ok_or(Error::SessionNotFound(id))?;
            Ok(Json(session))
        }
        Route::Remote(client) => Ok(Json(client.get_session(id).await?)),
    }
}

pub async fn delete_session(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Json<SuccessBody>> {
    match state.hq_router.route(id) {
        Route::Local => {
            state.sessions.kill_session(id, vt_core::pty::Signal::Term)?;
            Ok(Json(SuccessBody { success: true }))
        }
        Route::Remote(client) => {
            client.delete_session(id).await?;
            Ok(Json(SuccessBody { success: true }))
        }
    }
}

pub async fn cleanup_session(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Json<SuccessBody>> {
    match state.hq_router.route(id) {
        Route::Local => {
            state.sessions.cleanup_session(id)?;
            state.activity.forget(id);
            state.terminals.remove(id);
            Ok(Json(SuccessBody { success: true }))
        }
        Route::Remote(client) => {
            client.cleanup_session(id).await?;
            Ok(Json(SuccessBody { success: true }))
        }
    }
}

pub async fn cleanup_exited(State(state): State<AppState>) -> ApiResult<Json<CleanupExitedResponse>> {
    let mut cleaned_ids = state.sessions.cleanup_exited_sessions()?;
    for id in &cleaned_ids {
        state.activity.forget(*id);
        state.terminals.remove(*id);
    }
    let local_cleaned = cleaned_ids.len() as u32;

    let remote_results = if state.config.is_hq { state.hq_router.cleanup_exited_on_remotes().await } else { Vec::new() };
    for outcome in &remote_results {
        cleaned_ids.extend(outcome.cleaned_ids.iter().copied());
    }

    Ok(Json(CleanupExitedResponse { local_cleaned, remote_results, cleaned_ids }))
}

fn sample_activity(state: &AppState, session: &Session) -> Activity {
    let engine = state.buffers.engine_for(session.id).ok();
    let cursor = engine.as_ref().map(|e| { let s = e.snapshot(); (s.cursor_x, s.cursor_y) }).unwrap_or((0, 0));
    let tail_byte = engine.and_then(|e| {
        e.plain_text(false)
            .lines()
            .rev()
            .find(|line| !line.is_empty())
            .and_then(|line| line.chars().last())
            .filter(|c| c.is_ascii())
            .map(|c| c as u8)
    });
    state.activity.sample(session, tail_byte, cursor)
}

pub async fn activity_all(State(state): State<AppState>) -> ApiResult<Json<HashMap<SessionId, Activity>>> {
    let mut out = HashMap::new();
    for session in state.sessions.list_sessions()? {
        let activity = sample_activity(&state, &session);
        out.insert(session.id, activity);
    }
    Ok(Json(out))
}

pub async fn activity_one(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Json<Activity>> {
    let session = state.sessions.get_session(id)?.ok_or(Error::SessionNotFound(id))?;
    Ok(Json(sample_activity(&state, &session)))
}

pub async fn get_text(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    axum::extract::RawQuery(query): axum::extract::RawQuery,
) -> ApiResult<impl IntoResponse> {
    let with_styles = query.map(|q| q.split('&').any(|pair| pair == "styles" || pair.starts_with("styles="))).unwrap_or(false);
    let text = match state.hq_router.route(id) {
        Route::Local => {
            let engine = state.buffers.engine_for(id)?;
            engine.plain_text(with_styles)
        }
        Route::Remote(client) => client.get_text(id, with_styles).await?,
    };
    Ok(([(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")], text))
}

pub async fn get_buffer(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<impl IntoResponse> {
    let bytes = match state.hq_router.route(id) {
        Route::Local => {
            let engine = state.buffers.engine_for(id)?;
            engine.snapshot().encode()
        }
        Route::Remote(client) => client.get_buffer(id).await?,
    };
    Ok(([(axum::http::header::CONTENT_TYPE, "application/octet-stream")], bytes))
}

#[derive(Debug, Deserialize)]
pub struct InputRequest {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    key: Option<String>,
}

pub async fn send_input(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(body): Json<InputRequest>,
) -> ApiResult<Json<SuccessBody>> {
    let input = match (body.text, body.key) {
        (Some(text), None) => Input::Text(text),
        (None, Some(key)) => Input::Key(key),
        _ => return Err(ApiError::BadRequest("input must carry exactly one of `text` or `key`".into())),
    };
    match state.hq_router.route(id) {
        Route::Local => state.sessions.send_input(id, input)?,
        Route::Remote(client) => {
            let body = match &input {
                Input::Text(text) => serde_json::json!({ "text": text }),
                Input::Key(key) => serde_json::json!({ "key": key }),
            };
            client.send_input(id, &body).await?;
        }
    }
    Ok(Json(SuccessBody { success: true }))
}

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    cols: u16,
    rows: u16,
}

pub async fn resize_session(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
    Json(body): Json<ResizeRequest>,
) -> ApiResult<Json<ResizeResponse>> {
    match state.hq_router.route(id) {
        Route::Local => state.sessions.resize_session(id, body.cols, body.rows)?,
        Route::Remote(client) => client.resize(id, body.cols, body.rows).await?,
    }
    Ok(Json(ResizeResponse { success: true, cols: body.cols, rows: body.rows }))
}

pub async fn reset_session_size(State(state): State<AppState>, Path(id): Path<SessionId>) -> ApiResult<Json<SuccessBody>> {
    match state.hq_router.route(id) {
        Route::Local => state.sessions.reset_session_size(id)?,
        Route::Remote(client) => client.reset_size(id).await?,
    }
    Ok(Json(SuccessBody { success: true }))
}
