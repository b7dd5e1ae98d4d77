//! C10 + C8/C9: `/api/remotes*` (spec §4.7 Open Question, resolved in SPEC_FULL.md §4.7).

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use vt_core::remote::{Remote, RemoteId};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRemoteRequest {
    pub name: String,
    pub url: url::Url,
    pub token: String,
}

pub async fn list_remotes(State(state): State<AppState>) -> Json<Vec<Remote>> {
    Json(state.hq_router.registry().get_remotes())
}

pub async fn register_remote(
    State(state): State<AppState>,
    Json(body): Json<RegisterRemoteRequest>,
) -> ApiResult<Json<Remote>> {
    let remote = state.hq_router.register(body.name, body.url, body.token)?;
    Ok(Json(remote))
}

pub async fn unregister_remote(State(state): State<AppState>, Path(id): Path<RemoteId>) -> Json<serde_json::Value> {
    state.hq_router.unregister(id);
    Json(serde_json::json!({ "success": true }))
}
