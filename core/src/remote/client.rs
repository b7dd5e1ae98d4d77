//! RemoteClient: all outbound HTTP-to-a-remote traffic is confined here, the same way
//! the teacher confines each IM provider's wire format to one transport module (see
//! `im/channels/telegram.rs`). `HttpRemoteClient` is the only implementation; the trait
//! exists so the router can be tested against a fake.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Remote, RemoteTimeouts};
use crate::error::{Error, Result};
use crate::session::{Session, SessionId};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub command: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    #[serde(rename = "sessionId")]
    session_id: SessionId,
}

/// The HQ's view of one remote node's session API (spec §6.4: "All session endpoints
/// are identical between HQ and remote"). Implementations forward with the remote's
/// bearer token and the per-call timeout budget in `RemoteTimeouts`.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn health(&self) -> Result<()>;
    async fn list_sessions(&self) -> Result<Vec<Session>>;
    async fn create_session(&self, body: &CreateSessionBody) -> Result<SessionId>;
    async fn get_session(&self, id: SessionId) -> Result<Session>;
    async fn delete_session(&self, id: SessionId) -> Result<()>;
    async fn cleanup_session(&self, id: SessionId) -> Result<()>;
    /// `POST /api/cleanup-exited` on the remote (spec §6.4: "All session endpoints are
    /// identical between HQ and remote"); returns the ids the remote removed.
    async fn cleanup_exited(&self) -> Result<Vec<SessionId>>;
    async fn send_input(&self, id: SessionId, body: &serde_json::Value) -> Result<()>;
    async fn resize(&self, id: SessionId, cols: u16, rows: u16) -> Result<()>;
    async fn reset_size(&self, id: SessionId) -> Result<()>;
    async fn get_text(&self, id: SessionId, styles: bool) -> Result<String>;
    async fn get_buffer(&self, id: SessionId) -> Result<Vec<u8>>;
    /// Opens the upstream SSE call; the router streams the response body to its
    /// downstream client verbatim (spec §4.7 routing rule 5).
    async fn open_stream(&self, id: SessionId) -> Result<reqwest::Response>;
    /// Origin this remote's multiplexed binary WS endpoint is reached at. One socket
    /// carries `{type:"subscribe", sessionId}` frames for every session the HQ needs
    /// from this remote (spec §4.5 "one upstream connection per remote is shared across
    /// all local subscribers").
    fn ws_url(&self) -> url::Url;
    fn bearer_token(&self) -> &str;
}

pub struct HttpRemoteClient {
    http: reqwest::Client,
    base_url: url::Url,
    token: String,
    timeouts: RemoteTimeouts,
}

impl HttpRemoteClient {
    pub fn new(remote: &Remote, timeouts: RemoteTimeouts) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: remote.url.clone(),
            token: remote.token.clone(),
            timeouts,
        }
    }

    fn url(&self, path: &str) -> url::Url {
        self.base_url.join(path).expect("remote path must be relative")
    }

    fn request(&self, method: reqwest::Method, path: &str, timeout: Duration) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(path))
            .bearer_auth(&self.token)
            .timeout(timeout)
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(&self, builder: reqwest::RequestBuilder) -> Result<T> {
        let response = builder.send().await.map_err(|e| Error::RemoteUnreachable(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamStatus { status, body });
        }
        response.json().await.map_err(|e| Error::RemoteUnreachable(e.to_string()))
    }

    async fn send_ok(&self, builder: reqwest::RequestBuilder) -> Result<()> {
        let response = builder.send().await.map_err(|e| Error::RemoteUnreachable(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::UpstreamStatus { status, body });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn health(&self) -> Result<()> {
        self.send_ok(self.request(reqwest::Method::GET, "/api/health", self.timeouts.list)).await
    }

    async fn list_sessions(&self) -> Result<Vec<Session>> {
        self.send_json(self.request(reqwest::Method::GET, "/api/sessions", self.timeouts.list)).await
    }

    async fn create_session(&self, body: &CreateSessionBody) -> Result<SessionId> {
        let builder = self
            .request(reqwest::Method::POST, "/api/sessions", self.timeouts.create)
            .json(body);
        let response: CreateSessionResponse = self.send_json(builder).await?;
        Ok(response.session_id)
    }

    async fn get_session(&self, id: SessionId) -> Result<Session> {
        self.send_json(self.request(reqwest::Method::GET, &format!("/api/sessions/{id}"), self.timeouts.list))
            .await
    }

    async fn delete_session(&self, id: SessionId) -> Result<()> {
        self.send_ok(self.request(reqwest::Method::DELETE, &format!("/api/sessions/{id}"), self.timeouts.cleanup))
            .await
    }

    async fn cleanup_session(&self, id: SessionId) -> Result<()> {
        self.send_ok(self.request(
            reqwest::Method::DELETE,
            &format!("/api/sessions/{id}/cleanup"),
            self.timeouts.cleanup,
        ))
        .await
    }

    async fn cleanup_exited(&self) -> Result<Vec<SessionId>> {
        #[derive(Deserialize)]
        struct CleanupExitedResponse {
            #[serde(rename = "localCleaned")]
            #[allow(dead_code)]
            local_cleaned: u32,
            #[serde(rename = "cleanedIds", default)]
            cleaned_ids: Vec<SessionId>,
        }
        let response: CleanupExitedResponse = self
            .send_json(self.request(reqwest::Method::POST, "/api/cleanup-exited", self.timeouts.cleanup))
            .await?;
        Ok(response.cleaned_ids)
    }

    async fn send_input(&self, id: SessionId, body: &serde_json::Value) -> Result<()> {
        let builder = self
            .request(reqwest::Method::POST, &format!("/api/sessions/{id}/input"), self.timeouts.input_resize)
            .json(body);
        self.send_ok(builder).await
    }

    async fn resize(&self, id: SessionId, cols: u16, rows: u16) -> Result<()> {
        let builder = self
            .request(reqwest::Method::POST, &format!("/api/sessions/{id}/resize"), self.timeouts.input_resize)
            .json(&serde_json::json!({ "cols": cols, "rows": rows }));
        self.send_ok(builder).await
    }

    async fn reset_size(&self, id: SessionId) -> Result<()> {
        self.send_ok(self.request(
            reqwest::Method::POST,
            &format!("/api/sessions/{id}/reset-size"),
            self.timeouts.input_resize,
        ))
        .await
    }

    async fn get_text(&self, id: SessionId, styles: bool) -> Result<String> {
        let path = if styles { format!("/api/sessions/{id}/text?styles") } else { format!("/api/sessions/{id}/text") };
        let response = self
            .request(reqwest::Method::GET, &path, self.timeouts.buffer)
            .send()
            .await
            .map_err(|e| Error::RemoteUnreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::UpstreamStatus { status: response.status().as_u16(), body: String::new() });
        }
        response.text().await.map_err(|e| Error::RemoteUnreachable(e.to_string()))
    }

    async fn get_buffer(&self, id: SessionId) -> Result<Vec<u8>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/api/sessions/{id}/buffer"), self.timeouts.buffer)
            .send()
            .await
            .map_err(|e| Error::RemoteUnreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::UpstreamStatus { status: response.status().as_u16(), body: String::new() });
        }
        Ok(response.bytes().await.map_err(|e| Error::RemoteUnreachable(e.to_string()))?.to_vec())
    }

    async fn open_stream(&self, id: SessionId) -> Result<reqwest::Response> {
        let response = self
            .http
            .get(self.url(&format!("/api/sessions/{id}/stream")))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::RemoteUnreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::UpstreamStatus { status: response.status().as_u16(), body: String::new() });
        }
        Ok(response)
    }

    fn ws_url(&self) -> url::Url {
        let mut url = self.base_url.clone();
        let _ = url.set_scheme(if self.base_url.scheme() == "https" { "wss" } else { "ws" });
        url.set_path("/api/sessions/ws");
        url
    }

    fn bearer_token(&self) -> &str {
        &self.token
    }
}
