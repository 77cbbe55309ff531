//! Remote push/pull surface.
//!
//! The engine needs exactly two remote operations: submit a batch of local
//! changes and receive one verdict per change, and fetch remote changes
//! since a logical-time checkpoint. Both sit behind [`RemoteTransport`] so
//! tests run against an in-process double.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::EntityKind;
use crate::error::{SyncError, SyncResult};
use crate::queue::Operation;

/// One local change uploaded in a push batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeUpload {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub operation: Operation,
    pub client_version: i64,
    pub client_timestamp: DateTime<Utc>,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_payload: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub facility_id: String,
    pub client_id: String,
    pub device_name: String,
    pub device_type: String,
    pub changes: Vec<ChangeUpload>,
}

/// The remote's per-change outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Synced,
    Conflict,
    /// Any verdict this client does not recognize.
    #[serde(other)]
    Rejected,
}

/// One verdict, positionally aligned with the pushed changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_payload: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub results: Vec<Verdict>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub facility_id: String,
    pub client_id: String,
    /// Logical time of the last fully-applied pull page.
    pub since: i64,
}

/// One remote change returned from a pull.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteChange {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub operation: Operation,
    #[serde(default)]
    pub payload: Option<Value>,
    /// Server-side logical time of the change.
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub changes: Vec<RemoteChange>,
    pub has_more: bool,
}

/// The authoritative remote store the engine reconciles against.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn push(&self, request: PushRequest) -> SyncResult<PushResponse>;

    async fn pull(&self, request: PullRequest) -> SyncResult<PullResponse>;
}

/// HTTP transport to the sync endpoints.
pub struct HttpTransport {
    server_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport for the given base URL. The request timeout is the
    /// transport-level stall bound: a hung call surfaces as a transport
    /// failure rather than stalling a cycle forever.
    pub fn new(
        server_url: impl Into<String>,
        auth_token: Option<String>,
        timeout: std::time::Duration,
    ) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        Ok(Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            auth_token,
            client,
        })
    }

    async fn post<Req, Resp>(&self, path: &str, request: &Req) -> SyncResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("{}{}", self.server_url, path);
        let mut req = self.client.post(&url).json(request);

        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }

        let response = req
            .send()
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(SyncError::Transport(format!(
                "{} failed with status: {}",
                path,
                response.status()
            )));
        }

        response
            .json::<Resp>()
            .await
            .map_err(|e| SyncError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl RemoteTransport for HttpTransport {
    async fn push(&self, request: PushRequest) -> SyncResult<PushResponse> {
        self.post("/sync/push", &request).await
    }

    async fn pull(&self, request: PullRequest) -> SyncResult<PullResponse> {
        self.post("/sync/pull", &request).await
    }
}
