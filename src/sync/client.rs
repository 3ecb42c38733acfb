use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::config::SyncConfig;
use crate::state::{DocumentMeta, StateDocument};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Remote state not found")]
    NotFound,
    #[error("Version conflict")]
    Conflict,
    #[error("Server error {status}: {code}")]
    Server { status: u16, code: String },
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl SyncError {
    /// True when the failure looks like a reachability problem (connect
    /// refused, DNS, timeout) rather than a server-side rejection.
    pub fn is_connectivity(&self) -> bool {
        match self {
            SyncError::Http(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }
}

/// Body of `PUT /state`: the full document plus the version the client
/// believes is the latest ancestor of its edit. `None` serializes as null
/// and asks the server for an unconditional write (first seed).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PutStateRequest<'a> {
    state: &'a StateDocument,
    expected_version: Option<u64>,
}

/// Success body of `PUT /state`; `meta` carries the server-stamped version.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PutStateResponse {
    pub ok: bool,
    pub meta: DocumentMeta,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// HTTP client for the remote state endpoint. Thin: status-code mapping and
/// JSON decoding only; protocol decisions live in the sync manager.
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RemoteClient {
    pub fn new(config: &SyncConfig, token: &str) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET the remote document as raw JSON (the caller normalizes).
    pub async fn fetch_state(&self) -> Result<Value, SyncError> {
        let resp = self
            .http
            .get(self.url("/state"))
            .bearer_auth(&self.token)
            .send()
            .await?;
        match resp.status().as_u16() {
            200 => resp
                .json::<Value>()
                .await
                .map_err(|e| SyncError::Malformed(e.to_string())),
            401 => Err(SyncError::Unauthorized),
            404 => Err(SyncError::NotFound),
            status => Err(Self::error_for(status, resp).await),
        }
    }

    /// PUT the document with an optimistic-concurrency precondition.
    pub async fn put_state(
        &self,
        state: &StateDocument,
        expected_version: Option<u64>,
    ) -> Result<PutStateResponse, SyncError> {
        let body = PutStateRequest {
            state,
            expected_version,
        };
        let resp = self
            .http
            .put(self.url("/state"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        match resp.status().as_u16() {
            200 => resp
                .json::<PutStateResponse>()
                .await
                .map_err(|e| SyncError::Malformed(e.to_string())),
            401 => Err(SyncError::Unauthorized),
            409 => Err(SyncError::Conflict),
            status => Err(Self::error_for(status, resp).await),
        }
    }

    /// GET /health; used for keep-alive pings only.
    pub async fn ping(&self) -> Result<(), SyncError> {
        let resp = self.http.get(self.url("/health")).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_for(resp.status().as_u16(), resp).await)
        }
    }

    async fn error_for(status: u16, resp: reqwest::Response) -> SyncError {
        let code = resp
            .json::<ErrorBody>()
            .await
            .map(|b| b.error)
            .unwrap_or_else(|_| "UNKNOWN".to_string());
        SyncError::Server { status, code }
    }
}
