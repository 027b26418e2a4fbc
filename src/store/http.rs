//! HTTP/JSON implementation of the remote store
//!
//! Talks to a mnemon-compatible memory service. Every failure is mapped
//! through the central status classification so the sync worker can decide
//! retry behavior without inspecting transport details.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use super::{CapacitySnapshot, RemoteBatchOutcome, RemoteStore, UpdatedStamp};
use crate::error::RemoteError;
use crate::types::{ContentHash, Memory};

/// Configuration for the HTTP remote backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRemoteConfig {
    /// Service base URL (e.g., "https://memories.example.com/v1")
    pub base_url: String,
    /// Bearer token, if the service requires one
    pub api_token: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_timeout() -> u64 {
    30
}

/// Remote memory store over HTTP/JSON
pub struct HttpRemoteStore {
    client: reqwest::Client,
    config: HttpRemoteConfig,
}

#[derive(Serialize)]
struct PutBatchRequest<'a> {
    memories: &'a [Memory],
}

#[derive(Deserialize)]
struct WireError {
    code: u16,
    message: String,
}

#[derive(Deserialize)]
struct BatchResponse {
    #[serde(default)]
    acked: Vec<ContentHash>,
    #[serde(default)]
    errors: HashMap<ContentHash, WireError>,
}

#[derive(Serialize)]
struct DeleteBatchRequest<'a> {
    hashes: &'a [ContentHash],
}

#[derive(Deserialize)]
struct HashesResponse {
    hashes: Vec<ContentHash>,
}

#[derive(Deserialize)]
struct UpdatedResponse {
    entries: Vec<UpdatedStamp>,
}

impl HttpRemoteStore {
    pub fn new(config: HttpRemoteConfig) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RemoteError::permanent(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method, self.url(path));
        if let Some(token) = &self.config.api_token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// Issue a request and surface non-success responses as classified
    /// errors. Transport-level failures (no response) classify via status 0.
    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response, RemoteError> {
        let response = req.send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::from_status(status.as_u16(), truncate(&body)))
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    // Timeouts and connection errors never reached the server; status 0
    // classifies them as temporary
    RemoteError::from_status(0, e.to_string())
}

fn truncate(body: &str) -> String {
    const MAX: usize = 512;
    if body.len() > MAX {
        format!("{}...", &body[..MAX])
    } else {
        body.to_string()
    }
}

fn outcome_from_response(response: BatchResponse) -> RemoteBatchOutcome {
    let errors = response
        .errors
        .into_iter()
        .map(|(hash, e)| (hash, RemoteError::from_status(e.code, e.message)))
        .collect();
    RemoteBatchOutcome {
        acked: response.acked,
        errors,
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn put_batch(&self, memories: &[Memory]) -> Result<RemoteBatchOutcome, RemoteError> {
        let response = self
            .send(
                self.request(reqwest::Method::POST, "memories/batch")
                    .json(&PutBatchRequest { memories }),
            )
            .await?;
        let parsed: BatchResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::permanent(format!("Malformed batch response: {}", e)))?;
        Ok(outcome_from_response(parsed))
    }

    async fn get(&self, content_hash: &str) -> Result<Option<Memory>, RemoteError> {
        let req = self.request(
            reqwest::Method::GET,
            &format!("memories/{}", content_hash),
        );
        let response = req.send().await.map_err(transport_error)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::from_status(status.as_u16(), truncate(&body)));
        }
        let memory: Memory = response
            .json()
            .await
            .map_err(|e| RemoteError::permanent(format!("Malformed memory response: {}", e)))?;
        Ok(Some(memory))
    }

    async fn delete_batch(
        &self,
        hashes: &[ContentHash],
    ) -> Result<RemoteBatchOutcome, RemoteError> {
        let response = self
            .send(
                self.request(reqwest::Method::POST, "memories/delete")
                    .json(&DeleteBatchRequest { hashes }),
            )
            .await?;
        let parsed: BatchResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::permanent(format!("Malformed delete response: {}", e)))?;
        Ok(outcome_from_response(parsed))
    }

    async fn all_hashes(&self) -> Result<HashSet<ContentHash>, RemoteError> {
        let response = self
            .send(self.request(reqwest::Method::GET, "memories/hashes"))
            .await?;
        let parsed: HashesResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::permanent(format!("Malformed hashes response: {}", e)))?;
        Ok(parsed.hashes.into_iter().collect())
    }

    async fn updated_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<UpdatedStamp>, RemoteError> {
        let response = self
            .send(
                self.request(reqwest::Method::GET, "memories/updated")
                    .query(&[("since", since.to_rfc3339())]),
            )
            .await?;
        let parsed: UpdatedResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::permanent(format!("Malformed updated response: {}", e)))?;
        Ok(parsed.entries)
    }

    async fn capacity(&self) -> Result<CapacitySnapshot, RemoteError> {
        let response = self
            .send(self.request(reqwest::Method::GET, "capacity"))
            .await?;
        response
            .json()
            .await
            .map_err(|e| RemoteError::permanent(format!("Malformed capacity response: {}", e)))
    }
}
