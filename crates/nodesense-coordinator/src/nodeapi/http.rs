// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! HTTP node API backend.
//!
//! Talks to the control plane over a REST surface:
//!
//! - `GET    /nodes`                      -- list node objects
//! - `GET    /nodes/{name}`               -- fetch one node
//! - `PATCH  /nodes/{name}`               -- atomic node update
//! - `GET    /objects/{kind}`             -- list auxiliary objects
//! - `DELETE /objects/{kind}/{name}`      -- delete one auxiliary object
//! - `POST   /leases/{name}/acquire`      -- lease acquisition
//! - `POST   /leases/{name}/renew`        -- lease renewal
//! - `GET    /nodes/events`               -- JSON-lines event stream
//!
//! Every call carries the configured per-request deadline; conflicts
//! surface as [`ApiError::Conflict`] and are retried by the
//! reconciler, transient failures by the caller's backoff.

use super::{ApiError, Node, NodeApi, NodeEvent, NodePatch};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

const WATCH_CHANNEL_DEPTH: usize = 256;
const WATCH_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// HTTP [`NodeApi`] implementation.
#[derive(Debug, Clone)]
pub struct HttpNodeApi {
    base: String,
    client: Client,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LeaseRequest<'a> {
    holder: &'a str,
    duration_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseResponse {
    held: bool,
}

impl HttpNodeApi {
    /// Create a client for the given endpoint (e.g. `http://cp:8080`).
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            base: endpoint.trim_end_matches('/').to_string(),
            client,
            timeout,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn map_error(e: reqwest::Error) -> ApiError {
        if e.is_timeout() {
            ApiError::Timeout
        } else {
            ApiError::Transport(e.to_string())
        }
    }

    async fn check(kind: &str, name: &str, response: Response) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => ApiError::not_found(kind, name),
            StatusCode::CONFLICT => ApiError::Conflict(name.to_string()),
            _ => ApiError::Status {
                status: status.as_u16(),
                message,
            },
        })
    }
}

impl NodeApi for HttpNodeApi {
    async fn list_nodes(&self) -> Result<Vec<Node>, ApiError> {
        let response = self
            .client
            .get(self.url("/nodes"))
            .send()
            .await
            .map_err(Self::map_error)?;
        Self::check("node", "*", response)
            .await?
            .json()
            .await
            .map_err(Self::map_error)
    }

    async fn get_node(&self, name: &str) -> Result<Node, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("/nodes/{}", name)))
            .send()
            .await
            .map_err(Self::map_error)?;
        Self::check("node", name, response)
            .await?
            .json()
            .await
            .map_err(Self::map_error)
    }

    async fn patch_node(&self, name: &str, patch: &NodePatch) -> Result<Node, ApiError> {
        let response = self
            .client
            .patch(self.url(&format!("/nodes/{}", name)))
            .json(patch)
            .send()
            .await
            .map_err(Self::map_error)?;
        Self::check("node", name, response)
            .await?
            .json()
            .await
            .map_err(Self::map_error)
    }

    async fn list_objects(&self, kind: &str) -> Result<Vec<String>, ApiError> {
        let response = self
            .client
            .get(self.url(&format!("/objects/{}", kind)))
            .send()
            .await
            .map_err(Self::map_error)?;
        Self::check(kind, "*", response)
            .await?
            .json()
            .await
            .map_err(Self::map_error)
    }

    async fn delete_object(&self, kind: &str, name: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(self.url(&format!("/objects/{}/{}", kind, name)))
            .send()
            .await
            .map_err(Self::map_error)?;
        Self::check(kind, name, response).await?;
        Ok(())
    }

    async fn acquire_lease(
        &self,
        name: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<bool, ApiError> {
        let response = self
            .client
            .post(self.url(&format!("/leases/{}/acquire", name)))
            .json(&LeaseRequest {
                holder,
                duration_secs: duration.as_secs(),
            })
            .send()
            .await
            .map_err(Self::map_error)?;
        let lease: LeaseResponse = Self::check("lease", name, response)
            .await?
            .json()
            .await
            .map_err(Self::map_error)?;
        Ok(lease.held)
    }

    async fn renew_lease(
        &self,
        name: &str,
        holder: &str,
        duration: Duration,
    ) -> Result<bool, ApiError> {
        let response = self
            .client
            .post(self.url(&format!("/leases/{}/renew", name)))
            .json(&LeaseRequest {
                holder,
                duration_secs: duration.as_secs(),
            })
            .send()
            .await
            .map_err(Self::map_error)?;
        let lease: LeaseResponse = Self::check("lease", name, response)
            .await?
            .json()
            .await
            .map_err(Self::map_error)?;
        Ok(lease.held)
    }

    async fn watch_nodes(&self) -> Result<mpsc::Receiver<NodeEvent>, ApiError> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_DEPTH);
        let url = self.url("/nodes/events");
        let timeout = self.timeout;

        // The event stream outlives individual requests: reconnect on
        // any failure, the periodic GC sweep covers the gaps.
        tokio::spawn(async move {
            // A dedicated client without a request deadline; streams
            // are long-lived by design.
            let client = match Client::builder().connect_timeout(timeout).build() {
                Ok(client) => client,
                Err(e) => {
                    tracing::error!("node watch client: {}", e);
                    return;
                }
            };

            loop {
                match client.get(&url).send().await {
                    Ok(response) if response.status().is_success() => {
                        if stream_events(response, &tx).await.is_err() {
                            // Receiver dropped: watcher is gone.
                            return;
                        }
                        tracing::debug!("node event stream ended, reconnecting");
                    }
                    Ok(response) => {
                        tracing::warn!("node event stream status {}", response.status());
                    }
                    Err(e) => {
                        tracing::warn!("node event stream error: {}", e);
                    }
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(WATCH_RECONNECT_DELAY).await;
            }
        });

        Ok(rx)
    }
}

/// Forward one response's JSON-lines events; `Err` means the receiver
/// side hung up.
async fn stream_events(mut response: Response, tx: &mpsc::Sender<NodeEvent>) -> Result<(), ()> {
    let mut buffer = Vec::new();
    while let Ok(Some(chunk)) = response.chunk().await {
        buffer.extend_from_slice(&chunk);
        while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<NodeEvent>(line) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        return Err(());
                    }
                }
                Err(e) => tracing::warn!("bad node event {:?}: {}", line, e),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_construction() {
        let api = HttpNodeApi::new("http://cp:8080/", Duration::from_secs(30)).unwrap();
        assert_eq!(api.url("/nodes/n1"), "http://cp:8080/nodes/n1");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let api = HttpNodeApi::new("http://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        let err = api.get_node("n1").await.unwrap_err();
        assert!(err.is_transient(), "unexpected error: {:?}", err);
    }

    #[test]
    fn test_node_event_wire_format() {
        let event: NodeEvent = serde_json::from_str(r#"{"type":"deleted","name":"n1"}"#).unwrap();
        assert_eq!(
            event,
            NodeEvent::Deleted {
                name: "n1".to_string()
            }
        );
    }
}
