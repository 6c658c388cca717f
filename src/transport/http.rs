//! reqwest-backed transport

use std::time::Duration;

use async_trait::async_trait;

use super::{Method, Transport, WireRequest, WireResponse};
use crate::error::{SyncError, SyncResult};

/// HTTP transport talking to a remote sync server
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, path: &str, request: WireRequest) -> SyncResult<WireResponse> {
        let url = format!("{}{}", self.base_url, path);

        let mut builder = match request.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if request.method != Method::Get {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                SyncError::Timeout(self.timeout.as_millis() as u64)
            } else {
                SyncError::Transport(format!("Failed to reach {}: {}", url, e))
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();

        let body = response
            .bytes()
            .await
            .map_err(|e| SyncError::Transport(format!("Failed to read response body: {}", e)))?
            .to_vec();

        tracing::debug!(url = %url, status, bytes = body.len(), "Sync request completed");

        Ok(WireResponse {
            status,
            headers,
            body,
        })
    }
}
