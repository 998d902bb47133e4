// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transports carry one delivery attempt to the collection service.
//!
//! - [`HttpTransport`] posts the payload straight to `<endpoint><path>`.
//! - [`RelayTransport`] is used by processes that cannot reach the service themselves; it
//!   hands `{endpoint, payload}` to the host process, which forwards it.

use crate::errors::TransportError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Delivers `payload` to `path` once. `Ok(None)` means the service accepted the payload
    /// without a JSON answer.
    async fn send(&self, path: &str, payload: &Value) -> Result<Option<Value>, TransportError>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(
        endpoint: &str,
        app_id: &str,
        app_secret: &str,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("kadira-app-id", header_value(app_id)?);
        headers.insert("kadira-app-secret", header_value(app_secret)?);

        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            headers,
            timeout,
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value)
        .map_err(|e| TransportError::Network(format!("invalid header value: {e}")))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, path: &str, payload: &Value) -> Result<Option<Value>, TransportError> {
        let url = format!("{}{}", self.endpoint, path);
        let resp = self
            .client
            .post(&url)
            .headers(self.headers.clone())
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await?;
        read_response(resp).await
    }
}

#[derive(Debug, Clone)]
pub struct RelayTransport {
    client: reqwest::Client,
    relay_url: String,
    timeout: Duration,
}

impl RelayTransport {
    #[must_use]
    pub fn new(relay_url: &str, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            relay_url: relay_url.to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn send(&self, path: &str, payload: &Value) -> Result<Option<Value>, TransportError> {
        let body = json!({ "endpoint": path, "payload": payload });
        let resp = self
            .client
            .post(&self.relay_url)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Relay(e.to_string()))?;
        read_response(resp).await
    }
}

async fn read_response(resp: reqwest::Response) -> Result<Option<Value>, TransportError> {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        return Err(TransportError::Status { status, body });
    }
    if body.trim().is_empty() {
        return Ok(None);
    }
    match serde_json::from_str(&body) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            debug!("Ignoring non-JSON response body: {e}");
            Ok(None)
        }
    }
}
