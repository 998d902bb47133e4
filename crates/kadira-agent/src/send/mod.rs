// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reliable delivery of payloads to the collection service.

pub mod retry;
pub mod transport;

use crate::config::Config;
use crate::errors::{SendError, TransportError};
use derive_more::Display;
use retry::RetryPolicy;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use transport::{HttpTransport, RelayTransport, Transport};

/// How this process reaches the collection service.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessRole {
    /// The process talks to the service itself.
    #[default]
    #[display("in-process")]
    InProcess,
    /// The process hands payloads to a host relay.
    #[display("proxied")]
    Proxied,
}

#[derive(Clone)]
pub struct DeliveryChannel {
    direct: Option<Arc<dyn Transport>>,
    relay: Option<Arc<dyn Transport>>,
    role: ProcessRole,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl DeliveryChannel {
    #[must_use]
    pub fn new(
        direct: Option<Arc<dyn Transport>>,
        relay: Option<Arc<dyn Transport>>,
        role: ProcessRole,
    ) -> Self {
        Self {
            direct,
            relay,
            role,
            policy: RetryPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// A channel with no destination. Every send fails with [`SendError::NotConnected`].
    #[must_use]
    pub fn disconnected() -> Self {
        Self::new(None, None, ProcessRole::InProcess)
    }

    /// Builds the transports the configuration allows. The direct transport needs an
    /// endpoint and credentials, the relay transport a relay url.
    pub fn from_config(config: &Config) -> Result<Self, TransportError> {
        let direct: Option<Arc<dyn Transport>> =
            match (&config.endpoint, &config.app_id, &config.app_secret) {
                (Some(endpoint), Some(app_id), Some(app_secret)) => Some(Arc::new(
                    HttpTransport::new(endpoint, app_id, app_secret, config.request_timeout)?,
                )),
                _ => None,
            };
        let relay: Option<Arc<dyn Transport>> = config.relay_url.as_deref().map(|url| {
            Arc::new(RelayTransport::new(url, config.request_timeout)) as Arc<dyn Transport>
        });
        Ok(Self::new(direct, relay, config.process_role))
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport().is_some()
    }

    fn transport(&self) -> Option<&Arc<dyn Transport>> {
        match self.role {
            ProcessRole::InProcess => self.direct.as_ref(),
            ProcessRole::Proxied => self.relay.as_ref(),
        }
    }

    /// Sends `payload` to `path`, retrying transient failures with backoff.
    pub async fn send(&self, path: &str, payload: &Value) -> Result<Option<Value>, SendError> {
        let transport = Arc::clone(self.transport().ok_or(SendError::NotConnected)?);
        let path = normalize_path(path);
        let max_attempts = self.policy.max_attempts;
        let mut last_error = TransportError::Network("no attempt was made".to_string());

        for attempt in 0..max_attempts {
            let delay = self.policy.delay(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = self.cancel.cancelled() => {
                        debug!("Delivery to {path} cancelled before attempt {}", attempt + 1);
                        return Err(SendError::Cancelled { path });
                    }
                }
            }

            match transport.send(&path, payload).await {
                Ok(response) => {
                    debug!("Delivered payload to {path} on attempt {}", attempt + 1);
                    return Ok(response);
                }
                Err(e) => {
                    debug!("Attempt {}/{max_attempts} to {path} failed: {e}", attempt + 1);
                    last_error = e;
                }
            }
        }

        warn!("Giving up on {path} after {max_attempts} attempts: {last_error}");
        Err(SendError::Exhausted {
            path,
            attempts: max_attempts,
            last_error,
        })
    }

    /// Runs [`send`](Self::send) on a new task and hands the result to `callback` once.
    /// Fails without spawning when the channel is not connected.
    pub fn spawn_send<F>(
        &self,
        path: &str,
        payload: Value,
        callback: F,
    ) -> Result<JoinHandle<()>, SendError>
    where
        F: FnOnce(Result<Option<Value>, SendError>) + Send + 'static,
    {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        let channel = self.clone();
        let path = path.to_string();
        Ok(tokio::spawn(async move {
            let result = channel.send(&path, &payload).await;
            callback(result);
        }))
    }
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}
