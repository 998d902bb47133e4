// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;
use thiserror::Error;

/// Failure of a single transport call. Every variant is treated as transient by the
/// delivery channel.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("relay error: {0}")]
    Relay(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Network(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    /// The agent has no destination yet. This is a programming error and is never retried.
    #[error("You need to connect with Kadira first, before sending messages!")]
    NotConnected,
    #[error("delivery to {path} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        path: String,
        attempts: u32,
        last_error: TransportError,
    },
    #[error("delivery to {path} cancelled while waiting to retry")]
    Cancelled { path: String },
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Kadira: Match Error: {0}")]
    Parse(String),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}
