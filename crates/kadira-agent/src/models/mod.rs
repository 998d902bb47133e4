// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregation models. Each model owns its in-memory state and turns it into a delivery
//! payload when the scheduler flushes it.

pub mod errors;
pub mod methods;

use crate::logger::EventLogger;
use crate::statsd::MetricsClient;
use crate::time_bucket::{bucket_id, BucketId, Clock};
use serde_json::Value;
use std::sync::Arc;

/// A snapshot ready to be handed to the delivery channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub path: &'static str,
    pub body: Value,
}

pub trait Model: Send + Sync {
    fn name(&self) -> &'static str;

    fn get_bucket_id(&self, timestamp_ms: i64) -> BucketId {
        bucket_id(timestamp_ms)
    }

    /// Takes the data that is ready to ship and clears it from the model. `None` when there
    /// is nothing to send.
    fn send_periodic_metrics(&self) -> Option<Payload>;

    /// Takes everything the model holds, including data that would normally wait for a
    /// later flush. Called once on shutdown.
    fn flush_all(&self) -> Option<Payload> {
        self.send_periodic_metrics()
    }
}

/// Collaborators every model reports through.
#[derive(Clone)]
pub struct ModelContext {
    pub clock: Arc<dyn Clock>,
    pub logger: Arc<dyn EventLogger>,
    pub metrics: Arc<dyn MetricsClient>,
}
