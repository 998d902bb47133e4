// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Inputs produced by the host's instrumentation: completed method traces, server-side
//! exceptions and client-reported errors.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Timing dimensions tracked for every method call.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricField {
    #[display("wait")]
    Wait,
    #[display("db")]
    Db,
    #[display("http")]
    Http,
    #[display("email")]
    Email,
    #[display("async")]
    Async,
    #[display("compute")]
    Compute,
    #[display("total")]
    Total,
}

impl MetricField {
    pub const ALL: [MetricField; 7] = [
        MetricField::Wait,
        MetricField::Db,
        MetricField::Http,
        MetricField::Email,
        MetricField::Async,
        MetricField::Compute,
        MetricField::Total,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.to_string() == name)
    }
}

/// Per-dimension time spent by one call, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceMetrics {
    pub wait: f64,
    pub db: f64,
    pub http: f64,
    pub email: f64,
    #[serde(rename = "async")]
    pub async_: f64,
    pub compute: f64,
    pub total: f64,
}

impl TraceMetrics {
    #[must_use]
    pub fn get(&self, field: MetricField) -> f64 {
        match field {
            MetricField::Wait => self.wait,
            MetricField::Db => self.db,
            MetricField::Http => self.http,
            MetricField::Email => self.email,
            MetricField::Async => self.async_,
            MetricField::Compute => self.compute,
            MetricField::Total => self.total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One completed method invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodTrace {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    /// Error category the trace reports under (for example `method` or `sub`).
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub errored: bool,
    #[serde(default)]
    pub at: i64,
    #[serde(default)]
    pub events: Vec<TraceEvent>,
    #[serde(default)]
    pub metrics: TraceMetrics,
}

/// A server-side error as seen by the instrumentation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Exception {
    pub message: String,
    pub stack: Option<String>,
    /// Structured details some frameworks attach to their errors.
    pub details: Option<String>,
}

impl Exception {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Identity of the client connection that reported an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// An error reported by a client over its connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientError {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
    #[serde(default)]
    pub stacks: String,
    #[serde(default)]
    pub info: ClientInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_field_names() {
        let names: Vec<String> = MetricField::ALL.iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            vec!["wait", "db", "http", "email", "async", "compute", "total"]
        );
        assert_eq!(MetricField::parse("async"), Some(MetricField::Async));
        assert_eq!(MetricField::parse("cpu"), None);
    }

    #[test]
    fn test_trace_metrics_deserialize_partial() {
        let metrics: TraceMetrics =
            serde_json::from_str(r#"{"db": 12.5, "async": 3, "total": 20}"#).expect("parse");
        assert_eq!(metrics.get(MetricField::Db), 12.5);
        assert_eq!(metrics.get(MetricField::Async), 3.0);
        assert_eq!(metrics.get(MetricField::Wait), 0.0);
    }

    #[test]
    fn test_method_trace_wire_names() {
        let trace = MethodTrace {
            id: "t1".to_string(),
            name: "posts.insert".to_string(),
            kind: "method".to_string(),
            sub_type: Some("insert".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&trace).expect("serialize");
        assert_eq!(json["_id"], "t1");
        assert_eq!(json["type"], "method");
        assert_eq!(json["subType"], "insert");
        assert!(json.get("userId").is_none());
    }
}
