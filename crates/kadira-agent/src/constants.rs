// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Method names under this prefix belong to the agent itself and are never measured.
pub const RESERVED_METHOD_PREFIX: &str = "kadira";

// Metric names forwarded to the DogStatsD agent
pub const ERRORS_METRIC: &str = "kadira.errors";
pub const METHOD_ERRORS_METRIC: &str = "kadira.method.errors";
pub const METHOD_CALLS_METRIC: &str = "kadira.method.calls";
pub const METHOD_TIME_METRIC_PREFIX: &str = "kadira.method.time.";

// Delivery paths
pub const ERRORS_PATH: &str = "/errors";
pub const METRICS_PATH: &str = "/metrics";

/// Bucket width for method metrics.
pub const BUCKET_MILLIS: i64 = 60 * 1000;

pub const DEFAULT_MAX_ERRORS: usize = 10;

// Delivery retry policy
pub const MAX_SEND_ATTEMPTS: u32 = 5;
pub const RETRY_MIN_COUNT: u32 = 1;
pub const RETRY_MIN_TIMEOUT: Duration = Duration::from_millis(0);
pub const RETRY_BASE_TIMEOUT: Duration = Duration::from_millis(5 * 1000);
pub const RETRY_MAX_TIMEOUT: Duration = Duration::from_millis(60 * 1000);
pub const RETRY_EXPONENT: f64 = 2.2;

// Trace sampling store
pub const TRACER_STORE_INTERVAL: Duration = Duration::from_secs(60);
pub const TRACER_STORE_MAX_TOTAL_POINTS: usize = 30;
pub const TRACER_STORE_ARCHIVE_EVERY: usize = 5;
