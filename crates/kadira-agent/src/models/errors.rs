// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error tracking.
//!
//! Errors are deduplicated by `<trace type>:<message>` within one flush epoch. The first
//! occurrence keeps its stack and trace, later ones only bump the count. At most
//! `max_errors` distinct errors are kept per epoch; every occurrence is still logged and
//! counted in `kadira.errors`.

use super::{Model, ModelContext, Payload};
use crate::constants::{DEFAULT_MAX_ERRORS, ERRORS_METRIC, ERRORS_PATH};
use crate::log_fields;
use crate::trace::{ClientError, ConnectionContext, Exception, MethodTrace};
use fnv::FnvBuildHasher;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{debug, warn};

type FnvHashMap<K, V> = hashbrown::HashMap<K, V, FnvBuildHasher>;

/// Decides whether an error is kept: `(type, name, exception, sub_type) -> keep`.
pub type ErrorFilter = Box<dyn Fn(&str, &str, &Exception, &str) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StackEntry {
    pub stack: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedError {
    pub app_id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub start_time: i64,
    pub sub_type: String,
    pub trace: MethodTrace,
    pub stacks: Vec<StackEntry>,
    pub count: u64,
}

#[derive(Default)]
struct Epoch {
    errors: FnvHashMap<String, TrackedError>,
    /// Latest formatted stack per trace id, written into the trace when the epoch is flushed.
    trace_stacks: FnvHashMap<String, String>,
}

pub struct ErrorModel {
    app_id: Option<String>,
    max_errors: usize,
    tracking_enabled: bool,
    ctx: ModelContext,
    filters: Mutex<Vec<Arc<ErrorFilter>>>,
    epoch: Mutex<Epoch>,
}

impl ErrorModel {
    #[must_use]
    pub fn new(app_id: Option<String>, ctx: ModelContext) -> Self {
        Self {
            app_id,
            max_errors: DEFAULT_MAX_ERRORS,
            tracking_enabled: true,
            ctx,
            filters: Mutex::new(Vec::new()),
            epoch: Mutex::new(Epoch::default()),
        }
    }

    #[must_use]
    pub fn with_max_errors(mut self, max_errors: usize) -> Self {
        self.max_errors = max_errors;
        self
    }

    /// With tracking disabled errors are only logged and counted.
    #[must_use]
    pub fn with_tracking_enabled(mut self, enabled: bool) -> Self {
        self.tracking_enabled = enabled;
        self
    }

    pub fn add_filter(&self, filter: ErrorFilter) {
        self.filters().push(Arc::new(filter));
    }

    pub fn clear_filters(&self) {
        self.filters().clear();
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.epoch().errors.len()
    }

    // Ingestion locks recover from poisoning so a panic elsewhere never reaches the caller.
    fn epoch(&self) -> MutexGuard<'_, Epoch> {
        self.epoch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn filters(&self) -> MutexGuard<'_, Vec<Arc<ErrorFilter>>> {
        self.filters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn track_error(&self, exception: &Exception, trace: &MethodTrace) {
        self.ctx.logger.error(
            &exception.message,
            log_fields! {
                "stack" => exception.stack,
                "user_id" => trace.user_id,
                "session_id" => trace.session,
                "error_type" => trace.kind,
                "error_subtype" => trace.sub_type,
            },
        );
        self.ctx
            .metrics
            .increment(ERRORS_METRIC, 1, &[format!("error_type:{}", trace.kind)]);

        if !self.tracking_enabled {
            return;
        }

        let key = format!("{}:{}", trace.kind, exception.message);
        if !self.count_or_admit(&mut self.epoch(), &key) {
            return;
        }

        // Formatting and filters run unlocked; the epoch is re-checked before inserting.
        let tracked = self.format_error(exception, trace);
        if !self.apply_filters(&tracked.kind, &tracked.name, exception, &tracked.sub_type) {
            debug!("Error {key} filtered out");
            return;
        }

        let mut epoch = self.epoch();
        if !self.count_or_admit(&mut epoch, &key) {
            return;
        }
        if let Some(entry) = tracked.stacks.first() {
            epoch
                .trace_stacks
                .insert(trace.id.clone(), entry.stack.clone());
        }
        epoch.errors.insert(key, tracked);
    }

    /// Bumps the count of an already tracked `key`. Returns whether a new error under `key`
    /// may still be tracked in this epoch.
    fn count_or_admit(&self, epoch: &mut Epoch, key: &str) -> bool {
        if let Some(tracked) = epoch.errors.get_mut(key) {
            tracked.count += 1;
            return false;
        }
        if epoch.errors.len() >= self.max_errors {
            debug!("Error limit of {} reached, dropping {key}", self.max_errors);
            return false;
        }
        true
    }

    /// Errors reported by clients are logged and counted but never tracked.
    pub fn track_client_error(&self, connection: Option<&ConnectionContext>, error: &ClientError) {
        self.ctx.logger.error(
            &error.name,
            log_fields! {
                "stack" => error.stacks,
                "user_id" => error.info.user_id,
                "error_type" => error.kind,
                "error_subtype" => error.sub_type,
                "client_info" => error.info,
                "session_id" => connection.map(|c| c.id.clone()),
            },
        );
        self.ctx
            .metrics
            .increment(ERRORS_METRIC, 1, &[format!("error_type:{}", error.kind)]);
    }

    fn format_error(&self, exception: &Exception, trace: &MethodTrace) -> TrackedError {
        let mut stack = exception.stack.clone().unwrap_or_default();
        if let Some(details) = &exception.details {
            stack = format!("Details: {details}\r\n{stack}");
        }

        TrackedError {
            app_id: self.app_id.clone(),
            name: exception.message.clone(),
            kind: trace.kind.clone(),
            start_time: self.ctx.clock.now_millis(),
            sub_type: trace
                .sub_type
                .clone()
                .unwrap_or_else(|| trace.name.clone()),
            trace: trace.clone(),
            stacks: vec![StackEntry { stack }],
            count: 1,
        }
    }

    /// A panicking filter drops the error.
    fn apply_filters(&self, kind: &str, name: &str, exception: &Exception, sub_type: &str) -> bool {
        let filters: Vec<Arc<ErrorFilter>> = self.filters().clone();
        filters.iter().all(|filter| {
            panic::catch_unwind(AssertUnwindSafe(|| (**filter)(kind, name, exception, sub_type)))
                .unwrap_or_else(|_| {
                    warn!("Error filter panicked on {kind}:{name}, dropping the error");
                    false
                })
        })
    }
}

impl Model for ErrorModel {
    fn name(&self) -> &'static str {
        "errors"
    }

    fn send_periodic_metrics(&self) -> Option<Payload> {
        let epoch = std::mem::take(&mut *self.epoch());
        if epoch.errors.is_empty() {
            return None;
        }

        let mut errors: Vec<TrackedError> = epoch.errors.into_values().collect();
        errors.sort_by(|a, b| {
            (a.start_time, &a.kind, &a.name).cmp(&(b.start_time, &b.kind, &b.name))
        });
        for error in &mut errors {
            if let Some(stack) = epoch.trace_stacks.get(&error.trace.id) {
                attach_stack(&mut error.trace, stack);
            }
        }

        match serde_json::to_value(&errors) {
            Ok(body) => Some(Payload {
                path: ERRORS_PATH,
                body,
            }),
            Err(e) => {
                debug!("Dropping {} tracked errors: {e}", errors.len());
                None
            }
        }
    }
}

/// Writes `stack` into the error object of the trace's last event, if it has one.
fn attach_stack(trace: &mut MethodTrace, stack: &str) {
    let error = trace
        .events
        .last_mut()
        .and_then(|event| event.data.as_mut())
        .and_then(|data| data.get_mut("error"))
        .and_then(Value::as_object_mut);
    if let Some(error) = error {
        error.insert("stack".to_string(), Value::String(stack.to_string()));
    }
}

/// Drops argument validation failures.
#[must_use]
pub fn filter_validation_errors() -> ErrorFilter {
    Box::new(|_kind, name, _exception, _sub_type| !name.starts_with("Match error"))
}

fn common_error_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)connection timeout\. no (\w*) heartbeat received",
            r"(?i)INVALID_STATE_ERR",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

/// Drops connection noise that says nothing about the application.
#[must_use]
pub fn filter_common_errors() -> ErrorFilter {
    Box::new(|_kind, name, _exception, _sub_type| {
        !common_error_patterns()
            .iter()
            .any(|pattern| pattern.is_match(name))
    })
}
