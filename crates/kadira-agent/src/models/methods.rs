// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Method call metrics, aggregated per minute and per method.
//!
//! Buckets live behind two levels of locks: the outer map lock is held only to find or
//! create a bucket and take its lock, the write itself only holds the bucket's lock. A flush
//! detaches every matured bucket from the map before reading it, so each write lands in
//! exactly one flush.

use super::{Model, ModelContext, Payload};
use crate::constants::{
    METHOD_CALLS_METRIC, METHOD_ERRORS_METRIC, METHOD_TIME_METRIC_PREFIX, METRICS_PATH,
    RESERVED_METHOD_PREFIX,
};
use crate::log_fields;
use crate::time_bucket::BucketId;
use crate::trace::{MethodTrace, MetricField};
use crate::tracer_store::{TraceSampler, TracerStore};
use fnv::FnvBuildHasher;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;
use ustr::Ustr;

type FnvHashMap<K, V> = hashbrown::HashMap<K, V, FnvBuildHasher>;

/// Per-field limits in milliseconds above which a call counts as slow.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds([f64; 7]);

impl Default for Thresholds {
    fn default() -> Self {
        let mut limits = [0.0; 7];
        for field in MetricField::ALL {
            limits[field.index()] = match field {
                MetricField::Http => 1000.0,
                MetricField::Total => 200.0,
                _ => 100.0,
            };
        }
        Self(limits)
    }
}

impl Thresholds {
    #[must_use]
    pub fn with(mut self, field: MetricField, limit_ms: f64) -> Self {
        self.0[field.index()] = limit_ms;
        self
    }

    #[must_use]
    pub fn get(&self, field: MetricField) -> f64 {
        self.0[field.index()]
    }

    #[must_use]
    pub fn is_slow(&self, field: MetricField, elapsed_ms: f64) -> bool {
        elapsed_ms > self.get(field)
    }
}

/// Counters of one method within one bucket. Timings are totals while aggregating and
/// per-call averages once flushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MethodMetrics {
    pub count: u64,
    pub errors: u64,
    pub fetched_doc_size: u64,
    pub sent_msg_size: u64,
    pub wait: f64,
    pub db: f64,
    pub http: f64,
    pub email: f64,
    #[serde(rename = "async")]
    pub async_: f64,
    pub compute: f64,
    pub total: f64,
}

impl MethodMetrics {
    #[must_use]
    pub fn timing(&self, field: MetricField) -> f64 {
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

    fn timing_mut(&mut self, field: MetricField) -> &mut f64 {
        match field {
            MetricField::Wait => &mut self.wait,
            MetricField::Db => &mut self.db,
            MetricField::Http => &mut self.http,
            MetricField::Email => &mut self.email,
            MetricField::Async => &mut self.async_,
            MetricField::Compute => &mut self.compute,
            MetricField::Total => &mut self.total,
        }
    }

    fn averaged(mut self) -> Self {
        if self.count > 0 {
            let count = self.count as f64;
            for field in MetricField::ALL {
                *self.timing_mut(field) /= count;
            }
        }
        self
    }
}

#[derive(Default)]
struct MethodBucket {
    methods: FnvHashMap<Ustr, MethodMetrics>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BucketPayload {
    start_time: i64,
    end_time: i64,
    methods: BTreeMap<String, MethodMetrics>,
}

pub struct MethodsModel {
    ctx: ModelContext,
    thresholds: Thresholds,
    timing_sample_rate: f64,
    buckets: Mutex<BTreeMap<BucketId, Arc<Mutex<MethodBucket>>>>,
    max_event_times: Mutex<FnvHashMap<Ustr, [f64; 7]>>,
    tracer_store: Arc<dyn TraceSampler>,
}

impl MethodsModel {
    /// Creates the model with a started [`TracerStore`].
    #[must_use]
    pub fn new(ctx: ModelContext) -> Self {
        let tracer_store: Arc<dyn TraceSampler> = Arc::new(TracerStore::default());
        tracer_store.start();
        Self {
            ctx,
            thresholds: Thresholds::default(),
            timing_sample_rate: 1.0,
            buckets: Mutex::new(BTreeMap::new()),
            max_event_times: Mutex::new(FnvHashMap::default()),
            tracer_store,
        }
    }

    #[must_use]
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    #[must_use]
    pub fn with_timing_sample_rate(mut self, sample_rate: f64) -> Self {
        self.timing_sample_rate = sample_rate;
        self
    }

    #[must_use]
    pub fn with_tracer_store(mut self, tracer_store: Arc<dyn TraceSampler>) -> Self {
        tracer_store.start();
        self.tracer_store = tracer_store;
        self
    }

    /// Starts background trace sampling. Calling it again has no effect.
    pub fn start_sampling(&self) {
        self.tracer_store.start();
    }

    #[must_use]
    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn process_method(&self, trace: &MethodTrace) {
        if trace.name.starts_with(RESERVED_METHOD_PREFIX) {
            return;
        }

        let tags = [format!("method:{}", trace.name)];
        let metrics = self.ctx.metrics.as_ref();
        if trace.errored {
            metrics.increment(METHOD_ERRORS_METRIC, 1, &tags);
        }
        metrics.increment(METHOD_CALLS_METRIC, 1, &tags);
        for field in [
            MetricField::Compute,
            MetricField::Db,
            MetricField::Http,
            MetricField::Wait,
            MetricField::Async,
            MetricField::Total,
        ] {
            metrics.timing(
                &format!("{METHOD_TIME_METRIC_PREFIX}{field}"),
                trace.metrics.get(field),
                self.timing_sample_rate,
                &tags,
            );
        }

        self.ctx.logger.info(
            "method call",
            log_fields! {
                "compute_time" => trace.metrics.compute,
                "db_time" => trace.metrics.db,
                "http_time" => trace.metrics.http,
                "wait_time" => trace.metrics.wait,
                "total_time" => trace.metrics.total,
                "user_id" => trace.user_id,
                "session_id" => trace.session,
                "method" => trace.name,
            },
        );

        let bucket = self.get_bucket_id(self.ctx.clock.now_millis());
        self.with_metrics(bucket, &trace.name, |m| {
            m.count += 1;
            if trace.errored {
                m.errors += 1;
            }
            for field in MetricField::ALL {
                *m.timing_mut(field) += trace.metrics.get(field);
            }
        });
        self.update_max_event_times(trace);
        self.tracer_store.add_trace(trace);
    }

    pub fn track_doc_size(&self, method: &str, size: u64) {
        let bucket = self.get_bucket_id(self.ctx.clock.now_millis());
        self.with_metrics(bucket, method, |m| m.fetched_doc_size += size);
    }

    pub fn track_msg_size(&self, method: &str, size: u64) {
        let bucket = self.get_bucket_id(self.ctx.clock.now_millis());
        self.with_metrics(bucket, method, |m| m.sent_msg_size += size);
    }

    /// Returns the metrics of `method` in `bucket`, creating a zeroed entry on first use.
    #[must_use]
    pub fn get_metrics(&self, bucket: BucketId, method: &str) -> MethodMetrics {
        self.with_metrics(bucket, method, |m| *m)
    }

    /// Slowest value seen for `field` of `method` since the model was created.
    #[must_use]
    pub fn max_event_time(&self, method: &str, field: MetricField) -> Option<f64> {
        #[allow(clippy::expect_used)]
        let max = self.max_event_times.lock().expect("lock poisoned");
        max.get(&Ustr::from(method)).map(|times| times[field.index()])
    }

    fn with_metrics<T>(
        &self,
        bucket_id: BucketId,
        method: &str,
        f: impl FnOnce(&mut MethodMetrics) -> T,
    ) -> T {
        #[allow(clippy::expect_used)]
        let mut buckets = self.buckets.lock().expect("lock poisoned");
        let bucket = Arc::clone(buckets.entry(bucket_id).or_default());
        // Take the bucket lock before releasing the map so a concurrent flush that detaches
        // this bucket waits for the write.
        #[allow(clippy::expect_used)]
        let mut guard = bucket.lock().expect("lock poisoned");
        drop(buckets);
        f(guard.methods.entry(Ustr::from(method)).or_default())
    }

    fn update_max_event_times(&self, trace: &MethodTrace) {
        #[allow(clippy::expect_used)]
        let mut max = self.max_event_times.lock().expect("lock poisoned");
        let times = max.entry(Ustr::from(trace.name.as_str())).or_insert([0.0; 7]);
        for field in MetricField::ALL {
            let value = trace.metrics.get(field);
            if value > times[field.index()] {
                times[field.index()] = value;
            }
        }
    }

    fn build_payload(
        &self,
        buckets: BTreeMap<BucketId, Arc<Mutex<MethodBucket>>>,
    ) -> Option<Payload> {
        let method_metrics: Vec<BucketPayload> = buckets
            .into_iter()
            .map(|(id, bucket)| {
                #[allow(clippy::expect_used)]
                let bucket = bucket.lock().expect("lock poisoned");
                BucketPayload {
                    start_time: id.start_millis(),
                    end_time: id.end_millis(),
                    methods: bucket
                        .methods
                        .iter()
                        .map(|(name, metrics)| (name.to_string(), metrics.averaged()))
                        .collect(),
                }
            })
            .collect();
        let method_requests = self.tracer_store.collect_traces();

        if method_metrics.is_empty() && method_requests.is_empty() {
            return None;
        }
        debug!(
            "Flushing {} method buckets and {} traces",
            method_metrics.len(),
            method_requests.len()
        );
        Some(Payload {
            path: METRICS_PATH,
            body: json!({
                "methodMetrics": method_metrics,
                "methodRequests": method_requests,
            }),
        })
    }
}

impl Model for MethodsModel {
    fn name(&self) -> &'static str {
        "methods"
    }

    /// Ships every bucket older than the current minute.
    fn send_periodic_metrics(&self) -> Option<Payload> {
        let current = self.get_bucket_id(self.ctx.clock.now_millis());
        let matured = {
            #[allow(clippy::expect_used)]
            let mut buckets = self.buckets.lock().expect("lock poisoned");
            let pending = buckets.split_off(&current);
            std::mem::replace(&mut *buckets, pending)
        };
        self.build_payload(matured)
    }

    fn flush_all(&self) -> Option<Payload> {
        let all = {
            #[allow(clippy::expect_used)]
            let mut buckets = self.buckets.lock().expect("lock poisoned");
            std::mem::take(&mut *buckets)
        };
        self.build_payload(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::{Harness, Recorded};
    use crate::time_bucket::bucket_id;
    use crate::trace::TraceMetrics;
    use crate::tracer_store::TracerStoreOptions;

    // 2023-11-14T22:13:00Z
    const MINUTE: i64 = 1_699_999_980_000;

    fn trace(name: &str, db: f64, total: f64, errored: bool) -> MethodTrace {
        MethodTrace {
            id: format!("{name}-{total}"),
            name: name.to_string(),
            kind: "method".to_string(),
            errored,
            metrics: TraceMetrics {
                db,
                compute: total - db,
                total,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn model(harness: &Harness) -> MethodsModel {
        MethodsModel::new(harness.context())
    }

    #[test]
    fn test_reserved_methods_are_skipped() {
        let harness = Harness::new(MINUTE);
        let model = model(&harness);
        model.process_method(&trace("kadira.ping", 1.0, 2.0, true));

        assert!(harness.metrics.recorded().is_empty());
        assert!(harness.logger.lines().is_empty());
        assert!(model.flush_all().is_none());
    }

    #[test]
    fn test_process_method_emits_counters_and_timings() {
        let harness = Harness::new(MINUTE);
        let model = model(&harness).with_timing_sample_rate(0.5);
        model.process_method(&trace("posts.insert", 12.5, 20.0, true));

        let tags = vec!["method:posts.insert".to_string()];
        let recorded = harness.metrics.recorded();
        assert_eq!(
            recorded[0],
            Recorded::Increment {
                name: "kadira.method.errors".to_string(),
                value: 1,
                tags: tags.clone()
            }
        );
        assert_eq!(
            recorded[1],
            Recorded::Increment {
                name: "kadira.method.calls".to_string(),
                value: 1,
                tags: tags.clone()
            }
        );
        let timings: Vec<(String, f64)> = recorded[2..]
            .iter()
            .map(|r| match r {
                Recorded::Timing { name, value, rate, tags: t } => {
                    assert_eq!(*rate, 0.5);
                    assert_eq!(t, &tags);
                    (name.clone(), *value)
                }
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            timings,
            vec![
                ("kadira.method.time.compute".to_string(), 7.5),
                ("kadira.method.time.db".to_string(), 12.5),
                ("kadira.method.time.http".to_string(), 0.0),
                ("kadira.method.time.wait".to_string(), 0.0),
                ("kadira.method.time.async".to_string(), 0.0),
                ("kadira.method.time.total".to_string(), 20.0),
            ]
        );
    }

    #[test]
    fn test_successful_call_has_no_error_counter() {
        let harness = Harness::new(MINUTE);
        let model = model(&harness);
        model.process_method(&trace("posts.insert", 1.0, 2.0, false));
        assert_eq!(harness.metrics.increments_of("kadira.method.errors"), 0);
        assert_eq!(harness.metrics.increments_of("kadira.method.calls"), 1);
    }

    #[test]
    fn test_method_call_log_line() {
        let harness = Harness::new(MINUTE);
        let model = model(&harness);
        let mut t = trace("posts.insert", 12.5, 20.0, false);
        t.user_id = Some("u1".to_string());
        t.session = Some("s1".to_string());
        model.process_method(&t);

        let lines = harness.logger.lines();
        assert_eq!(lines.len(), 1);
        let (level, message, fields) = &lines[0];
        assert_eq!(level, "info");
        assert_eq!(message, "method call");
        assert_eq!(fields["db_time"], 12.5);
        assert_eq!(fields["compute_time"], 7.5);
        assert_eq!(fields["total_time"], 20.0);
        assert_eq!(fields["user_id"], "u1");
        assert_eq!(fields["session_id"], "s1");
        assert_eq!(fields["method"], "posts.insert");
    }

    #[test]
    fn test_get_metrics_is_idempotent() {
        let harness = Harness::new(MINUTE);
        let model = model(&harness);
        let bucket = bucket_id(MINUTE);

        let first = model.get_metrics(bucket, "posts.insert");
        let second = model.get_metrics(bucket, "posts.insert");
        assert_eq!(first, MethodMetrics::default());
        assert_eq!(first, second);

        model.track_doc_size("posts.insert", 512);
        assert_eq!(model.get_metrics(bucket, "posts.insert").fetched_doc_size, 512);

        let payload = model.flush_all().expect("payload");
        let methods = payload.body["methodMetrics"][0]["methods"]
            .as_object()
            .expect("methods");
        assert_eq!(methods.len(), 1);
    }

    #[test]
    fn test_sizes_accumulate_in_current_bucket() {
        let harness = Harness::new(MINUTE + 5_000);
        let model = model(&harness);
        model.track_doc_size("posts.list", 100);
        model.track_doc_size("posts.list", 50);
        model.track_msg_size("posts.list", 20);

        let metrics = model.get_metrics(bucket_id(MINUTE), "posts.list");
        assert_eq!(metrics.fetched_doc_size, 150);
        assert_eq!(metrics.sent_msg_size, 20);
        assert_eq!(metrics.count, 0);
    }

    #[test]
    fn test_flush_ships_only_matured_buckets_with_averages() {
        let harness = Harness::new(MINUTE + 1_000);
        let model = model(&harness);
        model.process_method(&trace("posts.insert", 10.0, 20.0, false));
        model.process_method(&trace("posts.insert", 30.0, 40.0, true));

        // Still the same minute: nothing has matured.
        assert!(model.send_periodic_metrics().is_none());

        harness.clock.advance(60_000);
        model.process_method(&trace("posts.insert", 1.0, 1.0, false));

        let payload = model.send_periodic_metrics().expect("payload");
        assert_eq!(payload.path, "/metrics");
        let buckets = payload.body["methodMetrics"].as_array().expect("buckets");
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0]["startTime"], MINUTE);
        assert_eq!(buckets[0]["endTime"], MINUTE + 60_000);
        let insert = &buckets[0]["methods"]["posts.insert"];
        assert_eq!(insert["count"], 2);
        assert_eq!(insert["errors"], 1);
        assert_eq!(insert["db"], 20.0);
        assert_eq!(insert["total"], 30.0);
        assert_eq!(insert["async"], 0.0);
        assert_eq!(insert["fetchedDocSize"], 0);

        // The current minute is kept until shutdown.
        let remaining = model.flush_all().expect("payload");
        assert_eq!(
            remaining.body["methodMetrics"][0]["startTime"],
            MINUTE + 60_000
        );
        assert!(model.flush_all().is_none());
    }

    #[test]
    fn test_max_event_times() {
        let harness = Harness::new(MINUTE);
        let model = model(&harness);
        assert_eq!(model.max_event_time("posts.insert", MetricField::Db), None);

        model.process_method(&trace("posts.insert", 10.0, 20.0, false));
        model.process_method(&trace("posts.insert", 30.0, 35.0, false));
        model.process_method(&trace("posts.insert", 5.0, 50.0, false));

        assert_eq!(model.max_event_time("posts.insert", MetricField::Db), Some(30.0));
        assert_eq!(model.max_event_time("posts.insert", MetricField::Total), Some(50.0));
        assert_eq!(model.max_event_time("posts.insert", MetricField::Http), Some(0.0));
    }

    #[test]
    fn test_thresholds() {
        let defaults = Thresholds::default();
        let expected = [
            (MetricField::Wait, 100.0),
            (MetricField::Db, 100.0),
            (MetricField::Http, 1000.0),
            (MetricField::Email, 100.0),
            (MetricField::Async, 100.0),
            (MetricField::Compute, 100.0),
            (MetricField::Total, 200.0),
        ];
        for (field, limit) in expected {
            assert_eq!(defaults.get(field), limit, "{field}");
        }
        assert!(defaults.is_slow(MetricField::Total, 200.5));
        assert!(!defaults.is_slow(MetricField::Total, 200.0));

        let harness = Harness::new(MINUTE);
        let model = model(&harness).with_thresholds(defaults.with(MetricField::Db, 250.0));
        assert_eq!(model.thresholds().get(MetricField::Db), 250.0);
        assert_eq!(model.thresholds().get(MetricField::Http), 1000.0);
    }

    #[test]
    fn test_sampled_traces_are_shipped_as_requests() {
        let harness = Harness::new(MINUTE);
        let store = Arc::new(TracerStore::new(TracerStoreOptions::default()));
        let model = model(&harness).with_tracer_store(store.clone());

        model.process_method(&trace("posts.insert", 10.0, 20.0, false));
        model.process_method(&trace("posts.insert", 10.0, 90.0, false));
        store.process_traces();

        let payload = model.flush_all().expect("payload");
        let requests = payload.body["methodRequests"].as_array().expect("requests");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0]["metrics"]["total"], 90.0);
    }

    #[test]
    fn test_concurrent_writes_land_in_exactly_one_flush() {
        let harness = Harness::new(MINUTE);
        let model = Arc::new(model(&harness));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let model = Arc::clone(&model);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        model.process_method(&trace("posts.insert", 1.0, 2.0, false));
                    }
                })
            })
            .collect();

        let mut flushed = 0;
        for _ in 0..20 {
            harness.clock.advance(60_000);
            if let Some(payload) = model.send_periodic_metrics() {
                for bucket in payload.body["methodMetrics"].as_array().expect("buckets") {
                    flushed += bucket["methods"]["posts.insert"]["count"]
                        .as_u64()
                        .unwrap_or(0);
                }
            }
        }
        for t in threads {
            t.join().expect("writer");
        }
        if let Some(payload) = model.flush_all() {
            for bucket in payload.body["methodMetrics"].as_array().expect("buckets") {
                flushed += bucket["methods"]["posts.insert"]["count"]
                    .as_u64()
                    .unwrap_or(0);
            }
        }
        assert_eq!(flushed, 8 * 500);
    }
}
