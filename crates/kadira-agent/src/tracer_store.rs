// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace sampling.
//!
//! Shipping every trace is too expensive, so [`TracerStore`] keeps the slowest trace of each
//! method per interval and archives it only when it is worth looking at: on every
//! `archive_every`-th interval of that method, or when its total time is an outlier against
//! the method's recent history (more than two standard deviations above the mean).

use crate::constants::{
    TRACER_STORE_ARCHIVE_EVERY, TRACER_STORE_INTERVAL, TRACER_STORE_MAX_TOTAL_POINTS,
};
use crate::trace::MethodTrace;
use fnv::FnvBuildHasher;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type FnvHashMap<K, V> = hashbrown::HashMap<K, V, FnvBuildHasher>;

pub trait TraceSampler: Send + Sync {
    /// Starts processing intervals in the background.
    fn start(&self);
    fn add_trace(&self, trace: &MethodTrace);
    /// Drains the archived traces.
    fn collect_traces(&self) -> Vec<MethodTrace>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TracerStoreOptions {
    pub interval: Duration,
    /// Interval maxima remembered per method.
    pub max_total_points: usize,
    pub archive_every: usize,
}

impl Default for TracerStoreOptions {
    fn default() -> Self {
        Self {
            interval: TRACER_STORE_INTERVAL,
            max_total_points: TRACER_STORE_MAX_TOTAL_POINTS,
            archive_every: TRACER_STORE_ARCHIVE_EVERY,
        }
    }
}

#[derive(Default)]
struct MethodHistory {
    current: Option<MethodTrace>,
    totals: VecDeque<f64>,
    processed: usize,
}

#[derive(Default)]
struct State {
    methods: FnvHashMap<String, MethodHistory>,
    archived: Vec<MethodTrace>,
}

pub struct TracerStore {
    options: TracerStoreOptions,
    state: Arc<Mutex<State>>,
    started: AtomicBool,
    cancel: CancellationToken,
}

impl TracerStore {
    #[must_use]
    pub fn new(options: TracerStoreOptions) -> Self {
        Self {
            options,
            state: Arc::new(Mutex::new(State::default())),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn options(&self) -> TracerStoreOptions {
        self.options
    }

    /// Closes the current interval of every method.
    pub fn process_traces(&self) {
        process(&self.state, &self.options);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    fn history_len(&self, method: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .methods
            .get(method)
            .map_or(0, |h| h.totals.len())
    }
}

impl Default for TracerStore {
    fn default() -> Self {
        Self::new(TracerStoreOptions::default())
    }
}

impl Drop for TracerStore {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl TraceSampler for TracerStore {
    fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No async runtime, trace intervals will only be processed on demand");
            self.started.store(false, Ordering::SeqCst);
            return;
        };

        let state: Weak<Mutex<State>> = Arc::downgrade(&self.state);
        let options = self.options;
        let cancel = self.cancel.clone();
        handle.spawn(async move {
            let mut interval = tokio::time::interval(options.interval);
            interval.tick().await; // discard first tick, which is instantaneous
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(state) = state.upgrade() else { break };
                        process(&state, &options);
                    }
                }
            }
        });
    }

    fn add_trace(&self, trace: &MethodTrace) {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        let history = state.methods.entry(trace.name.clone()).or_default();
        let slower = history
            .current
            .as_ref()
            .map_or(true, |current| trace.metrics.total > current.metrics.total);
        if slower {
            history.current = Some(trace.clone());
        }
    }

    fn collect_traces(&self) -> Vec<MethodTrace> {
        #[allow(clippy::expect_used)]
        let mut state = self.state.lock().expect("lock poisoned");
        std::mem::take(&mut state.archived)
    }
}

fn process(state: &Mutex<State>, options: &TracerStoreOptions) {
    #[allow(clippy::expect_used)]
    let mut state = state.lock().expect("lock poisoned");
    let State { methods, archived } = &mut *state;

    for (method, history) in methods.iter_mut() {
        let Some(trace) = history.current.take() else {
            continue;
        };
        let total = trace.metrics.total;
        let scheduled = options.archive_every > 0 && history.processed % options.archive_every == 0;
        let outlier = is_outlier(&history.totals, total);
        history.processed += 1;

        history.totals.push_back(total);
        while history.totals.len() > options.max_total_points {
            history.totals.pop_front();
        }

        if scheduled || outlier {
            debug!("Archiving trace of {method} (total={total}ms, outlier={outlier})");
            archived.push(trace);
        }
    }
}

fn is_outlier(history: &VecDeque<f64>, value: f64) -> bool {
    if history.len() < 2 {
        return false;
    }
    let n = history.len() as f64;
    let mean = history.iter().sum::<f64>() / n;
    let variance = history.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    value > mean + 2.0 * variance.sqrt()
}
