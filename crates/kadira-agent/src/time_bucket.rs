// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One-minute time buckets and the wall-clock source they are computed from.
//!
//! Bucket ids are computed from a server-synchronized clock rather than the local process
//! clock so that every host of a deployment assigns the same call to the same minute.

use crate::constants::BUCKET_MILLIS;
use derive_more::{Display, Into};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Start of a one-minute window, in milliseconds since the Unix epoch.
#[derive(Debug, Display, Into, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct BucketId(i64);

impl BucketId {
    #[must_use]
    pub fn start_millis(self) -> i64 {
        self.0
    }

    #[must_use]
    pub fn end_millis(self) -> i64 {
        self.0 + BUCKET_MILLIS
    }
}

/// Maps a timestamp (ms) to the bucket that contains it.
#[must_use]
pub fn bucket_id(timestamp_ms: i64) -> BucketId {
    BucketId(timestamp_ms.div_euclid(BUCKET_MILLIS) * BUCKET_MILLIS)
}

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        local_now_millis()
    }
}

fn local_now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Local clock corrected by an offset measured against the collection server.
#[derive(Debug, Default)]
pub struct SyncedClock {
    offset_ms: AtomicI64,
}

impl SyncedClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn offset_millis(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    pub fn set_offset_millis(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Relaxed);
    }

    /// Measures the offset against `<base_url>/simplentp/sync`, which answers with the
    /// server time in milliseconds as plain text. The clock keeps its previous offset when
    /// the request fails.
    pub async fn sync(
        &self,
        client: &reqwest::Client,
        base_url: &str,
    ) -> Result<i64, reqwest::Error> {
        let url = format!("{}/simplentp/sync", base_url.trim_end_matches('/'));
        let local_start = local_now_millis();
        let started = Instant::now();
        let body = client.get(&url).send().await?.error_for_status()?.text().await?;
        let rtt = i64::try_from(started.elapsed().as_millis()).unwrap_or(0);

        match body.trim().parse::<i64>() {
            Ok(server_time) => {
                let offset = server_time - (local_start + rtt / 2);
                self.set_offset_millis(offset);
                debug!("Synced clock with {url}: offset={offset}ms rtt={rtt}ms");
            }
            Err(e) => debug!("Ignoring invalid time sync response {body:?}: {e}"),
        }
        Ok(self.offset_millis())
    }
}

impl Clock for SyncedClock {
    fn now_millis(&self) -> i64 {
        local_now_millis() + self.offset_millis()
    }
}

/// A clock that only moves when told to. Used by hosts replaying recorded traffic and by
/// tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    #[must_use]
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn advance(&self, by_ms: i64) {
        self.now_ms.fetch_add(by_ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now_ms.load(Ordering::Relaxed)
    }
}
