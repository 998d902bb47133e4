// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::{
    MAX_SEND_ATTEMPTS, RETRY_BASE_TIMEOUT, RETRY_EXPONENT, RETRY_MAX_TIMEOUT, RETRY_MIN_COUNT,
    RETRY_MIN_TIMEOUT,
};
use std::time::Duration;

/// Delay schedule for delivery attempts.
///
/// Attempts numbered below `min_count` wait `min_timeout`. Later attempts wait
/// `base_timeout * exponent^(attempt - min_count)`, capped at `max_timeout`, so the delay
/// never decreases from one attempt to the next.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_count: u32,
    pub min_timeout: Duration,
    pub base_timeout: Duration,
    pub max_timeout: Duration,
    pub exponent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_SEND_ATTEMPTS,
            min_count: RETRY_MIN_COUNT,
            min_timeout: RETRY_MIN_TIMEOUT,
            base_timeout: RETRY_BASE_TIMEOUT,
            max_timeout: RETRY_MAX_TIMEOUT,
            exponent: RETRY_EXPONENT,
        }
    }
}

impl RetryPolicy {
    /// Policy that never waits. Meant for hosts that do their own pacing.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            min_count: max_attempts,
            min_timeout: Duration::ZERO,
            base_timeout: Duration::ZERO,
            max_timeout: Duration::ZERO,
            exponent: 1.0,
        }
    }

    /// Delay before attempt number `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt < self.min_count {
            return self.min_timeout.min(self.max_timeout);
        }
        let steps = i32::try_from(attempt - self.min_count).unwrap_or(i32::MAX);
        let millis = self.base_timeout.as_millis() as f64 * self.exponent.powi(steps);
        let capped = millis.min(self.max_timeout.as_millis() as f64);
        Duration::from_millis(capped as u64)
            .max(self.min_timeout)
            .min(self.max_timeout)
    }
}
