// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # Kadira Agent
//!
//! Telemetry aggregation and reliable delivery for the Kadira APM agent.
//!
//! ## Overview
//!
//! - [`models::errors`]: deduplicated, capped error tracking per flush epoch
//! - [`models::methods`]: per-minute method call metrics and trace sampling
//! - [`send`]: retry-with-backoff delivery over a pluggable [`send::transport::Transport`]
//! - [`scheduler`]: periodic flush of every model into the delivery channel
//! - [`agent`]: the context object that wires everything together
//!
//! Ingestion never fails from the caller's point of view. Delivery failures are reported to
//! the caller of [`send::DeliveryChannel::send`] only.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod config;
pub mod constants;
pub mod errors;
pub mod logger;
pub mod models;
pub mod scheduler;
pub mod send;
pub mod statsd;
pub mod time_bucket;
pub mod trace;
pub mod tracer_store;
