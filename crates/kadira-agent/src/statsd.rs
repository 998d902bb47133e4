// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Metrics forwarding to a local DogStatsD agent.
//!
//! Datagrams use the DogStatsD text protocol:
//!
//! ```text
//! kadira.method.calls:1|c|#method:posts.insert
//! kadira.method.time.db:12.5|ms|@0.5|#method:posts.insert
//! ```
//!
//! Sending is fire-and-forget. A datagram that cannot be sent is logged at debug level and
//! dropped, so forwarding never affects the instrumented call path.

use std::fmt::Write as _;
use std::net::UdpSocket;
use tracing::debug;

pub trait MetricsClient: Send + Sync {
    fn increment(&self, name: &str, value: i64, tags: &[String]);
    fn timing(&self, name: &str, value: f64, sample_rate: f64, tags: &[String]);
}

/// Forwards nothing. Used when no DogStatsD agent is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricsClient;

impl MetricsClient for NoopMetricsClient {
    fn increment(&self, _name: &str, _value: i64, _tags: &[String]) {}
    fn timing(&self, _name: &str, _value: f64, _sample_rate: f64, _tags: &[String]) {}
}

#[derive(Debug)]
pub struct DogStatsdClient {
    socket: UdpSocket,
}

impl DogStatsdClient {
    pub fn new(host: &str, port: u16) -> std::io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        socket.connect((host, port))?;
        debug!("Forwarding metrics to DogStatsD at {host}:{port}");
        Ok(Self { socket })
    }

    fn send(&self, datagram: &str) {
        if let Err(e) = self.socket.send(datagram.as_bytes()) {
            debug!("Dropping metric {datagram:?}: {e}");
        }
    }
}

impl MetricsClient for DogStatsdClient {
    fn increment(&self, name: &str, value: i64, tags: &[String]) {
        self.send(&format_datagram(name, &value.to_string(), "c", 1.0, tags));
    }

    fn timing(&self, name: &str, value: f64, sample_rate: f64, tags: &[String]) {
        if sample_rate < 1.0 && rand::random::<f64>() >= sample_rate {
            return;
        }
        self.send(&format_datagram(name, &value.to_string(), "ms", sample_rate, tags));
    }
}

pub(crate) fn format_datagram(
    name: &str,
    value: &str,
    metric_type: &str,
    sample_rate: f64,
    tags: &[String],
) -> String {
    let mut datagram = format!("{name}:{value}|{metric_type}");
    if sample_rate < 1.0 {
        let _ = write!(datagram, "|@{sample_rate}");
    }
    if !tags.is_empty() {
        let _ = write!(datagram, "|#{}", tags.join(","));
    }
    datagram
}
