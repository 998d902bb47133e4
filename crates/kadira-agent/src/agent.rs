// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The agent context: one value owning the configuration, the collaborators, both models and
//! the flush loops. Hosts create one per process and pass it where instrumentation needs it.

use crate::config::Config;
use crate::errors::TransportError;
use crate::logger::{EventLogger, TracingLogger};
use crate::models::errors::ErrorModel;
use crate::models::methods::MethodsModel;
use crate::models::{Model, ModelContext};
use crate::scheduler::{Scheduler, SchedulerHandle};
use crate::send::DeliveryChannel;
use crate::statsd::{DogStatsdClient, MetricsClient, NoopMetricsClient};
use crate::time_bucket::{Clock, SyncedClock};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Agent {
    config: Config,
    clock: Arc<SyncedClock>,
    channel: DeliveryChannel,
    errors: Arc<ErrorModel>,
    methods: Arc<MethodsModel>,
    cancel: CancellationToken,
    scheduler: Option<SchedulerHandle>,
}

impl Agent {
    /// Builds the agent from `config` with the production collaborators: a server-synced
    /// clock, `tracing` event logs and DogStatsD forwarding when an agent host is configured.
    pub fn new(config: Config) -> Result<Self, TransportError> {
        let metrics: Arc<dyn MetricsClient> = match &config.datadog_agent_host {
            Some(host) => match DogStatsdClient::new(host, config.datadog_agent_port) {
                Ok(client) => Arc::new(client),
                Err(e) => {
                    warn!("Metrics forwarding disabled, cannot reach DogStatsD at {host}: {e}");
                    Arc::new(NoopMetricsClient)
                }
            },
            None => Arc::new(NoopMetricsClient),
        };
        let logger: Arc<dyn EventLogger> = Arc::new(TracingLogger);
        let channel = DeliveryChannel::from_config(&config)?;
        Ok(Self::with_parts(config, logger, metrics, channel))
    }

    /// Builds the agent around caller-provided collaborators.
    #[must_use]
    pub fn with_parts(
        config: Config,
        logger: Arc<dyn EventLogger>,
        metrics: Arc<dyn MetricsClient>,
        channel: DeliveryChannel,
    ) -> Self {
        let clock = Arc::new(SyncedClock::new());
        let cancel = CancellationToken::new();
        let channel = channel.with_cancellation(cancel.clone());
        let ctx = ModelContext {
            clock: clock.clone() as Arc<dyn Clock>,
            logger,
            metrics,
        };

        let errors = ErrorModel::new(config.app_id.clone(), ctx.clone())
            .with_max_errors(config.max_errors_per_interval)
            .with_tracking_enabled(config.enable_error_tracking);
        let methods = MethodsModel::new(ctx).with_timing_sample_rate(config.timing_sample_rate);

        Self {
            config,
            clock,
            channel,
            errors: Arc::new(errors),
            methods: Arc::new(methods),
            cancel,
            scheduler: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn channel(&self) -> &DeliveryChannel {
        &self.channel
    }

    #[must_use]
    pub fn errors(&self) -> &Arc<ErrorModel> {
        &self.errors
    }

    #[must_use]
    pub fn methods(&self) -> &Arc<MethodsModel> {
        &self.methods
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<SyncedClock> {
        &self.clock
    }

    /// Aligns the clock with the collection server. A failed sync keeps the local clock.
    pub async fn sync_clock(&self) {
        let Some(endpoint) = &self.config.endpoint else {
            return;
        };
        let client = reqwest::Client::new();
        match self.clock.sync(&client, endpoint).await {
            Ok(offset) => debug!("Clock offset is {offset}ms"),
            Err(e) => warn!("Clock sync with {endpoint} failed: {e}"),
        }
    }

    /// Starts the flush loops. Calling it again has no effect.
    pub fn start(&mut self) {
        if self.scheduler.is_some() {
            return;
        }
        self.methods.start_sampling();
        let mut scheduler = Scheduler::new(self.channel.clone(), self.cancel.clone());
        scheduler.register(
            self.errors.clone() as Arc<dyn Model>,
            self.config.error_dump_interval,
        );
        scheduler.register(
            self.methods.clone() as Arc<dyn Model>,
            self.config.payload_timeout,
        );
        self.scheduler = Some(scheduler.start());
        debug!(
            "Agent started ({} role, connected={})",
            self.channel.role(),
            self.channel.is_connected()
        );
    }

    /// Stops the flush loops after one final flush of every model. Pending retries are
    /// cancelled.
    pub async fn shutdown(mut self) {
        match self.scheduler.take() {
            Some(scheduler) => scheduler.shutdown().await,
            None => self.cancel.cancel(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::{RecordingLogger, RecordingMetrics};
    use crate::trace::{Exception, MethodTrace};

    fn config() -> Config {
        Config {
            app_id: Some("app".to_string()),
            app_secret: Some("secret".to_string()),
            max_errors_per_interval: 2,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_models_follow_config() {
        let metrics = Arc::new(RecordingMetrics::default());
        let agent = Agent::with_parts(
            config(),
            Arc::new(RecordingLogger::default()),
            metrics.clone(),
            DeliveryChannel::disconnected(),
        );

        let trace = MethodTrace {
            name: "posts.insert".to_string(),
            kind: "method".to_string(),
            ..Default::default()
        };
        for i in 0..3 {
            agent
                .errors()
                .track_error(&Exception::new(format!("boom {i}")), &trace);
        }
        assert_eq!(agent.errors().error_count(), 2);
        assert_eq!(metrics.increments_of("kadira.errors"), 3);
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_without_statsd_host() {
        let agent = Agent::new(config()).expect("agent");
        assert!(agent.channel().is_connected());
        assert_eq!(agent.config().max_errors_per_interval, 2);
        agent.shutdown().await;
    }

    #[test]
    fn test_start_samples_traces_when_built_outside_runtime() {
        let config = Config {
            payload_timeout: std::time::Duration::from_secs(3600),
            ..config()
        };
        let mut agent = Agent::with_parts(
            config,
            Arc::new(RecordingLogger::default()),
            Arc::new(RecordingMetrics::default()),
            DeliveryChannel::disconnected(),
        );
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("runtime");

        runtime.block_on(async move {
            agent.start();
            agent.methods().process_method(&MethodTrace {
                name: "posts.insert".to_string(),
                kind: "method".to_string(),
                ..Default::default()
            });
            tokio::time::sleep(std::time::Duration::from_secs(61)).await;

            let payload = agent.methods().flush_all().expect("payload");
            let requests = payload.body["methodRequests"].as_array().expect("requests");
            assert_eq!(requests.len(), 1);
            agent.shutdown().await;
        });
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let mut agent = Agent::new(Config::default()).expect("agent");
        agent.start();
        agent.start();
        assert!(!agent.channel().is_connected());
        agent.shutdown().await;
    }
}
