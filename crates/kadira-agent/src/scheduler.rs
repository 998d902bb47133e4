// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic flush of the models into the delivery channel.
//!
//! Every registered model gets its own ticker. A tick takes the model's payload and hands it
//! to the channel on a separate task, so a slow or retrying delivery never delays the next
//! tick. On shutdown each model is drained one last time and that delivery is awaited.

use crate::models::{Model, Payload};
use crate::send::DeliveryChannel;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub struct Scheduler {
    channel: DeliveryChannel,
    models: Vec<(Arc<dyn Model>, Duration)>,
    cancel: CancellationToken,
}

impl Scheduler {
    #[must_use]
    pub fn new(channel: DeliveryChannel, cancel: CancellationToken) -> Self {
        Self {
            channel,
            models: Vec::new(),
            cancel,
        }
    }

    pub fn register(&mut self, model: Arc<dyn Model>, every: Duration) {
        self.models.push((model, every));
    }

    /// Spawns one flush loop per registered model. Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(self) -> SchedulerHandle {
        let tasks = self
            .models
            .into_iter()
            .map(|(model, every)| {
                let channel = self.channel.clone();
                let cancel = self.cancel.clone();
                tokio::spawn(run(model, every, channel, cancel))
            })
            .collect();
        SchedulerHandle {
            tasks,
            cancel: self.cancel,
        }
    }
}

pub struct SchedulerHandle {
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    /// Stops every flush loop and waits for the final flushes.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Flush loop failed: {e}");
            }
        }
    }
}

async fn run(
    model: Arc<dyn Model>,
    every: Duration,
    channel: DeliveryChannel,
    cancel: CancellationToken,
) {
    let mut flush_interval = interval(every);
    flush_interval.tick().await; // discard first tick, which is instantaneous

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = flush_interval.tick() => {
                debug!("Flushing {} model", model.name());
                if let Some(payload) = model.send_periodic_metrics() {
                    dispatch(&channel, model.name(), payload);
                }
            }
        }
    }

    if let Some(payload) = model.flush_all() {
        debug!("Final flush of {} model", model.name());
        if let Err(e) = channel.send(payload.path, &payload.body).await {
            error!("Final flush of {} model failed: {e}", model.name());
        }
    }
}

fn dispatch(channel: &DeliveryChannel, model: &'static str, payload: Payload) {
    let spawned = channel.spawn_send(payload.path, payload.body, move |result| {
        if let Err(e) = result {
            error!("Failed to send {model} payload: {e}");
        }
    });
    if let Err(e) = spawned {
        debug!("Dropping {model} payload: {e}");
    }
}
