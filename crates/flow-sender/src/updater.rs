// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic refresh of the device's rate budget.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator_service::AggregatorHandle;
use crate::api::DeviceLookup;
use crate::errors::Error;

pub struct RateUpdater {
    lookup: Arc<dyn DeviceLookup>,
    device_id: u32,
    aggregator: AggregatorHandle,
    errors: mpsc::Sender<Error>,
    interval: Duration,
    current: u64,
}

impl RateUpdater {
    #[must_use]
    pub fn new(
        lookup: Arc<dyn DeviceLookup>,
        device_id: u32,
        initial_budget: u64,
        aggregator: AggregatorHandle,
        errors: mpsc::Sender<Error>,
        interval: Duration,
    ) -> Self {
        Self {
            lookup,
            device_id,
            aggregator,
            errors,
            interval,
            current: initial_budget,
        }
    }

    /// Polls every interval until `cancel` fires. The first poll happens one
    /// interval after start. A poll still in flight is abandoned on cancel.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let refreshed = tokio::select! {
                        biased;
                        () = cancel.cancelled() => break,
                        refreshed = self.refresh() => refreshed,
                    };
                    if let Err(e) = refreshed {
                        warn!(
                            "Failed to refresh rate budget for device {}, keeping {} fps: {}",
                            self.device_id, self.current, e
                        );
                        if let Err(e) = self.errors.try_send(e) {
                            debug!("Dropping updater error: {e}");
                        }
                    }
                }
            }
        }
        debug!("Rate updater for device {} stopped", self.device_id);
    }

    /// Fetches the current budget and reconfigures the aggregator if it changed.
    ///
    /// A device that no longer exists is treated as having an unlimited budget.
    pub async fn refresh(&mut self) -> Result<u64, Error> {
        let budget = match self.lookup.get_device_by_id(self.device_id).await {
            Ok(device) => device.max_flow_rate,
            Err(Error::DeviceNotFound) => {
                warn!(
                    "Device {} not found while refreshing its budget, treating it as unlimited",
                    self.device_id
                );
                0
            }
            Err(e) => return Err(e),
        };
        if budget != self.current {
            info!(
                "Rate budget for device {} changed from {} to {} fps",
                self.device_id, self.current, budget
            );
            self.aggregator.configure(budget);
            self.current = budget;
        }
        Ok(budget)
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.current
    }
}
