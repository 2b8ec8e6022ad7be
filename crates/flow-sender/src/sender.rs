// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sender lifecycle: wires the aggregator, dispatcher workers, rate updater
//! and metrics reporter together and supervises their shutdown.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::aggregator_service::{AggregatorConfig, AggregatorHandle, AggregatorService};
use crate::api::{ClientId, Device, DeviceLookup};
use crate::dispatcher::Dispatcher;
use crate::errors::Error;
use crate::flow::Flow;
use crate::metrics::{Metrics, Snapshot};
use crate::reporter::MetricsReporter;
use crate::updater::RateUpdater;

/// Lifecycle of a [`Sender`]. A sender is `Started` as soon as
/// [`Sender::start`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SenderState {
    Started = 0,
    Stopping = 1,
    /// Every dispatcher worker has exited.
    Stopped = 2,
}

impl SenderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SenderState::Started,
            1 => SenderState::Stopping,
            _ => SenderState::Stopped,
        }
    }
}

/// Everything a [`Sender`] needs, resolved ahead of time.
pub struct SenderConfig {
    pub device: Device,
    pub lookup: Arc<dyn DeviceLookup>,
    pub dispatcher: Dispatcher,
    pub workers: usize,
    pub window: Duration,
    pub buffer_limit: Option<usize>,
    pub refresh_interval: Duration,
    pub reporter: Option<MetricsReporter>,
    pub metrics: Arc<Metrics>,
    /// Receives every asynchronous error; full queues drop.
    pub errors: mpsc::Sender<Error>,
}

/// A running flow pipeline bound to one device.
#[derive(Debug, Clone)]
pub struct Sender {
    device: Device,
    aggregator: AggregatorHandle,
    metrics: Arc<Metrics>,
    state: Arc<AtomicU8>,
    stopped: CancellationToken,
}

impl Sender {
    /// Starts the pipeline. Must be called from within a Tokio runtime.
    #[must_use]
    pub fn start(config: SenderConfig) -> Self {
        let SenderConfig {
            device,
            lookup,
            mut dispatcher,
            workers,
            window,
            buffer_limit,
            refresh_interval,
            reporter,
            metrics,
            errors,
        } = config;
        let state = Arc::new(AtomicU8::new(SenderState::Started as u8));

        dispatcher.bind_sender(&device.client_id().to_string());

        let workers = workers.max(1);
        let (service, aggregator, channels) = AggregatorService::new(
            AggregatorConfig {
                fps: device.max_flow_rate,
                window,
                buffer_limit,
                output_capacity: workers,
            },
            Arc::clone(&metrics),
        );
        tokio::spawn(service.run());
        let worker_set = dispatcher.spawn(workers, channels.output);

        let cancel = CancellationToken::new();
        let mut background = JoinSet::new();
        let updater = RateUpdater::new(
            lookup,
            device.id,
            device.max_flow_rate,
            aggregator.clone(),
            errors.clone(),
            refresh_interval,
        );
        background.spawn(updater.run(cancel.clone()));
        if let Some(reporter) = reporter {
            background.spawn(reporter.run(cancel.clone()));
        }

        let stopped = CancellationToken::new();
        let monitor = Monitor {
            aggregator: aggregator.clone(),
            aggregator_errors: channels.errors,
            errors,
            workers: worker_set,
            background,
            cancel,
            state: Arc::clone(&state),
            stopped: stopped.clone(),
        };
        tokio::spawn(monitor.run());

        info!(
            "Flow sender started for device {} ({} workers, budget {} fps)",
            device.client_id(),
            workers,
            device.max_flow_rate
        );

        Self {
            device,
            aggregator,
            metrics,
            state,
            stopped,
        }
    }

    /// Queues a flow for the current cycle, stamped with this sender's device.
    pub fn send(&self, mut flow: Flow) {
        if self.state() != SenderState::Started {
            self.metrics.buffer_drops.inc();
            debug!("Sender is not running, dropping flow");
            return;
        }
        flow.device_id = self.device.id;
        self.aggregator.add(flow);
    }

    /// Flushes the open cycle and waits up to `timeout` for every worker to
    /// finish. Returns `false` if the pipeline did not drain in time.
    ///
    /// The rate updater and metrics reporter are cancelled but not waited
    /// on; the last metrics push completes in the background.
    pub async fn stop(&self, timeout: Duration) -> bool {
        let _ = self.state.compare_exchange(
            SenderState::Started as u8,
            SenderState::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.aggregator.stop();
        let drained = tokio::time::timeout(timeout, self.stopped.cancelled())
            .await
            .is_ok();
        if !drained {
            debug!("Flow sender did not stop within {timeout:?}");
        }
        drained
    }

    #[must_use]
    pub fn state(&self) -> SenderState {
        SenderState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[must_use]
    pub fn client_id(&self) -> ClientId {
        self.device.client_id()
    }

    #[must_use]
    pub fn metrics(&self) -> Snapshot {
        self.metrics.snapshot()
    }
}

struct Monitor {
    aggregator: AggregatorHandle,
    aggregator_errors: mpsc::Receiver<Error>,
    errors: mpsc::Sender<Error>,
    workers: JoinSet<()>,
    background: JoinSet<()>,
    cancel: CancellationToken,
    state: Arc<AtomicU8>,
    stopped: CancellationToken,
}

impl Monitor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                Some(err) = self.aggregator_errors.recv() => self.forward(err),
                () = self.aggregator.done() => break,
            }
        }

        while self.workers.join_next().await.is_some() {}
        self.cancel.cancel();
        while let Ok(err) = self.aggregator_errors.try_recv() {
            self.forward(err);
        }

        self.state
            .store(SenderState::Stopped as u8, Ordering::Release);
        self.stopped.cancel();
        info!("Flow sender stopped");

        while self.background.join_next().await.is_some() {}
        debug!("Flow sender background tasks finished");
    }

    fn forward(&self, err: Error) {
        if let Err(e) = self.errors.try_send(err) {
            debug!("Error queue full, dropping: {e}");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dispatcher::DispatcherConfig;
    use crate::http::get_client;
    use crate::updater::tests::{device, ScriptedLookup, StalledLookup};
    use mockito::{Matcher, Server};
    use reqwest::header::HeaderMap;
    use reqwest::Url;

    struct Harness {
        server: mockito::ServerGuard,
        errors: mpsc::Receiver<Error>,
    }

    async fn start(
        fps: u64,
        refresh: Vec<Result<u64, Error>>,
        refresh_interval: Duration,
    ) -> (Sender, Harness) {
        let lookup = Arc::new(ScriptedLookup::new(fps, refresh));
        start_with(fps, lookup, refresh_interval, None).await
    }

    async fn start_with(
        fps: u64,
        lookup: Arc<dyn DeviceLookup>,
        refresh_interval: Duration,
        reporter: Option<MetricsReporter>,
    ) -> (Sender, Harness) {
        let server = Server::new_async().await;
        let (errors_tx, errors_rx) = mpsc::channel(16);
        let metrics = Arc::new(Metrics::default());
        let dispatcher = Dispatcher::new(DispatcherConfig {
            client: get_client(None, Duration::from_secs(2)),
            flow_url: Url::parse(&format!("{}/chf", server.url())).unwrap(),
            email: "ops@example.com".to_string(),
            token: "token".to_string(),
            timeout: Duration::from_secs(2),
            compression_level: None,
            metrics: Arc::clone(&metrics),
            errors: errors_tx.clone(),
        })
        .unwrap();
        let sender = Sender::start(SenderConfig {
            device: device(1001, fps),
            lookup,
            dispatcher,
            workers: 2,
            window: Duration::from_millis(50),
            buffer_limit: None,
            refresh_interval,
            reporter,
            metrics,
            errors: errors_tx,
        });
        (
            sender,
            Harness {
                server,
                errors: errors_rx,
            },
        )
    }

    fn flows(n: usize) -> impl Iterator<Item = Flow> {
        (0..n).map(|i| Flow {
            sample_rate: 1,
            src_port: i as u32,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_send_and_graceful_stop() {
        let (sender, mut harness) = start(0, Vec::new(), Duration::from_secs(3600)).await;
        let mock = harness
            .server
            .mock("POST", "/chf")
            .match_query(Matcher::UrlEncoded(
                "sender_id".into(),
                "42:edge:1001".into(),
            ))
            .with_status(200)
            .expect_at_least(1)
            .create_async()
            .await;

        assert_eq!(sender.state(), SenderState::Started);
        flows(20).for_each(|f| sender.send(f));
        assert!(sender.stop(Duration::from_secs(5)).await);
        assert_eq!(sender.state(), SenderState::Stopped);
        mock.assert_async().await;

        let snapshot = sender.metrics();
        assert_eq!(snapshot.flows_in, 20);
        assert_eq!(snapshot.flows_out, 20);
        assert!(snapshot.batches_sent >= 1);
        assert_eq!(snapshot.batches_failed, 0);
        assert!(harness.errors.try_recv().is_err());

        // Stopped senders drop and count.
        sender.send(Flow::default());
        assert_eq!(sender.metrics().buffer_drops, 1);
        assert!(sender.stop(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_rejected_batch_is_reported() {
        let (sender, mut harness) = start(0, Vec::new(), Duration::from_secs(3600)).await;
        harness
            .server
            .mock("POST", "/chf")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        flows(3).for_each(|f| sender.send(f));
        let err = tokio::time::timeout(Duration::from_secs(5), harness.errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, Error::Transmit { seq: 1, .. }));
        assert!(sender.stop(Duration::from_secs(5)).await);
        assert_eq!(sender.metrics().batches_failed, 1);
    }

    #[tokio::test]
    async fn test_refresh_to_unlimited_passes_everything_through() {
        let (sender, mut harness) = start(10, vec![Ok(0)], Duration::from_millis(100)).await;
        harness
            .server
            .mock("POST", "/chf")
            .match_query(Matcher::Any)
            .with_status(200)
            .create_async()
            .await;

        // Let the updater pick up the unlimited budget.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let before = sender.metrics();
        flows(500).for_each(|f| sender.send(f));
        assert!(sender.stop(Duration::from_secs(5)).await);

        let after = sender.metrics();
        assert_eq!(after.flows_in - before.flows_in, 500);
        assert_eq!(after.flows_out - before.flows_out, 500);
        assert_eq!(after.rate_limit_drops, 0);
    }

    #[tokio::test]
    async fn test_stop_reports_timeout_before_drain() {
        let (sender, harness) = start(0, Vec::new(), Duration::from_secs(3600)).await;
        let mut server = harness.server;
        server
            .mock("POST", "/chf")
            .match_query(Matcher::Any)
            .with_status(200)
            .create_async()
            .await;

        flows(5).for_each(|f| sender.send(f));
        // The final batch still has to reach the server.
        assert!(!sender.stop(Duration::ZERO).await);
        assert_eq!(sender.state(), SenderState::Stopping);
        assert!(sender.stop(Duration::from_secs(5)).await);
        assert_eq!(sender.state(), SenderState::Stopped);
        assert_eq!(sender.metrics().flows_out, 5);
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_on_stalled_background_requests() {
        // Accepts connections but never answers.
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let reporter = MetricsReporter::new(
            get_client(None, Duration::from_secs(30)),
            Url::parse(&format!("http://{}/tsdb", silent.local_addr().unwrap())).unwrap(),
            HeaderMap::new(),
            Arc::new(Metrics::default()),
            Vec::new(),
            Duration::from_secs(3600),
        );
        let (sender, harness) = start_with(
            0,
            Arc::new(StalledLookup),
            Duration::from_millis(20),
            Some(reporter),
        )
        .await;
        let mut server = harness.server;
        server
            .mock("POST", "/chf")
            .match_query(Matcher::Any)
            .with_status(200)
            .create_async()
            .await;

        // Let a budget refresh get stuck in flight.
        tokio::time::sleep(Duration::from_millis(100)).await;
        flows(5).for_each(|f| sender.send(f));
        assert!(sender.stop(Duration::from_secs(2)).await);
        assert_eq!(sender.state(), SenderState::Stopped);
        assert_eq!(sender.metrics().flows_out, 5);
        drop(silent);
    }
}
