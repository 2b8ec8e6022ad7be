// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Cycle-driven aggregation service.
//!
//! ```text
//!   send() ──add──> Buffer (std Mutex, drop-oldest)
//!                      │ drained once per cycle
//!                      v
//!              AggregatorService task ◄── Configure / Stop commands
//!                      │ rate_limit + encode
//!                      v
//!              output queue (bounded) ──> dispatcher workers
//! ```
//!
//! The service task is the only reader of the rate budget. `Configure`
//! commands are handled on the same task as flushes, so a budget change is
//! applied entirely before or entirely after any given flush.
//!
//! A full output queue holds the flush back instead of losing the batch.
//! Records keep landing in the buffer meanwhile, which evicts its oldest
//! entries once full.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::aggregator::{cycle_cap, default_buffer_limit, rate_limit, Buffer, Push};
use crate::codec;
use crate::constants::{DEFAULT_WINDOW, ERROR_QUEUE_SIZE};
use crate::errors::Error;
use crate::flow::Flow;
use crate::metrics::Metrics;

/// One encoded cycle, ready to be framed and transmitted.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub seq: u64,
    /// Number of records in the payload.
    pub len: usize,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub enum AggregatorCommand {
    Configure(u64),
    Stop,
}

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Flows per second; 0 is unlimited.
    pub fps: u64,
    pub window: Duration,
    /// Fixed pre-cycle buffer size. Derived from the budget when `None`.
    pub buffer_limit: Option<usize>,
    pub output_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            fps: 0,
            window: DEFAULT_WINDOW,
            buffer_limit: None,
            output_capacity: 1,
        }
    }
}

/// Receiving ends of the aggregator's queues.
#[derive(Debug)]
pub struct AggregatorChannels {
    pub output: mpsc::Receiver<Batch>,
    pub errors: mpsc::Receiver<Error>,
}

/// Producer-side handle. Cloneable and safe to use from many threads.
#[derive(Clone, Debug)]
pub struct AggregatorHandle {
    buffer: Arc<Mutex<Buffer>>,
    tx: mpsc::UnboundedSender<AggregatorCommand>,
    metrics: Arc<Metrics>,
    done: CancellationToken,
}

impl AggregatorHandle {
    /// Buffers a record for the current cycle. Never waits on I/O.
    pub fn add(&self, flow: Flow) {
        let pushed = {
            #[allow(clippy::expect_used)]
            let mut buffer = self.buffer.lock().expect("lock poisoned");
            buffer.push(flow)
        };
        match pushed {
            Push::Accepted => {}
            Push::EvictedOldest => {
                self.metrics.buffer_drops.inc();
                trace!("Aggregator buffer full, evicted oldest flow");
            }
            Push::Closed => {
                self.metrics.buffer_drops.inc();
                trace!("Aggregator stopped, dropping flow");
            }
        }
    }

    /// Replaces the rate budget starting with the next flush.
    pub fn configure(&self, fps: u64) {
        if self.tx.send(AggregatorCommand::Configure(fps)).is_err() {
            debug!("Aggregator already stopped, ignoring budget of {fps} fps");
        }
    }

    /// Requests a final flush followed by shutdown. Idempotent.
    pub fn stop(&self) {
        {
            #[allow(clippy::expect_used)]
            let mut buffer = self.buffer.lock().expect("lock poisoned");
            buffer.close();
        }
        // A closed channel means the service already stopped.
        let _ = self.tx.send(AggregatorCommand::Stop);
    }

    /// Resolves once the final cycle is flushed and the output queue is closed.
    pub async fn done(&self) {
        self.done.cancelled().await;
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }
}

pub struct AggregatorService {
    buffer: Arc<Mutex<Buffer>>,
    rx: mpsc::UnboundedReceiver<AggregatorCommand>,
    output: mpsc::Sender<Batch>,
    errors: mpsc::Sender<Error>,
    metrics: Arc<Metrics>,
    done: CancellationToken,
    budget: u64,
    window: Duration,
    buffer_limit: Option<usize>,
    seq: u64,
    stopping: bool,
}

impl AggregatorService {
    #[must_use]
    pub fn new(
        config: AggregatorConfig,
        metrics: Arc<Metrics>,
    ) -> (Self, AggregatorHandle, AggregatorChannels) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::channel(config.output_capacity.max(1));
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_QUEUE_SIZE);
        let limit = config
            .buffer_limit
            .unwrap_or_else(|| default_buffer_limit(cycle_cap(config.fps, config.window)));
        let buffer = Arc::new(Mutex::new(Buffer::new(limit)));
        let done = CancellationToken::new();

        let service = Self {
            buffer: Arc::clone(&buffer),
            rx,
            output: output_tx,
            errors: errors_tx,
            metrics: Arc::clone(&metrics),
            done: done.clone(),
            budget: config.fps,
            window: config.window,
            buffer_limit: config.buffer_limit,
            seq: 0,
            stopping: false,
        };
        let handle = AggregatorHandle {
            buffer,
            tx,
            metrics,
            done,
        };
        let channels = AggregatorChannels {
            output: output_rx,
            errors: errors_rx,
        };
        (service, handle, channels)
    }

    pub async fn run(mut self) {
        debug!(
            "Aggregator service started with a budget of {} fps over {:?} cycles",
            self.budget, self.window
        );

        let mut ticker = interval_at(Instant::now() + self.window, self.window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.stopping {
            tokio::select! {
                biased;
                command = self.rx.recv() => self.handle(command),
                _ = ticker.tick() => self.flush().await,
            }
        }

        // The open cycle is still flushed before the output queue closes.
        self.flush().await;
        let Self { output, done, .. } = self;
        drop(output);
        done.cancel();
        debug!("Aggregator service stopped");
    }

    fn handle(&mut self, command: Option<AggregatorCommand>) {
        match command {
            Some(AggregatorCommand::Configure(fps)) => self.apply_budget(fps),
            Some(AggregatorCommand::Stop) | None => self.stopping = true,
        }
    }

    fn apply_budget(&mut self, fps: u64) {
        if fps == self.budget {
            return;
        }
        debug!("Aggregator budget changed from {} to {} fps", self.budget, fps);
        self.budget = fps;
        if self.buffer_limit.is_none() {
            #[allow(clippy::expect_used)]
            let mut buffer = self.buffer.lock().expect("lock poisoned");
            buffer.set_limit(default_buffer_limit(cycle_cap(fps, self.window)));
        }
    }

    async fn flush(&mut self) {
        let flows = {
            #[allow(clippy::expect_used)]
            let mut buffer = self.buffer.lock().expect("lock poisoned");
            buffer.take()
        };
        if flows.is_empty() {
            return;
        }

        let cap = cycle_cap(self.budget, self.window);
        let limited = rate_limit(flows, cap);
        let emitted = limited.flows.len();
        self.metrics.flows_in.add(limited.received as u64);
        self.metrics.flows_out.add(emitted as u64);
        self.metrics.rate_limit_drops.add(limited.dropped() as u64);
        self.metrics
            .orig_sample_rate
            .observe_all(limited.original_rates.iter().map(|r| f64::from(*r)));
        self.metrics
            .new_sample_rate
            .observe_all(limited.flows.iter().map(|f| f64::from(f.effective_sample_rate())));
        if limited.downsampled() {
            debug!(
                "Rate limited cycle: {} in, {} out, budget {} fps",
                limited.received, emitted, self.budget
            );
        }

        self.seq += 1;
        let seq = self.seq;
        let payload = match codec::encode_batch(seq, &limited.flows) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode batch {seq}: {e}");
                self.metrics.encode_errors.inc();
                self.report(Error::Encode {
                    seq,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let batch = Batch {
            seq,
            len: emitted,
            payload,
        };
        self.enqueue(batch).await;
    }

    /// Waits for room on the output queue. Commands that arrive meanwhile
    /// are applied to later cycles.
    async fn enqueue(&mut self, batch: Batch) {
        let output = self.output.clone();
        let (seq, emitted) = (batch.seq, batch.len);
        let permit = loop {
            tokio::select! {
                biased;
                permit = output.reserve() => break permit,
                command = self.rx.recv(), if !self.stopping => self.handle(command),
            }
        };
        match permit {
            Ok(permit) => {
                permit.send(batch);
                trace!("Queued batch {seq} with {emitted} flows");
            }
            Err(_) => {
                self.metrics.output_drops.add(emitted as u64);
                debug!("Output queue closed, dropping batch {seq}");
                self.report(Error::BatchDropped {
                    seq,
                    reason: "output queue closed",
                });
            }
        }
    }

    fn report(&self, err: Error) {
        if let Err(e) = self.errors.try_send(err) {
            debug!("Dropping aggregator error: {e}");
        }
    }
}
