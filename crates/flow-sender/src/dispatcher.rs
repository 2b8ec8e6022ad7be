// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Worker pool that frames batches and POSTs them to the flow endpoint.
//!
//! Workers share the aggregator's output queue and exit once it is closed.
//! Delivery is at-most-once: a batch that fails to encode or transmit is
//! reported on the sender's error queue and dropped.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::Url;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::aggregator_service::Batch;
use crate::codec;
use crate::constants::{FLOW_CONTENT_TYPE, SESSION_ID};
use crate::errors::Error;
use crate::http::auth_headers;
use crate::metrics::Metrics;

#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    timeout: Duration,
    compression_level: Option<i32>,
    metrics: Arc<Metrics>,
    errors: mpsc::Sender<Error>,
}

pub struct DispatcherConfig {
    pub client: reqwest::Client,
    pub flow_url: Url,
    pub email: String,
    pub token: String,
    pub timeout: Duration,
    /// zstd level applied to each frame; `None` sends frames uncompressed.
    pub compression_level: Option<i32>,
    pub metrics: Arc<Metrics>,
    pub errors: mpsc::Sender<Error>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig) -> Result<Self, Error> {
        let mut headers = auth_headers(&config.email, &config.token)?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(FLOW_CONTENT_TYPE));
        if config.compression_level.is_some() {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("zstd"));
        }
        Ok(Self {
            client: config.client,
            url: config.flow_url,
            headers,
            timeout: config.timeout,
            compression_level: config.compression_level,
            metrics: config.metrics,
            errors: config.errors,
        })
    }

    /// Binds the session and sender identifiers into the target URL.
    pub fn bind_sender(&mut self, sender_id: &str) {
        self.url
            .query_pairs_mut()
            .append_pair("sid", &SESSION_ID.to_string())
            .append_pair("sender_id", sender_id);
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Starts `workers` tasks draining `output` until it is closed.
    pub fn spawn(&self, workers: usize, output: mpsc::Receiver<Batch>) -> JoinSet<()> {
        let output = Arc::new(Mutex::new(output));
        let mut set = JoinSet::new();
        for worker in 0..workers.max(1) {
            let dispatcher = self.clone();
            let output = Arc::clone(&output);
            set.spawn(async move { dispatcher.run_worker(worker, output).await });
        }
        set
    }

    async fn run_worker(self, worker: usize, output: Arc<Mutex<mpsc::Receiver<Batch>>>) {
        debug!("Dispatcher worker {worker} started");
        loop {
            let batch = {
                let mut output = output.lock().await;
                output.recv().await
            };
            let Some(batch) = batch else {
                break;
            };
            let seq = batch.seq;
            match self.dispatch(batch).await {
                Ok(sent) => {
                    self.metrics.batches_sent.inc();
                    self.metrics.bytes_sent.add(sent as u64);
                    debug!("Worker {worker} sent batch {seq} ({sent} bytes)");
                }
                Err(e) => {
                    self.metrics.batches_failed.inc();
                    error!("Failed to send batch {seq}, dropping it: {e}");
                    if let Err(e) = self.errors.try_send(e) {
                        debug!("Dropping dispatcher error: {e}");
                    }
                }
            }
        }
        debug!("Dispatcher worker {worker} stopped");
    }

    /// Frames, optionally compresses, and POSTs one batch. Returns the body size.
    pub async fn dispatch(&self, batch: Batch) -> Result<usize, Error> {
        let body = self.encode(&batch)?;
        let size = body.len();
        let resp = self
            .client
            .post(self.url.clone())
            .timeout(self.timeout)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            debug!(
                "{}: collector rejected batch {}: {:?}",
                status,
                batch.seq,
                resp.text().await.unwrap_or_default()
            );
            return Err(Error::Transmit {
                seq: batch.seq,
                status,
            });
        }
        Ok(size)
    }

    fn encode(&self, batch: &Batch) -> Result<Vec<u8>, Error> {
        let framed = codec::frame(SESSION_ID, &batch.payload);
        match self.compression_level {
            None => Ok(framed),
            Some(level) => zstd::bulk::compress(&framed, level).map_err(|e| Error::Encode {
                seq: batch.seq,
                reason: format!("compression failed: {e}"),
            }),
        }
    }
}
