// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Counters and sample-rate histograms for the sending pipeline.
//!
//! Counters are monotonic and never reset; the reporter is responsible for
//! any windowing. Histograms are DDSketches updated once per emitted record
//! at flush time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use ddsketch_agent::DDSketch;

#[derive(Debug, Default)]
pub struct Metrics {
    pub flows_in: Counter,
    pub flows_out: Counter,
    pub rate_limit_drops: Counter,
    pub buffer_drops: Counter,
    pub output_drops: Counter,
    pub encode_errors: Counter,
    pub batches_sent: Counter,
    pub batches_failed: Counter,
    pub bytes_sent: Counter,
    pub orig_sample_rate: Histogram,
    pub new_sample_rate: Histogram,
}

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Histogram(Mutex<DDSketch>);

impl Histogram {
    pub fn observe(&self, value: f64) {
        #[allow(clippy::expect_used)]
        let mut sketch = self.0.lock().expect("lock poisoned");
        sketch.insert(value);
    }

    /// Records every value of a slice under a single lock acquisition.
    pub fn observe_all(&self, values: impl IntoIterator<Item = f64>) {
        #[allow(clippy::expect_used)]
        let mut sketch = self.0.lock().expect("lock poisoned");
        for value in values {
            sketch.insert(value);
        }
    }

    #[must_use]
    pub fn summary(&self) -> HistogramSummary {
        #[allow(clippy::expect_used)]
        let sketch = self.0.lock().expect("lock poisoned");
        HistogramSummary {
            count: sketch.count() as u64,
            min: sketch.min().unwrap_or_default(),
            max: sketch.max().unwrap_or_default(),
            p50: sketch.quantile(0.5).unwrap_or_default(),
            p95: sketch.quantile(0.95).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HistogramSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
}

/// Point-in-time copy of the registry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Snapshot {
    pub flows_in: u64,
    pub flows_out: u64,
    pub rate_limit_drops: u64,
    pub buffer_drops: u64,
    pub output_drops: u64,
    pub encode_errors: u64,
    pub batches_sent: u64,
    pub batches_failed: u64,
    pub bytes_sent: u64,
    pub orig_sample_rate: HistogramSummary,
    pub new_sample_rate: HistogramSummary,
}

impl Metrics {
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            flows_in: self.flows_in.get(),
            flows_out: self.flows_out.get(),
            rate_limit_drops: self.rate_limit_drops.get(),
            buffer_drops: self.buffer_drops.get(),
            output_drops: self.output_drops.get(),
            encode_errors: self.encode_errors.get(),
            batches_sent: self.batches_sent.get(),
            batches_failed: self.batches_failed.get(),
            bytes_sent: self.bytes_sent.get(),
            orig_sample_rate: self.orig_sample_rate.summary(),
            new_sample_rate: self.new_sample_rate.summary(),
        }
    }
}

impl Snapshot {
    /// Counter values keyed by their reported metric name.
    #[must_use]
    pub fn counters(&self) -> [(&'static str, u64); 9] {
        [
            ("flows_in", self.flows_in),
            ("flows_out", self.flows_out),
            ("rate_limit_drops", self.rate_limit_drops),
            ("buffer_drops", self.buffer_drops),
            ("output_drops", self.output_drops),
            ("encode_errors", self.encode_errors),
            ("batches_sent", self.batches_sent),
            ("batches_failed", self.batches_failed),
            ("bytes_sent", self.bytes_sent),
        ]
    }
}
