// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-cycle rate limiting.
//!
//! Records accumulate in a [`Buffer`] while a cycle is open. At the cycle
//! boundary the buffer is drained and passed through [`rate_limit`], which
//! either forwards every record unchanged or decimates the cycle down to the
//! share of the device's budget that fits in one cycle ([`cycle_cap`]) and
//! rewrites sample rates so the traffic estimate
//! (`sum(sample_rate)`) is kept.

use std::collections::VecDeque;
use std::time::Duration;

use crate::constants::{BUFFER_BUDGET_MULTIPLIER, MIN_BUFFER_LIMIT, UNLIMITED_BUFFER_LIMIT};
use crate::flow::Flow;

const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Pre-cycle buffer with a drop-oldest overflow policy.
#[derive(Debug)]
pub struct Buffer {
    flows: VecDeque<Flow>,
    limit: usize,
    closed: bool,
}

/// Result of pushing a record into the buffer.
#[derive(Debug, PartialEq, Eq)]
pub enum Push {
    Accepted,
    /// The buffer was full and its oldest record was evicted.
    EvictedOldest,
    /// The buffer no longer accepts records.
    Closed,
}

impl Buffer {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            flows: VecDeque::new(),
            limit: limit.max(1),
            closed: false,
        }
    }

    pub fn push(&mut self, flow: Flow) -> Push {
        if self.closed {
            return Push::Closed;
        }
        let evicted = if self.flows.len() >= self.limit {
            self.flows.pop_front();
            true
        } else {
            false
        };
        self.flows.push_back(flow);
        if evicted {
            Push::EvictedOldest
        } else {
            Push::Accepted
        }
    }

    /// Drains the records of the current cycle.
    pub fn take(&mut self) -> Vec<Flow> {
        Vec::from(std::mem::take(&mut self.flows))
    }

    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.max(1);
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}

/// Records a cycle of `window` may emit under a budget of `fps` flows per
/// second. Zero stays unlimited; any other budget allows at least one record.
#[must_use]
pub fn cycle_cap(fps: u64, window: Duration) -> u64 {
    if fps == 0 {
        return 0;
    }
    let cap = (u128::from(fps) * window.as_nanos()).div_ceil(NANOS_PER_SEC);
    u64::try_from(cap).unwrap_or(u64::MAX).max(1)
}

/// Buffer size for a per-cycle cap when none is configured explicitly.
#[must_use]
pub fn default_buffer_limit(cap: u64) -> usize {
    if cap == 0 {
        return UNLIMITED_BUFFER_LIMIT;
    }
    usize::try_from(cap)
        .unwrap_or(usize::MAX)
        .saturating_mul(BUFFER_BUDGET_MULTIPLIER)
        .max(MIN_BUFFER_LIMIT)
}

/// Records emitted for one cycle.
#[derive(Debug, Default)]
pub struct RateLimited {
    /// Emitted records, with adjusted sample rates when downsampled.
    pub flows: Vec<Flow>,
    /// Effective original sample rate of each emitted record.
    pub original_rates: Vec<u32>,
    /// Number of records that entered the cycle.
    pub received: usize,
}

impl RateLimited {
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.received - self.flows.len()
    }

    #[must_use]
    pub fn downsampled(&self) -> bool {
        self.dropped() > 0
    }
}

/// Caps the records of one cycle at `cap`.
///
/// A cap of zero is unlimited.
#[must_use]
pub fn rate_limit(flows: Vec<Flow>, cap: u64) -> RateLimited {
    let received = flows.len();
    let limit = usize::try_from(cap).unwrap_or(usize::MAX);
    if cap == 0 || received <= limit {
        let original_rates = flows.iter().map(Flow::effective_sample_rate).collect();
        return RateLimited {
            flows,
            original_rates,
            received,
        };
    }

    let total_weight: f64 = flows
        .iter()
        .map(|f| f64::from(f.effective_sample_rate()))
        .sum();

    // Evenly spaced positions floor(j * received / limit), strictly increasing
    // because received > limit.
    let mut selected = Vec::with_capacity(limit);
    let mut j = 0usize;
    let mut next = 0usize;
    for (i, flow) in flows.into_iter().enumerate() {
        if j == limit {
            break;
        }
        if i == next {
            selected.push(flow);
            j += 1;
            next = position(j, received, limit);
        }
    }

    let selected_weight: f64 = selected
        .iter()
        .map(|f| f64::from(f.effective_sample_rate()))
        .sum();
    let factor = total_weight / selected_weight;

    let mut original_rates = Vec::with_capacity(selected.len());
    let mut carry = 0.0;
    for flow in &mut selected {
        let original = flow.effective_sample_rate();
        let exact = f64::from(original) * factor + carry;
        let adjusted = exact.round().max(1.0);
        carry = exact - adjusted;

        original_rates.push(original);
        flow.sample_rate = to_rate(adjusted);
        flow.sample_adj = true;
    }

    RateLimited {
        flows: selected,
        original_rates,
        received,
    }
}

fn position(j: usize, received: usize, limit: usize) -> usize {
    let pos = (j as u128 * received as u128) / limit as u128;
    usize::try_from(pos).unwrap_or(usize::MAX)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_rate(value: f64) -> u32 {
    if value >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        value as u32
    }
}
