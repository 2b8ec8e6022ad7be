// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Defaults for the flow sending pipeline.

use std::time::Duration;

pub const DEFAULT_FLOW_URL: &str = "https://flow.kentik.com/chf";
pub const DEFAULT_API_URL: &str = "https://api.kentik.com/api/internal";
pub const DEFAULT_METRICS_URL: &str = "https://flow.kentik.com/tsdb";

/// Request timeout applied to flow, API and metrics requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Length of one aggregation cycle.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// How often the device's rate budget is re-fetched.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// How often metrics are pushed to the time-series endpoint.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound on the metrics push made after shutdown.
pub const FINAL_REPORT_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_WORKERS: usize = 2;

/// Capacity of the aggregator and sender error queues.
pub const ERROR_QUEUE_SIZE: usize = 128;

/// Lower bound of the pre-cycle buffer, used when the budget is unlimited or small.
pub const MIN_BUFFER_LIMIT: usize = 1_000;

/// The pre-cycle buffer holds this many cycles' worth of records.
pub const BUFFER_BUDGET_MULTIPLIER: usize = 4;

/// Session identifier bound into the flow URL and every frame header.
pub const SESSION_ID: u64 = 0;

pub const AUTH_EMAIL_HEADER: &str = "X-CH-Auth-Email";
pub const AUTH_TOKEN_HEADER: &str = "X-CH-Auth-API-Token";
pub const FLOW_CONTENT_TYPE: &str = "application/binary";

/// Pre-cycle buffer size used while the budget is unlimited.
pub const UNLIMITED_BUFFER_LIMIT: usize = 100_000;
