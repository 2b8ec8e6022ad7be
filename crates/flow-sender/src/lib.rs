// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # flow-sender
//!
//! Forwards captured network flow records to a remote collector.
//!
//! Records handed to [`Sender::send`] are buffered per aggregation cycle,
//! downsampled to the device's rate budget, encoded into a batch and POSTed
//! by a small pool of workers. The budget is refreshed from the device API in
//! the background, and pipeline metrics are pushed periodically.
//!
//! ```no_run
//! # async fn run() -> Result<(), flow_sender::Error> {
//! use std::time::Duration;
//! use flow_sender::{new_sender_with_device_id, Config, Flow};
//!
//! let config = Config::new("ops@example.com", "token", "my-agent", "1.0.0");
//! let (errors_tx, mut errors_rx) = tokio::sync::mpsc::channel(128);
//! let sender = new_sender_with_device_id(1001, errors_tx, &config).await?;
//! tokio::spawn(async move {
//!     while let Some(e) = errors_rx.recv().await {
//!         eprintln!("flow sender error: {e}");
//!     }
//! });
//!
//! sender.send(Flow::default());
//! sender.stop(Duration::from_secs(5)).await;
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]

pub mod aggregator;
pub mod aggregator_service;
pub mod api;
pub mod codec;
pub mod config;
pub mod constants;
pub mod dispatcher;
pub mod errors;
pub mod flow;
pub mod http;
pub mod metrics;
pub mod reporter;
pub mod sender;
pub mod updater;

pub use api::{ApiClient, ClientId, Device, DeviceLookup};
pub use config::{
    new_sender_with_device_id, new_sender_with_device_if, new_sender_with_device_ip, Capture,
    Config,
};
pub use errors::Error;
pub use flow::{Custom, CustomValue, Flow};
pub use metrics::Snapshot;
pub use sender::{Sender, SenderState};
