// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;

/// Errors produced by the flow sending pipeline.
///
/// Construction and lookup failures are returned synchronously. Everything on
/// the steady-state data path is delivered asynchronously through the
/// sender's error queue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid {name} URL '{url}': {reason}")]
    InvalidUrl {
        name: &'static str,
        url: String,
        reason: String,
    },

    #[error("missing credentials: {0}")]
    MissingCredentials(&'static str),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unauthorized: check email and API token")]
    Unauthorized,

    #[error("device not found")]
    DeviceNotFound,

    #[error("device API error: {0}")]
    Api(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to encode batch {seq}: {reason}")]
    Encode { seq: u64, reason: String },

    #[error("batch {seq} rejected by collector: {status}")]
    Transmit { seq: u64, status: StatusCode },

    #[error("batch {seq} dropped: {reason}")]
    BatchDropped { seq: u64, reason: &'static str },
}

impl Error {
    /// Classifies a non-success device API response.
    #[must_use]
    pub fn from_api_status(status: StatusCode, body: &str) -> Self {
        match status {
            StatusCode::UNAUTHORIZED => Error::Unauthorized,
            StatusCode::NOT_FOUND => Error::DeviceNotFound,
            other => Error::Api(format!("{other}: {body}")),
        }
    }
}
