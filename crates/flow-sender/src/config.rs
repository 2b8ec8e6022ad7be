// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::api::{ApiClient, Device, DeviceLookup};
use crate::constants::{
    DEFAULT_API_URL, DEFAULT_FLOW_URL, DEFAULT_METRICS_INTERVAL, DEFAULT_METRICS_URL,
    DEFAULT_REFRESH_INTERVAL, DEFAULT_TIMEOUT, DEFAULT_WINDOW, DEFAULT_WORKERS,
};
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::errors::Error;
use crate::http::{auth_headers, build_client};
use crate::metrics::Metrics;
use crate::reporter::{default_tags, MetricsReporter};
use crate::sender::{Sender, SenderConfig};

/// Capture source the flows originate from. Only used to tag metrics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub device: String,
    pub snaplen: i32,
    pub promisc: bool,
}

/// Endpoints, credentials and tuning for a [`Sender`].
#[derive(Debug, Clone)]
pub struct Config {
    pub email: String,
    pub token: String,
    pub program_name: String,
    pub program_version: String,
    pub flow_url: String,
    pub api_url: String,
    /// Metrics are not reported when unset.
    pub metrics_url: Option<String>,
    pub proxy: Option<String>,
    pub timeout: Duration,
    pub capture: Option<Capture>,
    pub workers: usize,
    pub window: Duration,
    pub refresh_interval: Duration,
    pub metrics_interval: Duration,
    /// zstd level for flow frames; uncompressed when unset.
    pub compression: Option<i32>,
    /// Fixed pre-cycle buffer size; derived from the rate budget when unset.
    pub buffer_limit: Option<usize>,
}

impl Config {
    #[must_use]
    pub fn new(email: &str, token: &str, program_name: &str, program_version: &str) -> Self {
        Self {
            email: email.to_string(),
            token: token.to_string(),
            program_name: program_name.to_string(),
            program_version: program_version.to_string(),
            flow_url: DEFAULT_FLOW_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            metrics_url: Some(DEFAULT_METRICS_URL.to_string()),
            proxy: None,
            timeout: DEFAULT_TIMEOUT,
            capture: None,
            workers: DEFAULT_WORKERS,
            window: DEFAULT_WINDOW,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            compression: None,
            buffer_limit: None,
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, Error> {
        Self::from_vars(|name| env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let mut config = Self::new(
            &var("KENTIK_EMAIL").unwrap_or_default(),
            &var("KENTIK_API_TOKEN").unwrap_or_default(),
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
        );
        if let Some(url) = var("KENTIK_FLOW_URL") {
            config.flow_url = url;
        }
        if let Some(url) = var("KENTIK_API_URL") {
            config.api_url = url;
        }
        if let Some(url) = var("KENTIK_METRICS_URL") {
            config.metrics_url = if url.is_empty() { None } else { Some(url) };
        }
        config.proxy = var("HTTPS_PROXY").filter(|p| !p.is_empty());
        if let Some(secs) = var("KENTIK_TIMEOUT_SECS") {
            let secs = secs.parse::<u64>().map_err(|_| {
                Error::InvalidConfig(format!("KENTIK_TIMEOUT_SECS '{secs}' is not a number"))
            })?;
            config.timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Points every endpoint at a single plain-HTTP server, e.g. a local proxy.
    pub fn set_server(&mut self, host: &str, port: u16) -> &mut Self {
        let base = format!("http://{host}:{port}");
        self.flow_url = format!("{base}/chf");
        self.api_url = format!("{base}/api/internal");
        self.metrics_url = Some(format!("{base}/tsdb"));
        self
    }

    pub fn set_flow_url(&mut self, url: &str) -> &mut Self {
        self.flow_url = url.to_string();
        self
    }

    pub fn set_api_url(&mut self, url: &str) -> &mut Self {
        self.api_url = url.to_string();
        self
    }

    /// `None` disables metrics reporting.
    pub fn set_metrics_url(&mut self, url: Option<&str>) -> &mut Self {
        self.metrics_url = url.map(str::to_string);
        self
    }

    pub fn set_proxy(&mut self, proxy: &str) -> &mut Self {
        self.proxy = Some(proxy.to_string());
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    pub fn set_capture(&mut self, capture: Capture) -> &mut Self {
        self.capture = Some(capture);
        self
    }

    pub fn set_workers(&mut self, workers: usize) -> &mut Self {
        self.workers = workers.max(1);
        self
    }

    /// Cycle length. The per-second budget is spread over cycles, so each
    /// cycle emits at most `budget * window` records.
    pub fn set_window(&mut self, window: Duration) -> &mut Self {
        self.window = window;
        self
    }

    pub fn set_refresh_interval(&mut self, interval: Duration) -> &mut Self {
        self.refresh_interval = interval;
        self
    }

    pub fn set_metrics_interval(&mut self, interval: Duration) -> &mut Self {
        self.metrics_interval = interval;
        self
    }

    pub fn set_compression(&mut self, level: Option<i32>) -> &mut Self {
        self.compression = level;
        self
    }

    pub fn set_buffer_limit(&mut self, limit: usize) -> &mut Self {
        self.buffer_limit = Some(limit);
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), Error> {
        if self.email.trim().is_empty() {
            return Err(Error::MissingCredentials("email"));
        }
        if self.token.trim().is_empty() {
            return Err(Error::MissingCredentials("API token"));
        }

        parse_url("flow", &self.flow_url)?;
        parse_url("API", &self.api_url)?;
        if let Some(url) = &self.metrics_url {
            parse_url("metrics", url)?;
        }
        if let Some(url) = &self.proxy {
            parse_url("proxy", url)?;
        }

        for (name, value) in [
            ("window", self.window),
            ("timeout", self.timeout),
            ("refresh interval", self.refresh_interval),
            ("metrics interval", self.metrics_interval),
        ] {
            if value.is_zero() {
                return Err(Error::InvalidConfig(format!("{name} must be greater than 0")));
            }
        }
        if self.buffer_limit == Some(0) {
            return Err(Error::InvalidConfig(
                "buffer limit must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Device API client using this configuration's credentials and proxy.
    pub fn api_client(&self) -> Result<ApiClient, Error> {
        self.validate()?;
        ApiClient::new(
            build_client(self.proxy.as_deref(), self.timeout)?,
            &self.api_url,
            &self.email,
            &self.token,
            self.timeout,
        )
    }

    /// Starts a sender for an already resolved device.
    ///
    /// `lookup` is used to refresh the device's rate budget.
    pub fn start(
        &self,
        lookup: Arc<dyn DeviceLookup>,
        device: Device,
        errors: mpsc::Sender<Error>,
    ) -> Result<Sender, Error> {
        self.validate()?;
        let client = build_client(self.proxy.as_deref(), self.timeout)?;
        let metrics = Arc::new(Metrics::default());

        let dispatcher = Dispatcher::new(DispatcherConfig {
            client: client.clone(),
            flow_url: parse_url("flow", &self.flow_url)?,
            email: self.email.clone(),
            token: self.token.clone(),
            timeout: self.timeout,
            compression_level: self.compression,
            metrics: Arc::clone(&metrics),
            errors: errors.clone(),
        })?;

        let reporter = match &self.metrics_url {
            Some(url) => Some(MetricsReporter::new(
                client,
                parse_url("metrics", url)?,
                auth_headers(&self.email, &self.token)?,
                Arc::clone(&metrics),
                self.tags(&device),
                self.metrics_interval,
            )),
            None => {
                debug!("No metrics URL configured, metrics reporting disabled");
                None
            }
        };

        Ok(Sender::start(SenderConfig {
            device,
            lookup,
            dispatcher,
            workers: self.workers,
            window: self.window,
            buffer_limit: self.buffer_limit,
            refresh_interval: self.refresh_interval,
            reporter,
            metrics,
            errors,
        }))
    }

    fn tags(&self, device: &Device) -> Vec<String> {
        let mut tags = default_tags(
            &self.program_name,
            &self.program_version,
            &device.client_id().to_string(),
        );
        if let Some(capture) = &self.capture {
            tags.push(format!("capture:{}", capture.device));
        }
        tags
    }
}

fn parse_url(name: &'static str, url: &str) -> Result<Url, Error> {
    let invalid = |reason: String| Error::InvalidUrl {
        name,
        url: url.to_string(),
        reason,
    };
    let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(invalid(format!("unsupported scheme '{other}'"))),
    }
}

/// Looks up the device by id and starts a sender for it.
pub async fn new_sender_with_device_id(
    device_id: u32,
    errors: mpsc::Sender<Error>,
    config: &Config,
) -> Result<Sender, Error> {
    let lookup = Arc::new(config.api_client()?);
    let device = lookup.get_device_by_id(device_id).await?;
    start_for(config, lookup, device, errors)
}

/// Looks up the device that sends from `ip` and starts a sender for it.
pub async fn new_sender_with_device_ip(
    ip: IpAddr,
    errors: mpsc::Sender<Error>,
    config: &Config,
) -> Result<Sender, Error> {
    let lookup = Arc::new(config.api_client()?);
    let device = lookup.get_device_by_ip(ip).await?;
    start_for(config, lookup, device, errors)
}

/// Looks up the device owning interface `name` and starts a sender for it.
pub async fn new_sender_with_device_if(
    name: &str,
    errors: mpsc::Sender<Error>,
    config: &Config,
) -> Result<Sender, Error> {
    let lookup = Arc::new(config.api_client()?);
    let device = lookup.get_device_by_if(name).await?;
    start_for(config, lookup, device, errors)
}

fn start_for(
    config: &Config,
    lookup: Arc<ApiClient>,
    device: Device,
    errors: mpsc::Sender<Error>,
) -> Result<Sender, Error> {
    info!(
        "Resolved device {} with a budget of {} fps",
        device.client_id(),
        device.max_flow_rate
    );
    config.start(lookup, device, errors)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config() -> Config {
        Config::new("ops@example.com", "token", "agent", "1.0.0")
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = config();
        assert!(config.validate().is_ok());
        assert_eq!(config.flow_url, DEFAULT_FLOW_URL);
        assert_eq!(config.workers, 2);
        assert_eq!(config.window, Duration::from_secs(1));
        assert_eq!(config.refresh_interval, Duration::from_secs(1200));
        assert_eq!(config.compression, None);
    }

    #[test]
    fn test_missing_credentials() {
        let config = Config::new("", "token", "agent", "1");
        assert!(matches!(
            config.validate(),
            Err(Error::MissingCredentials("email"))
        ));

        let config = Config::new("ops@example.com", "  ", "agent", "1");
        assert!(matches!(
            config.validate(),
            Err(Error::MissingCredentials("API token"))
        ));
    }

    #[test]
    fn test_invalid_urls_are_named() {
        let mut config = config();
        config.set_flow_url("not a url");
        match config.validate() {
            Err(Error::InvalidUrl { name, url, .. }) => {
                assert_eq!(name, "flow");
                assert_eq!(url, "not a url");
            }
            other => panic!("unexpected result {other:?}"),
        }

        let mut config = self::config();
        config.set_metrics_url(Some("ftp://flow.example.com/tsdb"));
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidUrl {
                name: "metrics",
                ..
            })
        ));
    }

    #[test]
    fn test_malformed_proxy_is_rejected() {
        let mut config = config();
        config.set_proxy("http://proxy.example.com:3128");
        assert!(config.validate().is_ok());

        config.set_proxy("not a proxy");
        match config.validate() {
            Err(Error::InvalidUrl { name, url, .. }) => {
                assert_eq!(name, "proxy");
                assert_eq!(url, "not a proxy");
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(matches!(
            config.api_client(),
            Err(Error::InvalidUrl { name: "proxy", .. })
        ));

        let vars: HashMap<&str, &str> = [
            ("KENTIK_EMAIL", "ops@example.com"),
            ("KENTIK_API_TOKEN", "token"),
            ("HTTPS_PROXY", "proxy.example.com:3128:bad"),
        ]
        .into_iter()
        .collect();
        assert!(matches!(
            Config::from_vars(|name| vars.get(name).map(|v| (*v).to_string())),
            Err(Error::InvalidUrl { name: "proxy", .. })
        ));
    }

    #[test]
    fn test_set_server_rewrites_all_endpoints() {
        let mut config = config();
        config.set_server("127.0.0.1", 8999).set_workers(0);
        assert_eq!(config.flow_url, "http://127.0.0.1:8999/chf");
        assert_eq!(config.api_url, "http://127.0.0.1:8999/api/internal");
        assert_eq!(
            config.metrics_url.as_deref(),
            Some("http://127.0.0.1:8999/tsdb")
        );
        assert_eq!(config.workers, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_durations_are_rejected() {
        let mut config = config();
        config.set_window(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("KENTIK_EMAIL", "ops@example.com"),
            ("KENTIK_API_TOKEN", "token"),
            ("KENTIK_API_URL", "http://localhost:8080/api"),
            ("KENTIK_METRICS_URL", ""),
            ("HTTPS_PROXY", "http://proxy:3128"),
            ("KENTIK_TIMEOUT_SECS", "5"),
        ]
        .into_iter()
        .collect();
        let config = Config::from_vars(|name| vars.get(name).map(|v| (*v).to_string())).unwrap();
        assert_eq!(config.api_url, "http://localhost:8080/api");
        assert_eq!(config.flow_url, DEFAULT_FLOW_URL);
        assert_eq!(config.metrics_url, None);
        assert_eq!(config.proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.program_name, "flow-sender");
    }

    #[test]
    fn test_from_vars_requires_credentials() {
        assert!(matches!(
            Config::from_vars(|_| None),
            Err(Error::MissingCredentials(_))
        ));
    }

    #[test]
    fn test_tags_include_capture_device() {
        let mut config = config();
        config.set_capture(Capture {
            device: "eth0".to_string(),
            snaplen: 65535,
            promisc: true,
        });
        let device = crate::updater::tests::device(1001, 0);
        let tags = config.tags(&device);
        assert!(tags.contains(&"device:42:edge:1001".to_string()));
        assert!(tags.contains(&"capture:eth0".to_string()));
    }
}
