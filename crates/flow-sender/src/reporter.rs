// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fire-and-forget push of pipeline metrics to a time-series endpoint.
//!
//! Every interval a [`Snapshot`] is converted to a list of series and POSTed
//! as JSON. Failures are logged and otherwise ignored.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::header::HeaderMap;
use reqwest::Url;
use serde::Serialize;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::constants::FINAL_REPORT_TIMEOUT;
use crate::errors::Error;
use crate::metrics::{HistogramSummary, Metrics, Snapshot};

const METRIC_PREFIX: &str = "flow_sender";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub metric: String,
    /// `[timestamp, value]` pairs.
    pub points: Vec<(i64, f64)>,
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SeriesPayload<'a> {
    series: &'a [Series],
}

pub struct MetricsReporter {
    client: reqwest::Client,
    url: Url,
    headers: HeaderMap,
    metrics: Arc<Metrics>,
    tags: Vec<String>,
    interval: Duration,
}

impl MetricsReporter {
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        url: Url,
        headers: HeaderMap,
        metrics: Arc<Metrics>,
        tags: Vec<String>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            url,
            headers,
            metrics,
            tags,
            interval,
        }
    }

    /// Pushes a snapshot every interval until `cancel` fires, then once more
    /// so the final cycle's counters are not lost. The last push gives up
    /// after [`FINAL_REPORT_TIMEOUT`].
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => self.report_quietly().await,
            }
        }
        if tokio::time::timeout(FINAL_REPORT_TIMEOUT, self.report_quietly())
            .await
            .is_err()
        {
            debug!("Final metrics report timed out after {FINAL_REPORT_TIMEOUT:?}");
        }
    }

    async fn report_quietly(&self) {
        if let Err(e) = self.report().await {
            debug!("Failed to report metrics: {e}");
        }
    }

    pub async fn report(&self) -> Result<(), Error> {
        let series = to_series(&self.metrics.snapshot(), unix_now(), &self.tags);
        let resp = self
            .client
            .post(self.url.clone())
            .headers(self.headers.clone())
            .json(&SeriesPayload { series: &series })
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Api(format!("metrics endpoint returned {status}")));
        }
        Ok(())
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

/// Converts a snapshot to one series per counter and per histogram statistic.
#[must_use]
pub fn to_series(snapshot: &Snapshot, timestamp: i64, tags: &[String]) -> Vec<Series> {
    let mut series = Vec::new();
    let mut push = |name: String, value: f64| {
        series.push(Series {
            metric: name,
            points: vec![(timestamp, value)],
            tags: tags.to_vec(),
        });
    };

    for (name, value) in snapshot.counters() {
        #[allow(clippy::cast_precision_loss)]
        push(format!("{METRIC_PREFIX}.{name}"), value as f64);
    }
    for (name, summary) in [
        ("orig_sample_rate", &snapshot.orig_sample_rate),
        ("new_sample_rate", &snapshot.new_sample_rate),
    ] {
        for (stat, value) in histogram_stats(summary) {
            push(format!("{METRIC_PREFIX}.{name}.{stat}"), value);
        }
    }
    series
}

#[allow(clippy::cast_precision_loss)]
fn histogram_stats(summary: &HistogramSummary) -> [(&'static str, f64); 5] {
    [
        ("count", summary.count as f64),
        ("min", summary.min),
        ("max", summary.max),
        ("p50", summary.p50),
        ("p95", summary.p95),
    ]
}

/// Tags attached to every reported series.
#[must_use]
pub fn default_tags(program: &str, version: &str, sender_id: &str) -> Vec<String> {
    vec![
        format!("program:{program}"),
        format!("version:{version}"),
        format!("device:{sender_id}"),
        "level:primary".to_string(),
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    #[test]
    fn test_to_series() {
        let metrics = Metrics::default();
        metrics.flows_in.add(200);
        metrics.rate_limit_drops.add(150);
        metrics.new_sample_rate.observe_all([4.0; 50]);

        let tags = default_tags("agent", "1.2.3", "42:edge:1001");
        let series = to_series(&metrics.snapshot(), 1_700_000_000, &tags);

        let flows_in = series
            .iter()
            .find(|s| s.metric == "flow_sender.flows_in")
            .unwrap();
        assert_eq!(flows_in.points, vec![(1_700_000_000, 200.0)]);
        assert!(flows_in.tags.contains(&"level:primary".to_string()));

        let count = series
            .iter()
            .find(|s| s.metric == "flow_sender.new_sample_rate.count")
            .unwrap();
        assert_eq!(count.points[0].1, 50.0);
        assert_eq!(series.len(), 9 + 2 * 5);
    }

    #[tokio::test]
    async fn test_report_posts_json_series() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/tsdb")
            .match_header("Content-Type", "application/json")
            .match_body(Matcher::PartialJson(json!({
                "series": [{"metric": "flow_sender.flows_in", "tags": ["program:agent", "version:1", "device:1:a:2", "level:primary"]}]
            })))
            .with_status(202)
            .create_async()
            .await;

        let metrics = Arc::new(Metrics::default());
        metrics.flows_in.add(5);
        let reporter = MetricsReporter::new(
            reqwest::Client::new(),
            Url::parse(&format!("{}/tsdb", server.url())).unwrap(),
            HeaderMap::new(),
            metrics,
            default_tags("agent", "1", "1:a:2"),
            Duration::from_secs(60),
        );
        reporter.report().await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_report_surfaces_rejection() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/tsdb")
            .with_status(500)
            .create_async()
            .await;

        let reporter = MetricsReporter::new(
            reqwest::Client::new(),
            Url::parse(&format!("{}/tsdb", server.url())).unwrap(),
            HeaderMap::new(),
            Arc::new(Metrics::default()),
            Vec::new(),
            Duration::from_secs(60),
        );
        assert!(matches!(reporter.report().await, Err(Error::Api(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_report_gives_up_on_silent_endpoint() {
        // Accepts connections but never answers.
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let reporter = MetricsReporter::new(
            reqwest::Client::new(),
            Url::parse(&format!("http://{}/tsdb", silent.local_addr().unwrap())).unwrap(),
            HeaderMap::new(),
            Arc::new(Metrics::default()),
            Vec::new(),
            Duration::from_secs(3600),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let run = tokio::time::timeout(FINAL_REPORT_TIMEOUT * 2, reporter.run(cancel)).await;
        assert!(run.is_ok());
        drop(silent);
    }
}
