//! Push loop: inbox to push gateway

use crate::compress::decompress;
use crate::config::PushGatewayConfig;
use crate::metrics::Metrics;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use std::time::{Duration, Instant};
use streams_core::{ScrapeMessage, StageError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Connect timeout for push gateway requests
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pooled HTTP client for the push gateway; each request ends after `timeout`
pub fn client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT.min(timeout))
        .timeout(timeout)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
}

/// Push gateway grouping URL for a message
pub fn target_url(gateway: &PushGatewayConfig, message: &ScrapeMessage) -> String {
    let base = gateway.url.trim_end_matches('/');
    if gateway.publisher_label {
        format!(
            "{base}/metrics/job/{}/instance/{}/publisher/{}",
            message.job, message.instance, message.publisher
        )
    } else {
        format!(
            "{base}/metrics/job/{}/instance/{}",
            message.job, message.instance
        )
    }
}

/// Posts decompressed scrapes to the push gateway
pub struct Pusher {
    gateway: PushGatewayConfig,
    client: reqwest::Client,
}

impl Pusher {
    /// Create a pusher for `gateway`
    pub fn new(gateway: PushGatewayConfig, client: reqwest::Client) -> Self {
        Self { gateway, client }
    }

    /// Drain `inbox` until cancelled or every sender is gone
    pub async fn run(self, mut inbox: mpsc::Receiver<ScrapeMessage>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = inbox.recv() => match next {
                    Some(message) => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = self.handle(message) => {}
                        }
                    }
                    None => break,
                },
            }
        }
        debug!("Push loop stopped");
    }

    async fn handle(&self, message: ScrapeMessage) {
        let start = Instant::now();
        let result = self.push(&message).await;

        let metrics = Metrics::get();
        if let Some(metrics) = metrics {
            metrics
                .receiver_publish_time
                .observe(start.elapsed().as_secs_f64());
        }

        match result {
            Ok(bytes) => {
                debug!(
                    job = %message.job,
                    instance = %message.instance,
                    bytes = bytes,
                    "Posted scrape"
                );
            }
            Err(e) => {
                error!(
                    job = %message.job,
                    instance = %message.instance,
                    error = %e,
                    "Posting to the push gateway failed"
                );
                if let Some(metrics) = metrics {
                    metrics.record_receiver_error(&message.job);
                }
            }
        }
    }

    /// Decompress and post one message; only 202 Accepted is success
    pub async fn push(&self, message: &ScrapeMessage) -> Result<usize, StageError> {
        let body = decompress(&message.scrape)?;
        let size = body.len();
        let url = target_url(&self.gateway, message);

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "text/plain")
            .body(body)
            .send()
            .await
            .map_err(|e| StageError::Push(format!("{url}: {e}")))?;

        let status = response.status();
        if status != StatusCode::ACCEPTED {
            let detail = response.text().await.unwrap_or_default();
            return Err(StageError::Push(format!("{url}: {status}: {}", detail.trim())));
        }

        Ok(size)
    }
}
