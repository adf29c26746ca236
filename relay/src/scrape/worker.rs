//! Per-target polling worker

use crate::compress::compress;
use crate::config::SELF_MONITOR_JOB;
use crate::metrics::Metrics;
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use streams_core::{Pausable, ScrapeMessage, StageError, Target};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Polls one target on a fixed interval and feeds the outbox
///
/// Polls of the same target never overlap: the next tick is only awaited
/// after the previous poll, including a blocked enqueue, has finished.
pub(crate) struct TargetWorker {
    pub(crate) job: String,
    pub(crate) target: Target,
    pub(crate) publisher: String,
    pub(crate) interval: Duration,
    pub(crate) client: reqwest::Client,
    pub(crate) gate: Arc<dyn Pausable>,
    pub(crate) outbox: mpsc::Sender<ScrapeMessage>,
}

impl TargetWorker {
    /// Poll immediately, then on every tick until cancelled
    pub(crate) async fn run(self, cancel: CancellationToken) {
        info!(
            job = %self.job,
            target = %self.target.name,
            url = %self.target.url,
            interval = %humantime::format_duration(self.interval),
            "Polling target"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(StageError::Cancelled) = self.poll(&cancel).await {
                break;
            }
        }

        debug!(job = %self.job, target = %self.target.name, "Target worker stopped");
    }

    /// One cycle; only cancellation is returned, everything else is logged
    /// and counted here
    async fn poll(&self, cancel: &CancellationToken) -> Result<(), StageError> {
        let start = Instant::now();
        let result = self.poll_once(cancel).await;

        let metrics = Metrics::get();
        if let Some(metrics) = metrics {
            metrics.record_poll_time(
                &self.job,
                &self.target.name,
                start.elapsed().as_secs_f64(),
            );
        }

        match result {
            Ok(()) => Ok(()),
            Err(StageError::Cancelled) => Err(StageError::Cancelled),
            Err(e) => {
                error!(
                    job = %self.job,
                    target = %self.target.name,
                    url = %self.target.url,
                    error = %e,
                    "Poll failed"
                );
                if let Some(metrics) = metrics {
                    metrics.record_poll_error(&self.job, &self.target.name);
                }
                Ok(())
            }
        }
    }

    async fn poll_once(&self, cancel: &CancellationToken) -> Result<(), StageError> {
        if self.gate.paused() && self.job != SELF_MONITOR_JOB {
            warn!(job = %self.job, target = %self.target.name, "Skipping poll while paused");
            return Ok(());
        }

        debug!(job = %self.job, target = %self.target.name, url = %self.target.url, "Polling");

        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StageError::Cancelled),
            body = self.fetch() => body?,
        };

        if let Some(metrics) = Metrics::get() {
            metrics.record_bytes_polled(&self.job, &self.target.name, body.len());
        }

        let compressed = compress(&body)?;
        let message = ScrapeMessage::new(
            self.job.as_str(),
            self.target.name.as_str(),
            self.publisher.as_str(),
            Bytes::from(compressed),
        );

        // Blocks while the outbox is full
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StageError::Cancelled),
            sent = self.outbox.send(message) => sent.map_err(|_| StageError::Cancelled)?,
        }

        debug!(job = %self.job, target = %self.target.name, bytes = body.len(), "Completed poll");
        Ok(())
    }

    async fn fetch(&self) -> Result<Bytes, StageError> {
        let response = self
            .client
            .get(&self.target.url)
            .timeout(self.interval)
            .send()
            .await
            .map_err(|e| StageError::Fetch(e.to_string()))?;

        let status = response.status();
        if status.as_u16() >= 300 {
            return Err(StageError::Fetch(status.to_string()));
        }

        response
            .bytes()
            .await
            .map_err(|e| StageError::Fetch(format!("reading body: {e}")))
    }
}
