//! Prometheus metrics for the relay

use crate::error::{RelayError, Result};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramVec, TextEncoder,
    register_counter, register_counter_vec, register_gauge, register_gauge_vec,
    register_histogram, register_histogram_vec,
};
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Buckets for publish/push/poll durations: 1ms to 30s
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Buckets for (de)compression durations: 10us to 1s
const CODEC_BUCKETS: &[f64] = &[0.00001, 0.0001, 0.001, 0.01, 0.1, 1.0];

/// All relay metrics
pub struct Metrics {
    // ─────────────────────────────────────────────────────────────────────────
    // Poller
    // ─────────────────────────────────────────────────────────────────────────
    /// Configured jobs
    pub poller_jobs: Gauge,

    /// Configured targets (by job)
    pub poller_targets: GaugeVec,

    /// Scrape messages published to the broker
    pub poller_published: Counter,

    /// Serialize or broker send failures
    pub poller_publish_errors: Counter,

    /// Failed polls (by job, target)
    pub poller_poll_errors: CounterVec,

    /// Bytes fetched from targets (by job, target)
    pub poller_bytes_polled: CounterVec,

    /// Publish duration in seconds
    pub poller_publish_time: Histogram,

    /// Compression duration in seconds
    pub poller_compress_time: Histogram,

    /// Poll duration in seconds (by job, target)
    pub poller_poll_time: HistogramVec,

    /// 1 while the poller is paused
    pub poller_paused: Gauge,

    // ─────────────────────────────────────────────────────────────────────────
    // Receiver
    // ─────────────────────────────────────────────────────────────────────────
    /// Messages received, including aged and paused ones
    pub receiver_received: Counter,

    /// Decode and push failures (by job, "unknown" when undecodable)
    pub receiver_publish_errors: CounterVec,

    /// Messages discarded for exceeding max_age (by job)
    pub receiver_aged_discards: CounterVec,

    /// Decompression duration in seconds
    pub receiver_decompress_time: Histogram,

    /// Push duration in seconds
    pub receiver_publish_time: Histogram,

    /// Unix time data was last seen from a publisher
    pub receiver_seen_time: GaugeVec,

    /// 1 while the receiver is paused
    pub receiver_paused: Gauge,

    // ─────────────────────────────────────────────────────────────────────────
    // Connection
    // ─────────────────────────────────────────────────────────────────────────
    /// Session losses that triggered a reconnect (by component)
    pub session_restarts: CounterVec,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            // ─────────────────────────────────────────────────────────────────
            // Poller
            // ─────────────────────────────────────────────────────────────────
            poller_jobs: register_gauge!(
                "prometheus_streams_poller_jobs",
                "How many jobs are configured"
            )
            .map_err(|e| RelayError::Metrics(format!("poller_jobs: {e}")))?,

            poller_targets: register_gauge_vec!(
                "prometheus_streams_poller_targets",
                "How many targets are configured",
                &["poller_job"]
            )
            .map_err(|e| RelayError::Metrics(format!("poller_targets: {e}")))?,

            poller_published: register_counter!(
                "prometheus_streams_poller_published_count",
                "How many messages containing scrapes were published"
            )
            .map_err(|e| RelayError::Metrics(format!("poller_published: {e}")))?,

            poller_publish_errors: register_counter!(
                "prometheus_streams_poller_publish_errors",
                "Errors encountered during publishes"
            )
            .map_err(|e| RelayError::Metrics(format!("poller_publish_errors: {e}")))?,

            poller_poll_errors: register_counter_vec!(
                "prometheus_streams_poller_poll_errors",
                "Errors encountered during polls",
                &["poller_job", "poller_target"]
            )
            .map_err(|e| RelayError::Metrics(format!("poller_poll_errors: {e}")))?,

            poller_bytes_polled: register_counter_vec!(
                "prometheus_streams_poller_bytes_polled",
                "How many bytes were polled from a target",
                &["poller_job", "poller_target"]
            )
            .map_err(|e| RelayError::Metrics(format!("poller_bytes_polled: {e}")))?,

            poller_publish_time: register_histogram!(
                "prometheus_streams_poller_publish_time",
                "How long it took to publish messages to the stream",
                LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| RelayError::Metrics(format!("poller_publish_time: {e}")))?,

            poller_compress_time: register_histogram!(
                "prometheus_streams_poller_compress_time",
                "How long it takes to compress messages",
                CODEC_BUCKETS.to_vec()
            )
            .map_err(|e| RelayError::Metrics(format!("poller_compress_time: {e}")))?,

            poller_poll_time: register_histogram_vec!(
                "prometheus_streams_poller_poll_time",
                "How long it takes to poll targets",
                &["poller_job", "poller_target"],
                LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| RelayError::Metrics(format!("poller_poll_time: {e}")))?,

            poller_paused: register_gauge!(
                "prometheus_streams_poller_paused",
                "Indicates if the poller is paused"
            )
            .map_err(|e| RelayError::Metrics(format!("poller_paused: {e}")))?,

            // ─────────────────────────────────────────────────────────────────
            // Receiver
            // ─────────────────────────────────────────────────────────────────
            receiver_received: register_counter!(
                "prometheus_streams_receiver_received",
                "Total number of received messages including too old ones"
            )
            .map_err(|e| RelayError::Metrics(format!("receiver_received: {e}")))?,

            receiver_publish_errors: register_counter_vec!(
                "prometheus_streams_receiver_publish_errors",
                "Errors encountered during pushing to the push gateway",
                &["receiver_job"]
            )
            .map_err(|e| RelayError::Metrics(format!("receiver_publish_errors: {e}")))?,

            receiver_aged_discards: register_counter_vec!(
                "prometheus_streams_receiver_aged_discards",
                "Messages that got discarded due to age",
                &["receiver_job"]
            )
            .map_err(|e| RelayError::Metrics(format!("receiver_aged_discards: {e}")))?,

            receiver_decompress_time: register_histogram!(
                "prometheus_streams_receiver_decompress_time",
                "How long it takes to decompress messages",
                CODEC_BUCKETS.to_vec()
            )
            .map_err(|e| RelayError::Metrics(format!("receiver_decompress_time: {e}")))?,

            receiver_publish_time: register_histogram!(
                "prometheus_streams_receiver_publish_time",
                "How long it takes to publish to the push gateway",
                LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| RelayError::Metrics(format!("receiver_publish_time: {e}")))?,

            receiver_seen_time: register_gauge_vec!(
                "prometheus_streams_receiver_seen_time",
                "When data from a publisher was last received",
                &["publisher"]
            )
            .map_err(|e| RelayError::Metrics(format!("receiver_seen_time: {e}")))?,

            receiver_paused: register_gauge!(
                "prometheus_streams_receiver_paused",
                "Indicates if the receiver is paused"
            )
            .map_err(|e| RelayError::Metrics(format!("receiver_paused: {e}")))?,

            // ─────────────────────────────────────────────────────────────────
            // Connection
            // ─────────────────────────────────────────────────────────────────
            session_restarts: register_counter_vec!(
                "prometheus_streams_session_restarts",
                "Broker sessions rebuilt after a session loss",
                &["component"]
            )
            .map_err(|e| RelayError::Metrics(format!("session_restarts: {e}")))?,
        };

        // Set the metrics (only succeeds once)
        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| RelayError::Metrics("Failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Poller helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Record the configured job and per-job target counts
    pub fn set_poller_topology<'a>(&self, jobs: impl Iterator<Item = (&'a str, usize)>) {
        let mut job_count = 0usize;
        for (job, targets) in jobs {
            job_count += 1;
            self.poller_targets
                .with_label_values(&[job])
                .set(targets as f64);
        }
        self.poller_jobs.set(job_count as f64);
    }

    /// Record a failed poll
    pub fn record_poll_error(&self, job: &str, target: &str) {
        self.poller_poll_errors
            .with_label_values(&[job, target])
            .inc();
    }

    /// Record the body size of a successful poll
    pub fn record_bytes_polled(&self, job: &str, target: &str, bytes: usize) {
        self.poller_bytes_polled
            .with_label_values(&[job, target])
            .inc_by(bytes as f64);
    }

    /// Record a poll duration
    pub fn record_poll_time(&self, job: &str, target: &str, seconds: f64) {
        self.poller_poll_time
            .with_label_values(&[job, target])
            .observe(seconds);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Receiver helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a dropped inbound message (decode or push failure)
    pub fn record_receiver_error(&self, job: &str) {
        self.receiver_publish_errors.with_label_values(&[job]).inc();
    }

    /// Record a message discarded for its age
    pub fn record_aged_discard(&self, job: &str) {
        self.receiver_aged_discards.with_label_values(&[job]).inc();
    }

    /// Record when data from a publisher was last seen
    pub fn set_seen_time(&self, publisher: &str, unix_secs: i64) {
        self.receiver_seen_time
            .with_label_values(&[publisher])
            .set(unix_secs as f64);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Connection helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a session rebuild
    pub fn record_session_restart(&self, component: &str) {
        self.session_restarts.with_label_values(&[component]).inc();
    }
}

/// Gather all metrics and encode as Prometheus text format
///
/// Returns the metrics as a String, ready to be served via HTTP.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}
