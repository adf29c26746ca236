//! Scrape pipeline
//!
//! ```text
//! TargetWorker ─┐
//! TargetWorker ─┼──► outbox (bounded) ──► publish loop ──► broker
//! TargetWorker ─┘
//! ```
//!
//! Every configured target gets its own worker task. Workers block on the
//! bounded outbox when the publish loop stalls; that is the only
//! backpressure in the pipeline. The publish loop owns the broker
//! connection and is the only place that replaces it.

mod worker;

use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::connection::ResilientConnection;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::status::{Managed, Mode};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use streams_core::{Backoff, Broker, Pausable, RestartSignal, ScrapeMessage};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use worker::TargetWorker;

/// Capacity of the queue between target workers and the publish loop
pub const OUTBOX_CAPACITY: usize = 1000;

/// Polls every configured target and publishes the results
pub struct Poller {
    config: Arc<Config>,
    broker: Arc<dyn Broker>,
    gate: Arc<dyn Pausable>,
    backoff: Backoff,
    client: reqwest::Client,
    running: Arc<AtomicBool>,
}

impl Poller {
    /// Create a poller with its own pause gate
    pub fn new(config: Arc<Config>, broker: Arc<dyn Broker>) -> Self {
        let gate = match Metrics::get() {
            Some(metrics) => CircuitBreaker::new().with_gauge(metrics.poller_paused.clone()),
            None => CircuitBreaker::new(),
        };

        Self {
            config,
            broker,
            gate: Arc::new(gate),
            backoff: Backoff::five_sec(),
            client: reqwest::Client::new(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use an externally owned pause gate
    pub fn with_gate(mut self, gate: Arc<dyn Pausable>) -> Self {
        self.gate = gate;
        self
    }

    /// Override the reconnect schedule
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run until `cancel` fires
    ///
    /// Returns early only when the configuration has no poller stream.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let stream = self.config.poller_stream()?.clone();
        let subject = stream.topic.clone();

        let _ = Metrics::init();
        let metrics = Metrics::get();

        info!(
            version = env!("CARGO_PKG_VERSION"),
            config = ?self.config.config_file,
            "Poller starting"
        );

        let signal = RestartSignal::new();
        let Some(mut conn) = ResilientConnection::connect(
            self.broker.as_ref(),
            &cancel,
            &stream,
            &self.backoff,
            signal.listener("poller"),
        )
        .await
        else {
            info!("Poller cancelled before connecting");
            return Ok(());
        };

        self.running.store(true, Ordering::SeqCst);

        if let Some(metrics) = metrics {
            metrics.set_poller_topology(
                self.config
                    .jobs
                    .iter()
                    .map(|(name, job)| (name.as_str(), job.targets.len())),
            );
        }

        let (outbox, mut inbox) = mpsc::channel::<ScrapeMessage>(OUTBOX_CAPACITY);
        // `outbox` stays alive for the whole loop so an empty job list idles
        // instead of ending the pipeline
        let mut workers = self.spawn_workers(&outbox, &cancel);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = signal.notified() => {
                    error!(subject = %stream.topic, "Stream session lost, initiating reconnection");
                    if let Some(metrics) = metrics {
                        metrics.record_session_restart("poller");
                        metrics.poller_publish_errors.inc();
                    }

                    conn.close().await;
                    match ResilientConnection::connect(
                        self.broker.as_ref(),
                        &cancel,
                        &stream,
                        &self.backoff,
                        signal.listener("poller"),
                    )
                    .await
                    {
                        Some(fresh) => conn = fresh,
                        None => break,
                    }
                }

                next = inbox.recv() => match next {
                    Some(message) => self.publish(&conn, &subject, message).await,
                    None => break,
                },
            }
        }

        conn.close().await;
        workers.shutdown().await;
        self.running.store(false, Ordering::SeqCst);

        info!("Poller stopped");
        Ok(())
    }

    fn spawn_workers(
        &self,
        outbox: &mpsc::Sender<ScrapeMessage>,
        cancel: &CancellationToken,
    ) -> JoinSet<()> {
        let interval = self.config.interval();
        let mut workers = JoinSet::new();

        for (name, job) in &self.config.jobs {
            for target in &job.targets {
                let worker = TargetWorker {
                    job: name.clone(),
                    target: target.clone(),
                    publisher: self.config.identity.clone(),
                    interval,
                    client: self.client.clone(),
                    gate: Arc::clone(&self.gate),
                    outbox: outbox.clone(),
                };
                workers.spawn(worker.run(cancel.clone()));
            }
        }

        info!(
            jobs = self.config.jobs.len(),
            targets = workers.len(),
            "Target workers started"
        );
        workers
    }

    /// Serialize and publish one message; failures drop it
    async fn publish(&self, conn: &ResilientConnection, subject: &str, message: ScrapeMessage) {
        let start = Instant::now();
        let metrics = Metrics::get();

        let result = match message.encode() {
            Ok(encoded) => {
                let size = encoded.len();
                conn.publish(subject, Bytes::from(encoded))
                    .await
                    .map(|()| size)
            }
            Err(e) => Err(e),
        };

        if let Some(metrics) = metrics {
            metrics
                .poller_publish_time
                .observe(start.elapsed().as_secs_f64());
        }

        match result {
            Ok(size) => {
                if let Some(metrics) = metrics {
                    metrics.poller_published.inc();
                }
                debug!(
                    bytes = size,
                    subject = subject,
                    job = %message.job,
                    "Published scrape"
                );
            }
            Err(e) => {
                error!(
                    subject = subject,
                    job = %message.job,
                    instance = %message.instance,
                    error = %e,
                    "Could not publish data"
                );
                if let Some(metrics) = metrics {
                    metrics.poller_publish_errors.inc();
                }
            }
        }
    }
}

impl Managed for Poller {
    fn mode(&self) -> Mode {
        Mode::Poller
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Arc<dyn Pausable> {
        Arc::clone(&self.gate)
    }

    fn jobs(&self) -> Vec<String> {
        self.config.job_names()
    }
}
