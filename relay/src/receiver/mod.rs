//! Receive pipeline
//!
//! ```text
//! broker ──► ScrapeHandler ──► inbox (10) ──► Pusher ──► push gateway
//!            (ack first)
//! ```
//!
//! Deliveries are acknowledged before anything else happens, so a message
//! is seen at most once here whatever its fate downstream. The inbox is
//! small on purpose: a slow push gateway blocks the handler, the broker's
//! in-flight cap fills up, and delivery stops.

mod push;

pub use push::{Pusher, target_url};

use crate::circuit_breaker::CircuitBreaker;
use crate::config::Config;
use crate::connection::ResilientConnection;
use crate::error::{RelayError, Result};
use crate::metrics::Metrics;
use crate::status::{Managed, Mode};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use streams_core::message::unix_now;
use streams_core::{
    Backoff, Broker, Delivery, DeliveryHandler, Pausable, RestartSignal, ScrapeMessage,
    StreamConfig, SubscribeOptions,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Capacity of the queue between the subscription handler and the push loop
pub const INBOX_CAPACITY: usize = 10;

/// Unacknowledged deliveries the broker may have outstanding
pub const MAX_IN_FLIGHT: usize = 10;

/// Subscription handler for scrape messages
pub struct ScrapeHandler {
    gate: Arc<dyn Pausable>,
    max_age: i64,
    inbox: mpsc::Sender<ScrapeMessage>,
    cancel: CancellationToken,
}

impl ScrapeHandler {
    /// Create a handler feeding `inbox`
    ///
    /// Messages older than `max_age` seconds are discarded; 0 disables the
    /// check.
    pub fn new(
        gate: Arc<dyn Pausable>,
        max_age: i64,
        inbox: mpsc::Sender<ScrapeMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            gate,
            max_age,
            inbox,
            cancel,
        }
    }
}

#[async_trait]
impl DeliveryHandler for ScrapeHandler {
    async fn handle(&self, delivery: Box<dyn Delivery>) {
        if let Err(e) = delivery.ack().await {
            warn!(error = %e, "Could not acknowledge message");
        }

        let metrics = Metrics::get();
        if let Some(metrics) = metrics {
            metrics.receiver_received.inc();
        }

        if self.gate.paused() {
            return;
        }

        let message = match ScrapeMessage::decode(delivery.payload()) {
            Ok(message) => message,
            Err(e) => {
                error!(error = %e, "Handling failed");
                if let Some(metrics) = metrics {
                    metrics.record_receiver_error("unknown");
                }
                return;
            }
        };

        let now = unix_now();
        if self.max_age > 0 {
            let age = message.age_at(now);
            if age > self.max_age {
                warn!(
                    age = age,
                    instance = %message.instance,
                    max_age = self.max_age,
                    "Discarding old metric"
                );
                if let Some(metrics) = metrics {
                    metrics.record_aged_discard(&message.job);
                }
                return;
            }
        }

        if let Some(metrics) = metrics {
            metrics.set_seen_time(&message.publisher, now);
        }

        // Blocks while the inbox is full
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.inbox.send(message) => {}
        }
    }
}

/// Consumes scrape messages and pushes them to the push gateway
pub struct Receiver {
    config: Arc<Config>,
    broker: Arc<dyn Broker>,
    gate: Arc<dyn Pausable>,
    backoff: Backoff,
    running: Arc<AtomicBool>,
}

impl Receiver {
    /// Create a receiver with its own pause gate
    pub fn new(config: Arc<Config>, broker: Arc<dyn Broker>) -> Self {
        let gate = match Metrics::get() {
            Some(metrics) => CircuitBreaker::new().with_gauge(metrics.receiver_paused.clone()),
            None => CircuitBreaker::new(),
        };

        Self {
            config,
            broker,
            gate: Arc::new(gate),
            backoff: Backoff::five_sec(),
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
    /// Returns early only when the receiver stream or push gateway is not
    /// configured.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let stream = self.config.receiver_stream()?.clone();
        let gateway = self.config.push_gateway()?.clone();

        let client = push::client(self.config.interval())
            .map_err(|e| RelayError::Config(format!("http client: {e}")))?;

        let _ = Metrics::init();
        let metrics = Metrics::get();

        info!(
            version = env!("CARGO_PKG_VERSION"),
            config = ?self.config.config_file,
            "Receiver starting"
        );

        let (inbox, pending) = mpsc::channel(INBOX_CAPACITY);
        let handler: Arc<dyn DeliveryHandler> = Arc::new(ScrapeHandler::new(
            Arc::clone(&self.gate),
            self.config.max_age,
            inbox,
            cancel.clone(),
        ));

        let signal = RestartSignal::new();
        let Some(mut conn) = self.establish(&cancel, &stream, &signal, &handler).await else {
            info!("Receiver cancelled before connecting");
            return Ok(());
        };

        self.running.store(true, Ordering::SeqCst);
        let pusher = tokio::spawn(Pusher::new(gateway, client).run(pending, cancel.clone()));

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = signal.notified() => {
                    error!(subject = %stream.topic, "Stream session lost, initiating reconnection");
                    if let Some(metrics) = metrics {
                        metrics.record_session_restart("receiver");
                        metrics.record_receiver_error("unknown");
                    }

                    conn.close().await;
                    match self.establish(&cancel, &stream, &signal, &handler).await {
                        Some(fresh) => conn = fresh,
                        None => break,
                    }
                }
            }
        }

        conn.close().await;
        if let Err(e) = pusher.await {
            error!(error = %e, "Push loop ended abnormally");
        }
        self.running.store(false, Ordering::SeqCst);

        info!("Receiver stopped");
        Ok(())
    }

    /// Connect and subscribe, retrying both until cancelled
    async fn establish(
        &self,
        cancel: &CancellationToken,
        stream: &StreamConfig,
        signal: &RestartSignal,
        handler: &Arc<dyn DeliveryHandler>,
    ) -> Option<ResilientConnection> {
        let mut attempt = 0u32;
        loop {
            let mut conn = ResilientConnection::connect(
                self.broker.as_ref(),
                cancel,
                stream,
                &self.backoff,
                signal.listener("receiver"),
            )
            .await?;

            let options = SubscribeOptions::durable(stream.client_id.clone(), MAX_IN_FLIGHT);
            match conn
                .subscribe(&stream.topic, options, Arc::clone(handler))
                .await
            {
                Ok(()) => {
                    info!(
                        subject = %stream.topic,
                        durable = %stream.client_id,
                        "Subscribed"
                    );
                    return Some(conn);
                }
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    error!(
                        subject = %stream.topic,
                        attempt = attempt,
                        error = %e,
                        "Could not subscribe, reconnecting"
                    );
                    conn.close().await;
                    self.backoff.sleep(cancel, attempt).await.ok()?;
                }
            }
        }
    }
}

impl Managed for Receiver {
    fn mode(&self) -> Mode {
        Mode::Receiver
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
