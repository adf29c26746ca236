//! Resilient broker connection
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected ──► Closed
//!                      ▲              │
//!                      └─ SessionLost ┘   (owner: close, then connect)
//! ```
//!
//! [`ResilientConnection::connect`] keeps retrying the transport link and
//! then the session layer with the shared [`Backoff`] schedule until it
//! succeeds or the cancellation token fires. Session loss is never handled
//! here: it is surfaced through the [`SessionLost`] listener, and the owning
//! pipeline closes this handle and connects a fresh one.

pub mod memory;
pub mod nats;

pub use memory::MemoryBroker;
pub use nats::NatsBroker;

use bytes::Bytes;
use std::sync::Arc;
use streams_core::{
    Backoff, Broker, DeliveryHandler, Session, SessionLost, StageError, StreamConfig,
    SubscribeOptions, Transport,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A transport link plus the session built on it
pub struct ResilientConnection {
    name: String,
    transport: Option<Box<dyn Transport>>,
    session: Option<Box<dyn Session>>,
}

impl std::fmt::Debug for ResilientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientConnection")
            .field("name", &self.name)
            .field("transport", &self.transport.is_some())
            .field("session", &self.session.is_some())
            .finish()
    }
}

impl ResilientConnection {
    /// Connect both layers, retrying with backoff
    ///
    /// Returns `None` when `cancel` fires before a session exists. That is
    /// the shutdown path, not an error; any transport built so far is
    /// closed before returning.
    pub async fn connect(
        broker: &dyn Broker,
        cancel: &CancellationToken,
        stream: &StreamConfig,
        backoff: &Backoff,
        on_lost: SessionLost,
    ) -> Option<Self> {
        let name = stream.client_id.clone();
        let transport = Self::connect_transport(broker, cancel, stream, backoff).await?;

        let mut attempt = 0u32;
        let session = loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => None,
                result = transport.open_session(stream, on_lost.clone()) => Some(result),
            };

            match result {
                Some(Ok(session)) => break session,
                Some(Err(e)) => {
                    attempt = attempt.saturating_add(1);
                    warn!(
                        broker = broker.name(),
                        client_id = %name,
                        cluster_id = %stream.cluster_id,
                        attempt = attempt,
                        delay_ms = backoff.delay_for_attempt(attempt).as_millis() as u64,
                        error = %e,
                        "Could not create stream session, retrying"
                    );
                    if cancel.is_cancelled() || backoff.sleep(cancel, attempt).await.is_err() {
                        transport.close().await;
                        return None;
                    }
                }
                None => {
                    transport.close().await;
                    return None;
                }
            }
        };

        info!(
            broker = broker.name(),
            client_id = %name,
            cluster_id = %stream.cluster_id,
            "Stream connection established"
        );

        Some(Self {
            name,
            transport: Some(transport),
            session: Some(session),
        })
    }

    async fn connect_transport(
        broker: &dyn Broker,
        cancel: &CancellationToken,
        stream: &StreamConfig,
        backoff: &Backoff,
    ) -> Option<Box<dyn Transport>> {
        let mut attempt = 0u32;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return None,
                result = broker.connect(stream) => result,
            };

            match result {
                Ok(transport) => return Some(transport),
                Err(e) => {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    attempt = attempt.saturating_add(1);
                    warn!(
                        broker = broker.name(),
                        urls = %stream.urls,
                        attempt = attempt,
                        delay_ms = backoff.delay_for_attempt(attempt).as_millis() as u64,
                        error = %e,
                        "Initial connection to the broker failed, retrying"
                    );
                    backoff.sleep(cancel, attempt).await.ok()?;
                }
            }
        }
    }

    /// Client id this connection was built for
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a session is currently held
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Publish one payload through the session
    pub async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), StageError> {
        let session = self.session.as_ref().ok_or(StageError::NotConnected)?;
        session.publish(subject, payload).await
    }

    /// Start a durable subscription on the session
    pub async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), StageError> {
        let session = self.session.as_ref().ok_or(StageError::NotConnected)?;
        debug!(
            subject = subject,
            durable = %options.durable_name,
            max_in_flight = options.max_in_flight,
            "Subscribing"
        );
        session.subscribe(subject, options, handler).await
    }

    /// Release the session, then the transport
    ///
    /// Either layer may already be gone.
    pub async fn close(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                error!(client_id = %self.name, error = %e, "Could not close stream session");
            }
        }

        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
    }
}
