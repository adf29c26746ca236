//! NATS JetStream binding
//!
//! - transport: a core NATS client named after the stream `client_id`,
//!   reconnecting without limit on its own
//! - session: a JetStream context; `cluster_id` names the JetStream stream
//!   that stores the subject
//! - subscribe: a durable pull consumer with explicit acks, drained by one
//!   spawned task per subscription
//!
//! The client reports `Closed` once it gives up for good. That, a deleted
//! consumer, a run of delivery errors (missed heartbeats while the server
//! is away) and a subscription's message stream ending are reported as
//! session loss.

use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, consumer::DeliverPolicy};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use streams_core::{
    Broker, Delivery, DeliveryHandler, Session, SessionLost, StageError, StreamConfig,
    SubscribeOptions, Transport,
};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Session-loss listener installed by the current session, if any
type LostSlot = Arc<Mutex<Option<SessionLost>>>;

/// Broker backed by a NATS server with JetStream enabled
#[derive(Debug, Default, Clone, Copy)]
pub struct NatsBroker;

impl NatsBroker {
    /// Create the binding
    pub fn new() -> Self {
        Self
    }
}

/// Normalise a comma separated URL list
fn server_list(urls: &str) -> String {
    urls.split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl Broker for NatsBroker {
    fn name(&self) -> &'static str {
        "nats"
    }

    async fn connect(&self, stream: &StreamConfig) -> Result<Box<dyn Transport>, StageError> {
        let servers = server_list(&stream.urls);
        if servers.is_empty() {
            return Err(StageError::Connection("no broker urls configured".to_string()));
        }

        let slot: LostSlot = Arc::new(Mutex::new(None));
        let events = Arc::clone(&slot);
        let name = stream.client_id.clone();
        let event_name = name.clone();

        let client = async_nats::ConnectOptions::new()
            .name(&name)
            .max_reconnects(None)
            .event_callback(move |event| {
                let slot = Arc::clone(&events);
                let name = event_name.clone();
                async move {
                    match event {
                        async_nats::Event::Connected => {
                            info!(client_id = %name, "Broker connection re-established");
                        }
                        async_nats::Event::Disconnected => {
                            warn!(client_id = %name, "Broker connection lost, client is reconnecting");
                        }
                        async_nats::Event::Closed => {
                            if let Some(on_lost) = slot.lock().as_ref() {
                                on_lost.fire("broker connection closed");
                            }
                        }
                        other => {
                            debug!(client_id = %name, event = ?other, "Broker event");
                        }
                    }
                }
            })
            .connect(servers.as_str())
            .await
            .map_err(|e| StageError::Connection(e.to_string()))?;

        info!(client_id = %name, urls = %servers, "Connected to the broker");

        Ok(Box::new(NatsTransport {
            client: Mutex::new(Some(client)),
            slot,
        }))
    }
}

struct NatsTransport {
    client: Mutex<Option<async_nats::Client>>,
    slot: LostSlot,
}

#[async_trait]
impl Transport for NatsTransport {
    async fn open_session(
        &self,
        stream: &StreamConfig,
        on_lost: SessionLost,
    ) -> Result<Box<dyn Session>, StageError> {
        let client = self.client.lock().clone().ok_or(StageError::NotConnected)?;
        let context = jetstream::new(client);

        // Fail fast when the backing stream does not exist
        context
            .get_stream(&stream.cluster_id)
            .await
            .map_err(|e| {
                StageError::Connection(format!("stream {}: {e}", stream.cluster_id))
            })?;

        *self.slot.lock() = Some(on_lost.clone());

        Ok(Box::new(NatsSession {
            context,
            cluster_id: stream.cluster_id.clone(),
            on_lost,
            cancel: CancellationToken::new(),
        }))
    }

    async fn close(&self) {
        self.slot.lock().take();
        let client = self.client.lock().take();
        if let Some(client) = client {
            if let Err(e) = client.flush().await {
                debug!(error = %e, "Flush on close failed");
            }
        }
    }
}

struct NatsSession {
    context: jetstream::Context,
    cluster_id: String,
    on_lost: SessionLost,
    cancel: CancellationToken,
}

#[async_trait]
impl Session for NatsSession {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), StageError> {
        let ack = self
            .context
            .publish(subject.to_string(), payload)
            .await
            .map_err(|e| StageError::Publish(e.to_string()))?;
        ack.await.map_err(|e| StageError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), StageError> {
        let stream = self
            .context
            .get_stream(&self.cluster_id)
            .await
            .map_err(|e| StageError::Connection(format!("stream {}: {e}", self.cluster_id)))?;

        let consumer: jetstream::consumer::PullConsumer = stream
            .get_or_create_consumer(
                &options.durable_name,
                pull::Config {
                    durable_name: Some(options.durable_name.clone()),
                    deliver_policy: if options.deliver_all {
                        DeliverPolicy::All
                    } else {
                        DeliverPolicy::New
                    },
                    ack_policy: AckPolicy::Explicit,
                    max_ack_pending: options.max_in_flight as i64,
                    filter_subject: subject.to_string(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| StageError::Connection(format!("consumer: {e}")))?;

        let messages = consumer
            .messages()
            .await
            .map_err(|e| StageError::Connection(format!("consumer stream: {e}")))?
            .map(|next| next.map(|message| Box::new(NatsDelivery { message }) as Box<dyn Delivery>));

        tokio::spawn(drain(
            Box::pin(messages),
            handler,
            self.cancel.clone(),
            self.on_lost.clone(),
            options.durable_name,
            is_terminal as fn(&pull::MessagesError) -> bool,
        ));

        Ok(())
    }

    async fn close(&self) -> Result<(), StageError> {
        self.cancel.cancel();
        Ok(())
    }
}

/// Consecutive delivery errors tolerated before the subscription is lost
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Consumer errors that no amount of waiting recovers from
fn is_terminal(err: &pull::MessagesError) -> bool {
    matches!(
        err.kind(),
        pull::MessagesErrorKind::ConsumerDeleted | pull::MessagesErrorKind::PushBasedConsumer
    )
}

/// Feed deliveries to `handler` until cancelled or the subscription dies
///
/// A terminal error, `MAX_CONSECUTIVE_ERRORS` errors in a row, or the end
/// of the stream fire `on_lost`. A delivered message resets the error run.
async fn drain<S, E>(
    mut messages: S,
    handler: Arc<dyn DeliveryHandler>,
    cancel: CancellationToken,
    on_lost: SessionLost,
    durable: String,
    terminal: fn(&E) -> bool,
) where
    S: Stream<Item = Result<Box<dyn Delivery>, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut errors = 0u32;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            next = messages.next() => match next {
                Some(Ok(delivery)) => {
                    errors = 0;
                    handler.handle(delivery).await;
                }
                Some(Err(e)) => {
                    errors += 1;
                    warn!(durable = %durable, error = %e, errors = errors, "Subscription delivery error");
                    if terminal(&e) {
                        on_lost.fire("consumer is gone");
                        return;
                    }
                    if errors >= MAX_CONSECUTIVE_ERRORS {
                        on_lost.fire("subscription keeps failing");
                        return;
                    }
                }
                None => {
                    on_lost.fire("subscription stream ended");
                    return;
                }
            },
        }
    }
}

struct NatsDelivery {
    message: jetstream::Message,
}

#[async_trait]
impl Delivery for NatsDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    async fn ack(&self) -> Result<(), StageError> {
        self.message.ack().await.map_err(|e| {
            error!(error = %e, "Could not acknowledge message");
            StageError::Connection(format!("ack: {e}"))
        })
    }
}
