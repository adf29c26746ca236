//! In-process broker
//!
//! Keeps one append-only log per subject and one cursor per durable name, so
//! a resubscribe with the same durable identity resumes where the previous
//! subscription stopped. Unacknowledged deliveries are handed out again on
//! resubscribe: the cursor rewinds to the oldest unacknowledged entry, so
//! entries after it are redelivered even when they were acknowledged. A
//! handler that acks on receipt sees at most one such replay per
//! resubscribe. Failure injection lets tests exercise the reconnect paths.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use streams_core::{
    Broker, Delivery, DeliveryHandler, Session, SessionLost, StageError, StreamConfig,
    SubscribeOptions, Transport,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Durable {
    subject: String,
    cursor: usize,
    unacked: BTreeSet<usize>,
}

struct LiveSession {
    id: u64,
    cancel: CancellationToken,
    on_lost: SessionLost,
}

#[derive(Default)]
struct State {
    subjects: HashMap<String, Vec<Bytes>>,
    durables: HashMap<String, Durable>,
    live: Vec<LiveSession>,
    next_session: u64,
    connects: u64,
    sessions: u64,
    acked: u64,
    fail_connects: u32,
    fail_sessions: u32,
    fail_publishes: u32,
}

struct Inner {
    state: Mutex<State>,
    changed: watch::Sender<u64>,
}

impl Inner {
    fn bump(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }
}

/// Broker that lives entirely in this process
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Create an empty broker
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changed,
            }),
        }
    }

    /// Fail the next `n` transport connects
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.state.lock().fail_connects = n;
    }

    /// Fail the next `n` session opens
    pub fn fail_next_sessions(&self, n: u32) {
        self.inner.state.lock().fail_sessions = n;
    }

    /// Fail the next `n` publishes
    pub fn fail_next_publishes(&self, n: u32) {
        self.inner.state.lock().fail_publishes = n;
    }

    /// Kill every live session and report the loss to its owner
    pub fn drop_session(&self) {
        let live = std::mem::take(&mut self.inner.state.lock().live);
        for session in live {
            session.cancel.cancel();
            session.on_lost.fire("memory session dropped");
        }
        self.inner.bump();
    }

    /// Successful transport connects so far
    pub fn connect_count(&self) -> u64 {
        self.inner.state.lock().connects
    }

    /// Successful session opens so far
    pub fn session_count(&self) -> u64 {
        self.inner.state.lock().sessions
    }

    /// Sessions currently alive
    pub fn live_sessions(&self) -> usize {
        self.inner.state.lock().live.len()
    }

    /// Every payload stored on `subject`, in publish order
    pub fn published(&self, subject: &str) -> Vec<Bytes> {
        self.inner
            .state
            .lock()
            .subjects
            .get(subject)
            .cloned()
            .unwrap_or_default()
    }

    /// Store a payload directly, bypassing any session
    pub fn inject(&self, subject: &str, payload: Bytes) {
        self.inner
            .state
            .lock()
            .subjects
            .entry(subject.to_string())
            .or_default()
            .push(payload);
        self.inner.bump();
    }

    /// Acknowledgements received so far
    pub fn acked_count(&self) -> u64 {
        self.inner.state.lock().acked
    }

    /// Deliveries handed out but not yet acknowledged
    pub fn unacked_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .durables
            .values()
            .map(|d| d.unacked.len())
            .sum()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, stream: &StreamConfig) -> Result<Box<dyn Transport>, StageError> {
        let mut state = self.inner.state.lock();
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(StageError::Connection(format!(
                "memory broker refused {}",
                stream.urls
            )));
        }
        state.connects += 1;

        Ok(Box::new(MemoryTransport {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MemoryTransport {
    inner: Arc<Inner>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_session(
        &self,
        stream: &StreamConfig,
        on_lost: SessionLost,
    ) -> Result<Box<dyn Session>, StageError> {
        let mut state = self.inner.state.lock();
        if state.fail_sessions > 0 {
            state.fail_sessions -= 1;
            return Err(StageError::Connection(format!(
                "memory broker has no stream {}",
                stream.cluster_id
            )));
        }

        state.sessions += 1;
        state.next_session += 1;
        let id = state.next_session;
        let cancel = CancellationToken::new();
        state.live.push(LiveSession {
            id,
            cancel: cancel.clone(),
            on_lost,
        });

        Ok(Box::new(MemorySession {
            id,
            inner: Arc::clone(&self.inner),
            cancel,
        }))
    }

    async fn close(&self) {}
}

struct MemorySession {
    id: u64,
    inner: Arc<Inner>,
    cancel: CancellationToken,
}

#[async_trait]
impl Session for MemorySession {
    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            return Err(StageError::SessionLost("memory session is gone".to_string()));
        }

        {
            let mut state = self.inner.state.lock();
            if state.fail_publishes > 0 {
                state.fail_publishes -= 1;
                return Err(StageError::Publish("memory broker rejected publish".to_string()));
            }
            state
                .subjects
                .entry(subject.to_string())
                .or_default()
                .push(payload);
        }
        self.inner.bump();
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            return Err(StageError::SessionLost("memory session is gone".to_string()));
        }

        {
            let mut state = self.inner.state.lock();
            let stored = state.subjects.get(subject).map_or(0, Vec::len);
            let durable = state
                .durables
                .entry(options.durable_name.clone())
                .or_insert_with(|| Durable {
                    subject: subject.to_string(),
                    cursor: if options.deliver_all { 0 } else { stored },
                    unacked: BTreeSet::new(),
                });
            durable.subject = subject.to_string();
            // Rewind past everything after the oldest unacked entry, acked or not
            if let Some(&first) = durable.unacked.first() {
                durable.cursor = first;
                durable.unacked.clear();
            }
        }

        let inner = Arc::clone(&self.inner);
        let cancel = self.cancel.clone();
        let durable = options.durable_name;
        let max_in_flight = options.max_in_flight.max(1);
        let mut changed = inner.changed.subscribe();

        tokio::spawn(async move {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                let _ = changed.borrow_and_update();

                let next = {
                    let mut state = inner.state.lock();
                    let State {
                        subjects, durables, ..
                    } = &mut *state;
                    durables.get_mut(&durable).and_then(|d| {
                        let log = subjects.get(&d.subject)?;
                        if d.unacked.len() >= max_in_flight || d.cursor >= log.len() {
                            return None;
                        }
                        let index = d.cursor;
                        d.cursor += 1;
                        d.unacked.insert(index);
                        Some((index, log[index].clone()))
                    })
                };

                match next {
                    Some((index, payload)) => {
                        debug!(durable = %durable, index = index, "Delivering");
                        let delivery = MemoryDelivery {
                            inner: Arc::clone(&inner),
                            durable: durable.clone(),
                            index,
                            payload,
                        };
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            _ = handler.handle(Box::new(delivery)) => {}
                        }
                    }
                    None => {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            res = changed.changed() => {
                                if res.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn close(&self) -> Result<(), StageError> {
        self.cancel.cancel();
        self.inner.state.lock().live.retain(|s| s.id != self.id);
        Ok(())
    }
}

struct MemoryDelivery {
    inner: Arc<Inner>,
    durable: String,
    index: usize,
    payload: Bytes,
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(&self) -> Result<(), StageError> {
        {
            let mut state = self.inner.state.lock();
            let removed = state
                .durables
                .get_mut(&self.durable)
                .is_some_and(|d| d.unacked.remove(&self.index));
            if removed {
                state.acked += 1;
            }
        }
        self.inner.bump();
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use streams_core::RestartSignal;
    use tokio::sync::mpsc;

    struct Forward {
        tx: mpsc::UnboundedSender<Bytes>,
        ack: bool,
    }

    #[async_trait]
    impl DeliveryHandler for Forward {
        async fn handle(&self, delivery: Box<dyn Delivery>) {
            if self.ack {
                delivery.ack().await.unwrap();
            }
            let _ = self
                .tx
                .send(Bytes::copy_from_slice(delivery.payload()));
        }
    }

    async fn session(broker: &MemoryBroker, signal: &RestartSignal) -> Box<dyn Session> {
        let stream = StreamConfig::default();
        let transport = broker.connect(&stream).await.unwrap();
        transport
            .open_session(&stream, signal.listener("memory"))
            .await
            .unwrap()
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Bytes {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn durable_cursor_survives_resubscribe() {
        let broker = MemoryBroker::new();
        let signal = RestartSignal::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Forward { tx, ack: true });

        let first = session(&broker, &signal).await;
        first.publish("s", Bytes::from_static(b"a")).await.unwrap();
        first
            .subscribe("s", SubscribeOptions::durable("d", 10), handler.clone())
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await, Bytes::from_static(b"a"));
        first.close().await.unwrap();

        broker.inject("s", Bytes::from_static(b"b"));

        let second = session(&broker, &signal).await;
        second
            .subscribe("s", SubscribeOptions::durable("d", 10), handler)
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await, Bytes::from_static(b"b"));
        assert_eq!(broker.acked_count(), 2);
    }

    struct AckUnless {
        tx: mpsc::UnboundedSender<Bytes>,
        skip: &'static [u8],
    }

    #[async_trait]
    impl DeliveryHandler for AckUnless {
        async fn handle(&self, delivery: Box<dyn Delivery>) {
            if delivery.payload() != self.skip {
                delivery.ack().await.unwrap();
            }
            let _ = self
                .tx
                .send(Bytes::copy_from_slice(delivery.payload()));
        }
    }

    #[tokio::test]
    async fn resubscribe_replays_from_oldest_unacked() {
        let broker = MemoryBroker::new();
        let signal = RestartSignal::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.inject("s", Bytes::from_static(b"a"));
        broker.inject("s", Bytes::from_static(b"b"));

        let first = session(&broker, &signal).await;
        first
            .subscribe(
                "s",
                SubscribeOptions::durable("d", 10),
                Arc::new(AckUnless { tx: tx.clone(), skip: b"a" }),
            )
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await, Bytes::from_static(b"a"));
        assert_eq!(recv(&mut rx).await, Bytes::from_static(b"b"));
        first.close().await.unwrap();

        let second = session(&broker, &signal).await;
        second
            .subscribe("s", SubscribeOptions::durable("d", 10), Arc::new(Forward { tx, ack: true }))
            .await
            .unwrap();

        // "b" was acked but sits after the unacked "a"
        assert_eq!(recv(&mut rx).await, Bytes::from_static(b"a"));
        assert_eq!(recv(&mut rx).await, Bytes::from_static(b"b"));
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn in_flight_cap_stops_delivery() {
        let broker = MemoryBroker::new();
        let signal = RestartSignal::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..5u8 {
            broker.inject("s", Bytes::from(vec![i]));
        }

        let session = session(&broker, &signal).await;
        session
            .subscribe(
                "s",
                SubscribeOptions::durable("d", 2),
                Arc::new(Forward { tx, ack: false }),
            )
            .await
            .unwrap();

        recv(&mut rx).await;
        recv(&mut rx).await;
        let third = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(third.is_err());
        assert_eq!(broker.unacked_count(), 2);
    }

    #[tokio::test]
    async fn injected_publish_failure() {
        let broker = MemoryBroker::new();
        let signal = RestartSignal::new();
        let session = session(&broker, &signal).await;

        broker.fail_next_publishes(1);
        assert!(matches!(
            session.publish("s", Bytes::new()).await,
            Err(StageError::Publish(_))
        ));
        session.publish("s", Bytes::new()).await.unwrap();
        assert_eq!(broker.published("s").len(), 1);
    }

    #[tokio::test]
    async fn drop_session_cancels_and_fires() {
        let broker = MemoryBroker::new();
        let signal = RestartSignal::new();
        let session = session(&broker, &signal).await;
        assert_eq!(broker.live_sessions(), 1);

        broker.drop_session();

        assert_eq!(broker.live_sessions(), 0);
        assert_eq!(signal.fired_count(), 1);
        assert!(session.publish("s", Bytes::new()).await.is_err());
    }
}
