//! Scrape pipeline against real HTTP targets and the in-memory broker

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{SUBJECT, fast_backoff, spawn_target, stream, wait_until, within};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use streams_core::{Job, Target};
use streams_relay::compress::decompress;
use streams_relay::{
    CircuitBreaker, Config, Managed, MemoryBroker, Metrics, Pausable, Poller, SELF_MONITOR_JOB,
    ScrapeMessage,
};
use tokio_util::sync::CancellationToken;

const LIMIT: Duration = Duration::from_secs(5);

fn config(jobs: Vec<(&str, Vec<&str>)>) -> Config {
    let jobs: BTreeMap<String, Job> = jobs
        .into_iter()
        .map(|(name, urls)| {
            let targets = urls.into_iter().map(Target::from_url).collect::<Result<_, _>>();
            (name.to_string(), Job::new(targets.unwrap()))
        })
        .collect();

    let mut config = Config {
        identity: "poller-test".to_string(),
        scrape_interval: "100ms".to_string(),
        jobs,
        poller_stream: Some(stream("poller-test")),
        ..Default::default()
    };
    config.prepare().unwrap();
    config
}

fn start(poller: Arc<Poller>) -> (CancellationToken, tokio::task::JoinHandle<streams_relay::Result<()>>) {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { poller.run(token).await });
    (cancel, handle)
}

fn decoded(broker: &MemoryBroker) -> Vec<ScrapeMessage> {
    broker
        .published(SUBJECT)
        .iter()
        .map(|raw| ScrapeMessage::decode(raw).unwrap())
        .collect()
}

#[tokio::test]
async fn publishes_compressed_scrapes_for_every_target() {
    let _ = Metrics::init();
    let a = spawn_target("a", 200).await;
    let b = spawn_target("b", 200).await;
    let broker = MemoryBroker::new();

    let poller = Arc::new(
        Poller::new(
            Arc::new(config(vec![("publish_all", vec![a.url.as_str(), b.url.as_str()])])),
            Arc::new(broker.clone()),
        )
        .with_backoff(fast_backoff()),
    );
    let (cancel, handle) = start(poller.clone());

    assert!(
        wait_until(LIMIT, || {
            let instances: HashSet<String> =
                decoded(&broker).into_iter().map(|m| m.instance).collect();
            instances.len() == 2
        })
        .await
    );
    assert!(poller.running());

    let message = decoded(&broker).remove(0);
    assert_eq!(message.job, "publish_all");
    assert_eq!(message.publisher, "poller-test");
    let body = String::from_utf8(decompress(&message.scrape).unwrap()).unwrap();
    assert!(body.contains("test_polls"));

    cancel.cancel();
    within(LIMIT, handle).await.unwrap().unwrap();
    assert!(!poller.running());
}

#[tokio::test]
async fn pause_skips_polls_except_self_monitoring() {
    let _ = Metrics::init();
    let node = spawn_target("node", 200).await;
    let own = spawn_target("own", 200).await;
    let broker = MemoryBroker::new();

    let gate = Arc::new(CircuitBreaker::new());
    gate.pause();

    let poller = Arc::new(
        Poller::new(
            Arc::new(config(vec![
                ("node", vec![node.url.as_str()]),
                (SELF_MONITOR_JOB, vec![own.url.as_str()]),
            ])),
            Arc::new(broker.clone()),
        )
        .with_gate(gate.clone())
        .with_backoff(fast_backoff()),
    );
    let (cancel, handle) = start(poller.clone());

    assert!(wait_until(LIMIT, || own.hits() >= 3).await);
    assert_eq!(node.hits(), 0);
    assert!(poller.paused());
    assert!(
        decoded(&broker)
            .iter()
            .all(|m| m.job == SELF_MONITOR_JOB)
    );

    // The tick loop kept running while paused
    gate.resume();
    assert!(wait_until(LIMIT, || node.hits() >= 1).await);
    assert!(
        wait_until(LIMIT, || decoded(&broker).iter().any(|m| m.job == "node")).await
    );

    cancel.cancel();
    within(LIMIT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn publish_failure_does_not_stop_the_loop() {
    let _ = Metrics::init();
    let target = spawn_target("flaky", 200).await;
    let broker = MemoryBroker::new();
    broker.fail_next_publishes(2);

    let before = Metrics::get().map(|m| m.poller_publish_errors.get()).unwrap_or(0.0);

    let poller = Arc::new(
        Poller::new(
            Arc::new(config(vec![("publish_failure", vec![target.url.as_str()])])),
            Arc::new(broker.clone()),
        )
        .with_backoff(fast_backoff()),
    );
    let (cancel, handle) = start(poller);

    assert!(wait_until(LIMIT, || broker.published(SUBJECT).len() >= 2).await);
    // The first two polls were dropped, later ones made it
    assert!(target.hits() >= 4);

    if let Some(metrics) = Metrics::get() {
        assert!(metrics.poller_publish_errors.get() - before >= 2.0);
    }

    cancel.cancel();
    within(LIMIT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_polls_are_counted_and_retried_next_tick() {
    let _ = Metrics::init();
    let target = spawn_target("broken", 500).await;
    let broker = MemoryBroker::new();

    let config = config(vec![("poll_errors", vec![target.url.as_str()])]);
    let name = config.jobs["poll_errors"].targets[0].name.clone();

    let poller = Arc::new(
        Poller::new(Arc::new(config), Arc::new(broker.clone())).with_backoff(fast_backoff()),
    );
    let (cancel, handle) = start(poller);

    assert!(wait_until(LIMIT, || target.hits() >= 3).await);
    assert!(broker.published(SUBJECT).is_empty());

    if let Some(metrics) = Metrics::get() {
        let errors = metrics
            .poller_poll_errors
            .with_label_values(&["poll_errors", &name])
            .get();
        assert!(errors >= 2.0);
    }

    cancel.cancel();
    within(LIMIT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn session_loss_reconnects_once_without_duplicates() {
    let _ = Metrics::init();
    let target = spawn_target("steady", 200).await;
    let broker = MemoryBroker::new();

    let poller = Arc::new(
        Poller::new(
            Arc::new(config(vec![("session_loss", vec![target.url.as_str()])])),
            Arc::new(broker.clone()),
        )
        .with_backoff(fast_backoff()),
    );
    let (cancel, handle) = start(poller);

    assert!(wait_until(LIMIT, || !broker.published(SUBJECT).is_empty()).await);
    assert_eq!(broker.connect_count(), 1);

    broker.drop_session();

    assert!(wait_until(LIMIT, || broker.connect_count() == 2).await);
    let after_loss = broker.published(SUBJECT).len();
    assert!(wait_until(LIMIT, || broker.published(SUBJECT).len() >= after_loss + 3).await);

    // Exactly one rebuild for one loss
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(broker.connect_count(), 2);
    assert_eq!(broker.live_sessions(), 1);

    // Every target response carries a unique counter
    let bodies: Vec<Vec<u8>> = decoded(&broker)
        .iter()
        .map(|m| decompress(&m.scrape).unwrap())
        .collect();
    let unique: HashSet<&Vec<u8>> = bodies.iter().collect();
    assert_eq!(unique.len(), bodies.len());

    cancel.cancel();
    within(LIMIT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_while_broker_is_down_is_clean() {
    let broker = MemoryBroker::new();
    broker.fail_next_connects(u32::MAX);

    let poller = Arc::new(
        Poller::new(
            Arc::new(config(vec![("never_connected", vec!["http://127.0.0.1:9/metrics"])])),
            Arc::new(broker.clone()),
        )
        .with_backoff(fast_backoff()),
    );
    let (cancel, handle) = start(poller.clone());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!poller.running());

    cancel.cancel();
    within(LIMIT, handle).await.unwrap().unwrap();
    assert_eq!(broker.connect_count(), 0);
}

#[tokio::test]
async fn missing_poller_stream_is_a_config_error() {
    let config = Config {
        scrape_interval: "1s".to_string(),
        ..Default::default()
    };
    let poller = Poller::new(Arc::new(config), Arc::new(MemoryBroker::new()));

    let err = poller.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, streams_relay::RelayError::Config(_)));
}
