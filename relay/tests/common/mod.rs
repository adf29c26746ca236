//! Shared fixtures: scrape targets and a push gateway served by axum on
//! ephemeral local ports.

#![allow(dead_code)]

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::get;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use streams_relay::{Backoff, StreamConfig};

/// Subject used by every test pipeline
pub const SUBJECT: &str = "metrics.scrapes";

/// A scrape target that counts its hits
pub struct TestTarget {
    pub url: String,
    pub hits: Arc<AtomicUsize>,
}

impl TestTarget {
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct TargetState {
    hits: Arc<AtomicUsize>,
    status: StatusCode,
    name: &'static str,
}

async fn target_handler(State(state): State<TargetState>) -> (StatusCode, String) {
    let hit = state.hits.fetch_add(1, Ordering::SeqCst) + 1;
    (
        state.status,
        format!(
            "# TYPE test_polls counter\ntest_polls{{target=\"{}\"}} {hit}\n",
            state.name
        ),
    )
}

/// Serve `/metrics` answering with `status`; every body is unique
pub async fn spawn_target(name: &'static str, status: u16) -> TestTarget {
    let hits = Arc::new(AtomicUsize::new(0));
    let state = TargetState {
        hits: Arc::clone(&hits),
        status: StatusCode::from_u16(status).unwrap(),
        name,
    };
    let app = Router::new()
        .route("/metrics", get(target_handler))
        .with_state(state);

    let url = serve(app).await;
    TestTarget {
        url: format!("{url}/metrics"),
        hits,
    }
}

/// One POST seen by the test gateway
#[derive(Debug, Clone)]
pub struct Pushed {
    pub path: String,
    pub content_type: String,
    pub body: String,
}

/// A push gateway recording every POST
pub struct TestGateway {
    pub url: String,
    pub pushed: Arc<Mutex<Vec<Pushed>>>,
}

impl TestGateway {
    pub fn pushed(&self) -> Vec<Pushed> {
        self.pushed.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.pushed.lock().len()
    }
}

#[derive(Clone)]
struct GatewayState {
    pushed: Arc<Mutex<Vec<Pushed>>>,
    status: StatusCode,
}

async fn gateway_handler(
    State(state): State<GatewayState>,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.pushed.lock().push(Pushed {
        path: uri.path().to_string(),
        content_type,
        body,
    });
    state.status
}

/// Accept every request, answering with `status`
pub async fn spawn_gateway(status: u16) -> TestGateway {
    let pushed = Arc::new(Mutex::new(Vec::new()));
    let state = GatewayState {
        pushed: Arc::clone(&pushed),
        status: StatusCode::from_u16(status).unwrap(),
    };
    let app = Router::new().fallback(gateway_handler).with_state(state);

    TestGateway {
        url: serve(app).await,
        pushed,
    }
}

/// A push gateway that accepts connections and never answers
pub async fn spawn_silent_gateway() -> TestGateway {
    let pushed = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&pushed);
    let app = Router::new().fallback(move |uri: Uri| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().push(Pushed {
                path: uri.path().to_string(),
                content_type: String::new(),
                body: String::new(),
            });
            tokio::time::sleep(Duration::from_secs(3600)).await;
            StatusCode::ACCEPTED
        }
    });

    TestGateway {
        url: serve(app).await,
        pushed,
    }
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Poll `check` every 10ms until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Await a pipeline future with a generous limit
pub async fn within<F: Future>(limit: Duration, fut: F) -> F::Output {
    tokio::time::timeout(limit, fut).await.unwrap()
}

pub fn stream(client_id: &str) -> StreamConfig {
    StreamConfig {
        client_id: client_id.to_string(),
        cluster_id: "METRICS".to_string(),
        urls: "memory://local".to_string(),
        topic: SUBJECT.to_string(),
    }
}

pub fn fast_backoff() -> Backoff {
    Backoff {
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 1.5,
    }
}
