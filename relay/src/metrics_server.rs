//! HTTP server for Prometheus metrics and pipeline control
//!
//! Runs a lightweight HTTP server on the monitor port. The poller's
//! self-monitoring job scrapes `/metrics` from here.
//!
//! # Endpoints
//!
//! - `GET /metrics` - Prometheus metrics
//! - `GET /health` - Pipeline health summary
//! - `GET /info` - Mode and pause state
//! - `POST /switch` - Flip the pause gate and rewrite facts
//! - `POST /pause` / `POST /resume` - Explicit pause transitions
//!
//! # Example
//!
//! ```ignore
//! use streams_relay::metrics_server::MetricsServer;
//!
//! let handle = MetricsServer::start(8080, poller.clone(), Some(facts), cancel.clone());
//! ```

use crate::facts::FactWriter;
use crate::status::{Managed, Mode};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shared state for the metrics server
#[derive(Clone)]
struct AppState {
    managed: Arc<dyn Managed>,
    facts: Option<Arc<FactWriter>>,
}

/// Metrics HTTP server
pub struct MetricsServer;

impl MetricsServer {
    /// Build the router without binding a socket
    pub fn router(managed: Arc<dyn Managed>, facts: Option<Arc<FactWriter>>) -> Router {
        let state = AppState { managed, facts };
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(health_handler))
            .route("/info", get(info_handler))
            .route("/switch", post(switch_handler))
            .route("/pause", post(pause_handler))
            .route("/resume", post(resume_handler))
            .with_state(state)
    }

    /// Start the metrics server on the given port
    ///
    /// The server stops when `cancel` fires.
    pub fn start(
        port: u16,
        managed: Arc<dyn Managed>,
        facts: Option<Arc<FactWriter>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let app = Self::router(managed, facts);

        tokio::spawn(async move {
            info!(port = port, "Metrics server starting");

            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, port = port, "Failed to bind metrics server");
                    return;
                }
            };

            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
            {
                error!(error = %e, "Metrics server error");
            }
        })
    }
}

/// Reply for info and control endpoints
#[derive(Debug, Serialize)]
struct InfoReply {
    mode: Mode,
    paused: bool,
}

/// Pipeline health summary
#[derive(Debug, Serialize)]
struct HealthSummary {
    status: &'static str,
    mode: Mode,
    paused: bool,
    running: bool,
}

fn info(managed: &dyn Managed) -> InfoReply {
    if managed.running() {
        InfoReply {
            mode: managed.mode(),
            paused: managed.paused(),
        }
    } else {
        InfoReply {
            mode: Mode::Unknown,
            paused: false,
        }
    }
}

/// Handler for /metrics endpoint
async fn metrics_handler() -> impl IntoResponse {
    let body = crate::metrics::gather();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Handler for /health endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let running = state.managed.running();
    let summary = HealthSummary {
        status: if running { "ok" } else { "stopped" },
        mode: state.managed.mode(),
        paused: state.managed.paused(),
        running,
    };

    let code = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (code, Json(summary))
}

/// Handler for /info endpoint
async fn info_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(info(state.managed.as_ref()))
}

/// Handler for /switch endpoint - flips the gate and rewrites facts
async fn switch_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.managed.gate().flip();

    if let Some(facts) = &state.facts {
        if let Err(e) = facts.write() {
            warn!(error = %e, "Could not update facts");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": format!("Could not update facts: {e}"),
                })),
            )
                .into_response();
        }
    }

    (StatusCode::OK, Json(info(state.managed.as_ref()))).into_response()
}

/// Handler for /pause endpoint
async fn pause_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.managed.gate().pause();
    Json(info(state.managed.as_ref()))
}

/// Handler for /resume endpoint
async fn resume_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.managed.gate().resume();
    Json(info(state.managed.as_ref()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreaker;
    use crate::config::Config;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use streams_core::Pausable;

    struct Fake {
        running: AtomicBool,
        gate: Arc<CircuitBreaker>,
    }

    impl Managed for Fake {
        fn mode(&self) -> Mode {
            Mode::Receiver
        }
        fn running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
        fn gate(&self) -> Arc<dyn Pausable> {
            self.gate.clone()
        }
        fn jobs(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn state(running: bool, facts: Option<Arc<FactWriter>>) -> (AppState, Arc<Fake>) {
        let fake = Arc::new(Fake {
            running: AtomicBool::new(running),
            gate: Arc::new(CircuitBreaker::new()),
        });
        let state = AppState {
            managed: fake.clone(),
            facts,
        };
        (state, fake)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 10_000)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_metrics_handler_returns_prometheus_format() {
        let _ = crate::metrics::Metrics::init();

        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));
    }

    #[tokio::test]
    async fn test_health_reports_running_pipeline() {
        let (state, _) = state(true, None);

        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["mode"], "receiver");
        assert_eq!(json["running"], true);
    }

    #[tokio::test]
    async fn test_health_unavailable_when_stopped() {
        let (state, _) = state(false, None);

        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_info_when_stopped_is_unknown() {
        let (state, fake) = state(false, None);
        fake.gate.pause();

        let json = body_json(info_handler(State(state)).await.into_response()).await;
        assert_eq!(json["mode"], "unknown");
        assert_eq!(json["paused"], false);
    }

    #[tokio::test]
    async fn test_switch_flips_and_writes_facts() {
        let dir = std::env::temp_dir().join(format!("streams-switch-{}", ulid::Ulid::new()));
        std::fs::create_dir_all(&dir).unwrap();

        let fake = Arc::new(Fake {
            running: AtomicBool::new(true),
            gate: Arc::new(CircuitBreaker::new()),
        });
        let facts = Arc::new(FactWriter::new(
            dir.join("facts.json"),
            Duration::from_secs(600),
            Arc::new(Config::default()),
            fake.clone(),
        ));
        let state = AppState {
            managed: fake.clone(),
            facts: Some(facts.clone()),
        };

        let response = switch_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["paused"], true);
        assert!(fake.gate.paused());

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(facts.path()).unwrap()).unwrap();
        assert_eq!(written["paused"], true);

        switch_handler(State(state)).await;
        assert!(!fake.gate.paused());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let (state, fake) = state(true, None);

        let json = body_json(pause_handler(State(state.clone())).await.into_response()).await;
        assert_eq!(json["paused"], true);
        assert!(fake.gate.paused());

        let json = body_json(resume_handler(State(state)).await.into_response()).await;
        assert_eq!(json["paused"], false);
    }

    #[tokio::test]
    async fn test_router_serves_over_tcp() {
        let (state, _) = state(true, None);
        let app = MetricsServer::router(state.managed, None);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let response = reqwest::get(format!("http://{addr}/info")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let json: serde_json::Value = response.json().await.unwrap();
        assert_eq!(json["mode"], "receiver");
    }
}
