//! streams-relay - Prometheus scrape relay over a durable message bus
//!
//! Decouples metric collection from ingestion. A poller scrapes targets,
//! compresses each snapshot and publishes it; a receiver on the far side of
//! the broker subscribes and pushes the snapshots to a push gateway.
//!
//! ```text
//!  targets ──► Poller ──► broker ──► Receiver ──► push gateway
//!               │  ▲                   │  ▲
//!               ▼  │                   ▼  │
//!          ResilientConnection   ResilientConnection
//!
//!            CircuitBreaker (pause gate), one per pipeline
//! ```
//!
//! Both pipelines survive broker outages by rebuilding their connection
//! with backoff, bound their memory with small queues, and can be paused
//! at runtime through the monitor server.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod circuit_breaker;
pub mod compress;
pub mod config;
pub mod connection;
pub mod error;
pub mod facts;
pub mod metrics;
pub mod metrics_server;
pub mod receiver;
pub mod scrape;
pub mod status;

pub use circuit_breaker::CircuitBreaker;
pub use config::{Config, LogFormat, PushGatewayConfig, SELF_MONITOR_JOB};
pub use connection::{MemoryBroker, NatsBroker, ResilientConnection};
pub use error::{RelayError, Result};
pub use facts::FactWriter;
pub use metrics::Metrics;
pub use metrics_server::MetricsServer;
pub use receiver::{Pusher, Receiver, ScrapeHandler};
pub use scrape::Poller;
pub use status::{Managed, Mode};

pub use streams_core::{
    Backoff, Broker, Pausable, RestartSignal, ScrapeMessage, StageError, StreamConfig,
};
