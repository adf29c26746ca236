//! prometheus-streams runtime - process wiring for the relay pipelines
//!
//! Provides [`run()`] to start a poller or receiver from a loaded
//! [`Config`], and [`RuntimeBuilder`] for callers that need to swap the
//! broker or drive shutdown themselves.
//!
//! ```ignore
//! let config = Config::from_file("/etc/prometheus-streams.yaml")?;
//! streams_runtime::init_tracing(&config)?;
//! streams_runtime::run(config, Component::Poller).await
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

use anyhow::Context;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::{Arc, Mutex};
use streams_relay::{
    Broker, Config, FactWriter, LogFormat, Managed, Metrics, MetricsServer, NatsBroker, Poller,
    Receiver,
};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Which side of the relay this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    /// Scrape targets and publish to the broker
    Poller,
    /// Subscribe to the broker and push to the gateway
    Receiver,
}

/// Run a pipeline until SIGINT or SIGTERM.
pub async fn run(config: Config, component: Component) -> anyhow::Result<()> {
    RuntimeBuilder::new(config).run(component).await
}

/// Builder for a relay process.
///
/// Defaults to the NATS JetStream broker and stops on SIGINT or SIGTERM.
pub struct RuntimeBuilder {
    config: Config,
    broker: Option<Arc<dyn Broker>>,
    cancel: CancellationToken,
}

impl RuntimeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            broker: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Use `broker` instead of NATS JetStream.
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Stop when `cancel` fires, in addition to process signals.
    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Start the pipeline, fact writer and monitor server, then wait
    /// for shutdown or for the pipeline to end on its own.
    pub async fn run(self, component: Component) -> anyhow::Result<()> {
        let config = Arc::new(self.config);
        let cancel = self.cancel;
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(NatsBroker::new()));

        info!(
            version = env!("CARGO_PKG_VERSION"),
            config_file = ?config.config_file,
            identity = %config.identity,
            component = ?component,
            monitor_port = config.monitor_port,
            "Starting prometheus-streams"
        );

        Metrics::init()?;

        let (managed, mut pipeline): (Arc<dyn Managed>, JoinHandle<streams_relay::Result<()>>) =
            match component {
                Component::Poller => {
                    let poller = Arc::new(Poller::new(Arc::clone(&config), broker));
                    let task = {
                        let (poller, cancel) = (Arc::clone(&poller), cancel.clone());
                        tokio::spawn(async move { poller.run(cancel).await })
                    };
                    (poller, task)
                }
                Component::Receiver => {
                    let receiver = Arc::new(Receiver::new(Arc::clone(&config), broker));
                    let task = {
                        let (receiver, cancel) = (Arc::clone(&receiver), cancel.clone());
                        tokio::spawn(async move { receiver.run(cancel).await })
                    };
                    (receiver, task)
                }
            };

        let facts = config.facts.as_ref().map(|facts| {
            let writer = Arc::new(FactWriter::new(
                facts.path.clone(),
                facts.interval(),
                Arc::clone(&config),
                Arc::clone(&managed),
            ));
            tokio::spawn(Arc::clone(&writer).run(cancel.clone()));
            writer
        });

        let monitor = (config.monitor_port > 0).then(|| {
            MetricsServer::start(
                config.monitor_port,
                Arc::clone(&managed),
                facts.clone(),
                cancel.clone(),
            )
        });

        let finished = tokio::select! {
            _ = shutdown_signal() => None,
            _ = cancel.cancelled() => None,
            result = &mut pipeline => Some(result),
        };

        cancel.cancel();
        let result = match finished {
            Some(result) => result,
            None => pipeline.await,
        };

        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }

        result.context("pipeline task panicked")??;
        info!("prometheus-streams shutdown complete");
        Ok(())
    }
}

/// Filter directive for the configured verbosity.
fn default_level(config: &Config) -> &'static str {
    if config.debug {
        "debug"
    } else if config.verbose {
        "info"
    } else {
        "warn"
    }
}

/// Initialise the tracing subscriber based on config.
///
/// `RUST_LOG` overrides the configured level. With a logfile set, output
/// is appended there without colours.
pub fn init_tracing(config: &Config) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level(config)));

    let (writer, ansi) = match &config.logfile {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("could not open log file {}", path.display()))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), true),
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.log_format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(ansi),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(ansi),
            )
            .try_init()?,
    }

    Ok(())
}

/// Write the current process id to `path`.
pub fn write_pid(path: &Path) -> anyhow::Result<()> {
    std::fs::write(path, std::process::id().to_string())
        .with_context(|| format!("could not write PID to {}", path.display()))
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use streams_relay::{MemoryBroker, RelayError, StreamConfig};

    fn stream() -> StreamConfig {
        StreamConfig {
            client_id: "runtime-test".to_string(),
            cluster_id: "METRICS".to_string(),
            urls: "memory://local".to_string(),
            topic: "metrics.scrapes".to_string(),
        }
    }

    #[test]
    fn level_follows_verbosity_flags() {
        let mut config = Config::default();
        assert_eq!(default_level(&config), "warn");

        config.verbose = true;
        assert_eq!(default_level(&config), "info");

        config.debug = true;
        assert_eq!(default_level(&config), "debug");
    }

    #[test]
    fn writes_pid_file() {
        let path = std::env::temp_dir().join(format!("streams-runtime-{}.pid", std::process::id()));
        write_pid(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, std::process::id().to_string());
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn cancel_stops_the_poller() {
        let mut config = Config {
            identity: "runtime-test".to_string(),
            scrape_interval: "1s".to_string(),
            poller_stream: Some(stream()),
            ..Default::default()
        };
        config.prepare().unwrap();

        let cancel = CancellationToken::new();
        let runtime = RuntimeBuilder::new(config)
            .broker(Arc::new(MemoryBroker::new()))
            .cancel_token(cancel.clone());
        let task = tokio::spawn(runtime.run(Component::Poller));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn pipeline_config_error_is_returned() {
        let config = Config {
            scrape_interval: "1s".to_string(),
            ..Default::default()
        };

        let err = RuntimeBuilder::new(config)
            .broker(Arc::new(MemoryBroker::new()))
            .run(Component::Receiver)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::Config(_))
        ));
    }
}
