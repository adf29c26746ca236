//! Relay configuration
//!
//! Loaded from a YAML file. After parsing, [`Config::prepare`] validates the
//! interval, fills in identities and target names, and injects the
//! self-monitoring job when a monitor port is configured.
//!
//! Durations use `humantime` syntax: integer amounts with units that may be
//! combined, such as `30s`, `1m 30s` or `500ms`. Fractional values like
//! `1.5s` are not accepted; write `1s 500ms` instead.

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use streams_core::{Job, StreamConfig, Target};
use tracing::warn;

/// Job that scrapes the relay's own monitor endpoint; exempt from pausing
pub const SELF_MONITOR_JOB: &str = "prometheus_streams";

/// Interval used when `scrape_interval` cannot be parsed
pub const DEFAULT_SCRAPE_INTERVAL: Duration = Duration::from_secs(30);

/// Default period between fact file rewrites
pub const DEFAULT_FACTS_INTERVAL: Duration = Duration::from_secs(600);

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Where the receiver pushes metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushGatewayConfig {
    /// Base URL of the push gateway
    pub url: String,
    /// Add a `/publisher/{publisher}` grouping segment
    #[serde(default)]
    pub publisher_label: bool,
}

/// Periodic fact file output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactsConfig {
    /// File rewritten atomically with the current fact data
    pub path: PathBuf,
    /// Rewrite period, e.g. "10m"
    #[serde(default = "default_facts_interval")]
    pub interval: String,
}

fn default_facts_interval() -> String {
    humantime::format_duration(DEFAULT_FACTS_INTERVAL).to_string()
}

impl FactsConfig {
    /// Parsed rewrite period, falling back to the default when it does not
    /// parse or is zero
    pub fn interval(&self) -> Duration {
        match humantime::parse_duration(&self.interval) {
            Ok(interval) if !interval.is_zero() => interval,
            _ => DEFAULT_FACTS_INTERVAL,
        }
    }
}

/// Full relay configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity of this process, stamped on every published scrape
    pub identity: String,

    /// Log at info level
    pub verbose: bool,
    /// Log at debug level
    pub debug: bool,
    /// Append logs to this file instead of stdout
    pub logfile: Option<PathBuf>,
    /// Log output format
    pub log_format: LogFormat,

    /// Polling interval, e.g. "30s" or "1m 30s"
    pub scrape_interval: String,
    /// Maximum accepted message age in seconds, 0 disables
    pub max_age: i64,
    /// Port of the monitor HTTP server, 0 disables
    pub monitor_port: u16,

    /// Jobs by name
    pub jobs: BTreeMap<String, Job>,
    /// Broker used by the poller
    pub poller_stream: Option<StreamConfig>,
    /// Broker used by the receiver
    pub receiver_stream: Option<StreamConfig>,
    /// Receiver destination
    pub push_gateway: Option<PushGatewayConfig>,
    /// Fact file output
    pub facts: Option<FactsConfig>,

    /// File the configuration was loaded from
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

impl Config {
    /// Load and prepare a configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&raw)?;
        config.config_file = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse and prepare configuration text
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(raw)?;
        config.prepare()?;
        Ok(config)
    }

    /// Validate and fill in derived values
    pub fn prepare(&mut self) -> Result<()> {
        humantime::parse_duration(&self.scrape_interval).map_err(|e| {
            RelayError::Config(format!(
                "invalid scrape_interval '{}': {e}",
                self.scrape_interval
            ))
        })?;

        if let Some(facts) = &self.facts {
            match humantime::parse_duration(&facts.interval) {
                Ok(interval) if interval.is_zero() => {
                    return Err(RelayError::Config("facts interval must be non-zero".to_string()));
                }
                Ok(_) => {}
                Err(e) => {
                    return Err(RelayError::Config(format!(
                        "invalid facts interval '{}': {e}",
                        facts.interval
                    )));
                }
            }
        }

        if self.identity.is_empty() {
            self.identity = gethostname::gethostname().to_string_lossy().into_owned();
        }

        if self.monitor_port > 0 {
            self.jobs.insert(
                SELF_MONITOR_JOB.to_string(),
                Job::new(vec![Target::new(
                    self.identity.clone(),
                    format!("http://localhost:{}/metrics", self.monitor_port),
                )]),
            );
        }

        for (name, job) in self.jobs.iter_mut() {
            for target in job.targets.iter_mut() {
                target.resolve_name().map_err(|e| {
                    RelayError::Config(format!(
                        "job {name}: invalid target url '{}': {e}",
                        target.url
                    ))
                })?;
            }
        }

        for stream in [self.poller_stream.as_mut(), self.receiver_stream.as_mut()]
            .into_iter()
            .flatten()
        {
            if stream.client_id.is_empty() {
                stream.client_id =
                    format!("prometheus_streams_{}", ulid::Ulid::new().to_string().to_lowercase());
            }
        }

        Ok(())
    }

    /// Polling interval for target workers
    ///
    /// Falls back to [`DEFAULT_SCRAPE_INTERVAL`] with a warning when the
    /// configured value does not parse.
    pub fn interval(&self) -> Duration {
        match humantime::parse_duration(&self.scrape_interval) {
            Ok(interval) if !interval.is_zero() => interval,
            Ok(_) => {
                warn!(
                    interval = %self.scrape_interval,
                    "Zero scrape interval, defaulting to 30s"
                );
                DEFAULT_SCRAPE_INTERVAL
            }
            Err(e) => {
                warn!(
                    interval = %self.scrape_interval,
                    error = %e,
                    "Could not parse interval, defaulting to 30s"
                );
                DEFAULT_SCRAPE_INTERVAL
            }
        }
    }

    /// Configured job names, sorted
    pub fn job_names(&self) -> Vec<String> {
        self.jobs.keys().cloned().collect()
    }

    /// Poller broker settings or a configuration error
    pub fn poller_stream(&self) -> Result<&StreamConfig> {
        self.poller_stream
            .as_ref()
            .ok_or_else(|| RelayError::Config("poller_stream is not configured".to_string()))
    }

    /// Receiver broker settings or a configuration error
    pub fn receiver_stream(&self) -> Result<&StreamConfig> {
        self.receiver_stream
            .as_ref()
            .ok_or_else(|| RelayError::Config("receiver_stream is not configured".to_string()))
    }

    /// Push gateway settings or a configuration error
    pub fn push_gateway(&self) -> Result<&PushGatewayConfig> {
        self.push_gateway
            .as_ref()
            .ok_or_else(|| RelayError::Config("push_gateway is not configured".to_string()))
    }
}
