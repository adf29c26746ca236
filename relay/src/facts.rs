//! Fact file writer
//!
//! Periodically dumps a JSON summary of this process (identity, mode, pause
//! state, configured jobs) for discovery by external tooling. Every write
//! goes to a temp file in the target directory first and is renamed into
//! place, so readers never see a partial document.

use crate::config::{Config, DEFAULT_FACTS_INTERVAL};
use crate::error::Result;
use crate::status::{Managed, Mode};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use streams_core::message::unix_now;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Writes fact data for one pipeline
pub struct FactWriter {
    path: PathBuf,
    interval: Duration,
    config: Arc<Config>,
    managed: Arc<dyn Managed>,
    lock: Mutex<()>,
}

impl FactWriter {
    /// Create a writer for `path`, rewritten every `interval`
    ///
    /// A zero interval means [`DEFAULT_FACTS_INTERVAL`].
    pub fn new(
        path: impl Into<PathBuf>,
        interval: Duration,
        config: Arc<Config>,
        managed: Arc<dyn Managed>,
    ) -> Self {
        Self {
            path: path.into(),
            interval: if interval.is_zero() {
                DEFAULT_FACTS_INTERVAL
            } else {
                interval
            },
            config,
            managed,
            lock: Mutex::new(()),
        }
    }

    /// Destination file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current fact document
    pub fn data(&self) -> Result<Value> {
        let running = self.managed.running();
        let mode = if running {
            self.managed.mode()
        } else {
            Mode::Unknown
        };

        let mut facts = Map::new();
        facts.insert("identity".into(), json!(self.config.identity));
        facts.insert("time".into(), json!(unix_now()));
        facts.insert("config".into(), serde_json::to_value(self.config.as_ref())?);
        facts.insert("paused".into(), json!(running && self.managed.paused()));
        facts.insert("mode".into(), json!(mode));
        facts.insert("jobs".into(), json!(""));
        facts.insert(format!("{mode}_mode"), json!(true));

        if mode == Mode::Poller {
            let jobs = self.managed.jobs();
            facts.insert("jobs".into(), json!(jobs.join(",")));
            for job in jobs {
                facts.insert(format!("{job}_job"), json!(true));
            }
        }

        Ok(Value::Object(facts))
    }

    /// Atomically replace the fact file
    pub fn write(&self) -> Result<()> {
        let _guard = self.lock.lock();

        let body = serde_json::to_vec(&self.data()?)?;
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "facts".to_string());
        let temp = dir.join(format!(".{name}.{}.tmp", ulid::Ulid::new()));

        std::fs::write(&temp, body)?;
        if let Err(e) = std::fs::rename(&temp, &self.path) {
            let _ = std::fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Write now and then every interval until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(path = %self.path.display(), "Writing fact data");

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.write() {
                        warn!(path = %self.path.display(), error = %e, "Could not write fact data");
                    }
                }
            }
        }
    }
}
