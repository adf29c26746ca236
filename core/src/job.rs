//! Polling jobs and their targets
//!
//! Jobs are loaded once from configuration and then shared read-only by
//! every target worker.

use serde::{Deserialize, Serialize};
use url::Url;

/// A named group of targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    /// Endpoints polled for this job
    #[serde(default)]
    pub targets: Vec<Target>,
}

impl Job {
    /// Create a job from a list of targets
    pub fn new(targets: Vec<Target>) -> Self {
        Self { targets }
    }
}

/// A single metrics endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Instance name; defaults to `host:port` of the URL
    #[serde(default)]
    pub name: String,
    /// URL fetched on every poll
    pub url: String,
}

impl Target {
    /// Create a target with an explicit name
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }

    /// Create a target whose name is derived from its URL
    pub fn from_url(url: impl Into<String>) -> Result<Self, url::ParseError> {
        let mut target = Self {
            name: String::new(),
            url: url.into(),
        };
        target.resolve_name()?;
        Ok(target)
    }

    /// Fill in `name` from the URL when it is unset
    pub fn resolve_name(&mut self) -> Result<(), url::ParseError> {
        if self.name.is_empty() {
            self.name = default_name(&self.url)?;
        }
        Ok(())
    }
}

/// `host:port` for a URL, using the scheme's well-known port when none is given
pub fn default_name(url: &str) -> Result<String, url::ParseError> {
    let parsed = Url::parse(url)?;
    let host = parsed.host_str().unwrap_or_default();

    Ok(match parsed.port_or_known_default() {
        Some(port) => format!("{host}:{port}"),
        None => format!("{host}:"),
    })
}
