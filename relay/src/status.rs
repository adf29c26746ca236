//! Collaborator interface for management surfaces
//!
//! The monitor server and the fact writer only see a pipeline through
//! [`Managed`]; they never reach into the pipelines themselves.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use streams_core::Pausable;

/// Which half of the relay this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Scrapes targets and publishes
    Poller,
    /// Subscribes and pushes
    Receiver,
    /// No pipeline
    Unknown,
}

impl Mode {
    /// Lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Poller => "poller",
            Mode::Receiver => "receiver",
            Mode::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a management surface may query and control
pub trait Managed: Send + Sync {
    /// Pipeline kind
    fn mode(&self) -> Mode;

    /// Whether the pipeline loop is currently running
    fn running(&self) -> bool;

    /// The pause gate injected into the pipeline
    fn gate(&self) -> Arc<dyn Pausable>;

    /// Configured job names, sorted
    fn jobs(&self) -> Vec<String>;

    /// Shortcut for `gate().paused()`
    fn paused(&self) -> bool {
        self.gate().paused()
    }
}
