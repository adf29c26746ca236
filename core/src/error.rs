//! Error types for relay stages

use thiserror::Error;

/// Error type for a single unit of relay work
///
/// Every variant maps to one failure kind of the relay: a stage that hits
/// one of these logs it, counts it and drops the unit of work. None of them
/// is fatal to the process.
///
/// # Example
///
/// ```
/// use streams_core::StageError;
///
/// fn fetch() -> Result<Vec<u8>, StageError> {
///     Err(StageError::Fetch("503 Service Unavailable".to_string()))
/// }
///
/// match fetch() {
///     Ok(body) => println!("{} bytes", body.len()),
///     Err(StageError::Fetch(msg)) => println!("fetch failed: {}", msg),
///     Err(e) => println!("other error: {}", e),
/// }
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    /// Broker transport or session could not be established
    ///
    /// Retried with backoff by the resilient connection.
    #[error("connection error: {0}")]
    Connection(String),

    /// An operation needed a live session but none exists
    #[error("not connected")]
    NotConnected,

    /// Broker session dropped after it was established
    #[error("session lost: {0}")]
    SessionLost(String),

    /// HTTP error, timeout, bad status or body read error while polling
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// Codec error compressing or decompressing a scrape body
    #[error("compression failed: {0}")]
    Compression(String),

    /// Serialization or broker send error
    #[error("publish failed: {0}")]
    Publish(String),

    /// Malformed inbound message
    #[error("decode failed: {0}")]
    Decode(String),

    /// Non-202 response or transport error from the aggregation endpoint
    #[error("push failed: {0}")]
    Push(String),

    /// The root cancellation signal fired
    ///
    /// This is the clean shutdown path and is never reported as a failure.
    #[error("cancelled")]
    Cancelled,
}

impl StageError {
    /// True when the error only reflects shutdown
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StageError::Cancelled)
    }
}
