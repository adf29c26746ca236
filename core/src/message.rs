//! The scrape envelope that travels across the broker
//!
//! A [`ScrapeMessage`] is created by a target worker on the poller side,
//! serialized onto the broker by the publish loop, and decoded by the
//! receiver's subscription handler. The payload is an opaque compressed
//! blob; only the receiver's push loop decompresses it.
//!
//! # Wire format
//!
//! ```text
//! {"job":"node","instance":"h:9100","time":1700000000,"publisher":"poller1","scrape":"KLUv/..."}
//! ```
//!
//! `scrape` is the compressed body encoded as standard base64.

use crate::error::StageError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// One polled snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeMessage {
    /// Job the target belongs to
    pub job: String,
    /// Target identity within the job
    pub instance: String,
    /// Capture time, seconds since the UNIX epoch (UTC)
    #[serde(rename = "time")]
    pub timestamp: i64,
    /// Identity of the poller that captured the snapshot
    pub publisher: String,
    /// Compressed metrics text
    #[serde(with = "base64_bytes")]
    pub scrape: Bytes,
}

impl ScrapeMessage {
    /// Create a message stamped with the current time
    pub fn new(
        job: impl Into<String>,
        instance: impl Into<String>,
        publisher: impl Into<String>,
        scrape: Bytes,
    ) -> Self {
        Self {
            job: job.into(),
            instance: instance.into(),
            timestamp: unix_now(),
            publisher: publisher.into(),
            scrape,
        }
    }

    /// Override the capture timestamp
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Serialize to the wire format
    pub fn encode(&self) -> Result<Vec<u8>, StageError> {
        serde_json::to_vec(self).map_err(|e| StageError::Publish(e.to_string()))
    }

    /// Parse the wire format, rejecting messages without a job or instance
    pub fn decode(data: &[u8]) -> Result<Self, StageError> {
        let msg: ScrapeMessage =
            serde_json::from_slice(data).map_err(|e| StageError::Decode(e.to_string()))?;

        if msg.job.is_empty() {
            return Err(StageError::Decode("message has no job".to_string()));
        }
        if msg.instance.is_empty() {
            return Err(StageError::Decode("message has no instance".to_string()));
        }

        Ok(msg)
    }

    /// Seconds elapsed between capture and `now`, saturating at the `i64` bounds
    pub fn age_at(&self, now: i64) -> i64 {
        now.saturating_sub(self.timestamp)
    }
}

/// Current wall-clock time in seconds since UNIX epoch
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

mod base64_bytes {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
