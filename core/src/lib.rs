//! streams-core - Shared types for prometheus-streams
//!
//! This crate holds what both halves of the relay, and any broker binding,
//! need to agree on:
//!
//! - [`ScrapeMessage`] - the envelope carried across the broker
//! - [`Job`] / [`Target`] - immutable polling configuration
//! - [`Broker`] / [`Transport`] / [`Session`] - the broker seam
//! - [`Pausable`] - the pause capability injected into pipelines
//! - [`RestartSignal`] / [`SessionLost`] - session loss notification
//! - [`Backoff`] - the reconnect schedule
//! - [`StageError`] - per-unit failure kinds
//!
//! ```text
//! targets ──► poller ──► broker ──► receiver ──► push gateway
//!            (streams-relay)   ▲   (streams-relay)
//!                              │
//!                        streams-core seams
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

/// Reconnect backoff schedule
pub mod backoff;
/// Broker seam traits
pub mod broker;
mod error;
/// Jobs and targets
pub mod job;
/// The wire envelope
pub mod message;
mod pausable;
/// Session loss notification
pub mod restart;

pub use backoff::Backoff;
pub use broker::{
    Broker, Delivery, DeliveryHandler, Session, StreamConfig, SubscribeOptions, Transport,
};
pub use error::StageError;
pub use job::{Job, Target};
pub use message::ScrapeMessage;
pub use pausable::Pausable;
pub use restart::{RestartSignal, SessionLost};
