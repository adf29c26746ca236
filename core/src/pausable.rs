//! The pause capability shared by both pipelines

/// A runtime on/off switch that suppresses paid work without stopping
/// the process
///
/// Implementations must serialize the mutating operations and be safe to
/// call from any number of tasks. None of the operations can fail.
pub trait Pausable: Send + Sync {
    /// Suppress work until [`resume`](Pausable::resume) is called
    fn pause(&self);

    /// Allow work again
    fn resume(&self);

    /// Invert the current state
    fn flip(&self);

    /// Whether work is currently suppressed
    fn paused(&self) -> bool;
}
