//! Engine error types.
//!
//! Sample anomalies and KeepSync drops are counters, not errors; only
//! operations the caller can meaningfully react to surface here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// The engine was asked to start playback with no track set.
    #[error("no track configured")]
    NoTrack,

    /// The engine was asked to do something only the other role can do.
    #[error("operation requires the {0} role")]
    WrongRole(&'static str),

    /// The engine task is gone.
    #[error("engine stopped")]
    EngineStopped,

    /// Decoder collaborator failure, carried as a string so it never
    /// crosses the decision loop as a panic.
    #[error("decoder: {0}")]
    Decoder(String),
}
