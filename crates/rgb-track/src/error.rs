//! Tracking error types.
//!
//! None of these ever escape a tick: the coordinator turns each of them into
//! a diagnostic plus a degraded-but-correct outcome.

use thiserror::Error;

use crate::record::{EntityId, ObserverId};

/// The host could not produce a consistent frame.
#[derive(Debug, Clone, Error)]
#[error("host state unavailable: {reason}")]
pub struct HostError {
    pub reason: String,
}

impl HostError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Snapshot publish failed; the tick is skipped for tracking purposes.
#[derive(Debug, Clone, Error)]
pub enum SnapshotError {
    /// The host accessor failed.
    #[error(transparent)]
    Host(#[from] HostError),

    /// The same entity id appeared twice in one frame.
    #[error("duplicate entity id {0}")]
    DuplicateEntity(EntityId),

    /// The same observer id appeared twice in one frame.
    #[error("duplicate observer id {0}")]
    DuplicateObserver(ObserverId),

    /// Observer position or radius is not a finite number.
    #[error("observer {0} has a non-finite position or radius")]
    InvalidObserver(ObserverId),

    /// Tick sequence numbers must strictly increase.
    #[error("tick {tick} does not advance past published tick {last}")]
    StaleTick { tick: u64, last: u64 },
}

/// Evaluating one candidate failed; only that candidate is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    /// Entity position is NaN or infinite.
    #[error("entity {0} has a non-finite position")]
    NonFinitePosition(EntityId),

    /// The host visibility filter reported a failure.
    #[error("visibility filter failed: {0}")]
    Filter(String),

    /// The host visibility filter panicked.
    #[error("visibility filter panicked: {0}")]
    Panicked(String),
}

/// The worker pool cannot take work.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool was shut down.
    #[error("worker pool is shut down")]
    ShutDown,

    /// Worker threads exited unexpectedly.
    #[error("worker pool lost {lost} of {size} threads")]
    WorkersLost { lost: usize, size: usize },

    /// More units are queued than the configured limit.
    #[error("worker pool backlog {backlog} exceeds limit {limit}")]
    Saturated { backlog: usize, limit: usize },

    /// A worker thread could not be started.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Configuration could not be parsed or is out of range.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML syntax or shape error.
    #[error("invalid tracker config: {0}")]
    Toml(#[from] toml::de::Error),

    /// A field holds an out-of-range value.
    #[error("invalid tracker config field `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Top-level tracking error.
#[derive(Debug, Error)]
pub enum TrackError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Eval(#[from] EvalError),
}

/// Result type for tracking operations.
pub type TrackResult<T> = Result<T, TrackError>;
