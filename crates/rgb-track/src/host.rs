//! Boundary with the host server.
//!
//! The engine never assumes how the host stores or intercepts its world.
//! It reads through [`HostState`] once per tick on the tick thread, writes
//! through [`TrackingSink`] during the apply phase on the tick thread, and
//! lets the host veto individual pairs through a [`VisibilityFilter`] that
//! runs on worker threads.

use crate::delta::TrackAction;
use crate::error::{EvalError, HostError};
use crate::record::{EntityRecord, ObserverId, ObserverRecord};

/// A fully formed, internally consistent copy of host state for one tick.
#[derive(Clone, Debug, Default)]
pub struct HostFrame {
    pub entities: Vec<EntityRecord>,
    pub observers: Vec<ObserverRecord>,
}

/// Read access to the host's entities and observers.
///
/// Called only during snapshot publish, on the tick thread.
pub trait HostState {
    /// Capture the current state.
    ///
    /// Must never expose a half-applied mutation; return an error instead.
    fn capture(&self) -> Result<HostFrame, HostError>;
}

impl HostState for HostFrame {
    fn capture(&self) -> Result<HostFrame, HostError> {
        Ok(self.clone())
    }
}

/// The host's observer-notification path.
///
/// Invoked only from the tick thread while applying. Implementations must be
/// idempotent: a repeated start-track for an already-tracked entity is a
/// no-op, not an error.
pub trait TrackingSink {
    /// Deliver the ordered actions for one observer.
    fn dispatch(&mut self, observer: ObserverId, actions: &[TrackAction]);
}

/// Sink that drops every action.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl TrackingSink for DiscardSink {
    fn dispatch(&mut self, _observer: ObserverId, _actions: &[TrackAction]) {}
}

/// Host veto on individual (observer, entity) pairs.
///
/// Runs on worker threads against snapshot records only. A returned error or
/// a panic skips that one entity for this tick.
pub trait VisibilityFilter: Send + Sync + 'static {
    /// Whether `entity`, already within range, may be shown to `observer`.
    fn admits(&self, observer: &ObserverRecord, entity: &EntityRecord) -> Result<bool, EvalError>;
}

// Implement VisibilityFilter for closures
impl<F> VisibilityFilter for F
where
    F: Fn(&ObserverRecord, &EntityRecord) -> Result<bool, EvalError> + Send + Sync + 'static,
{
    fn admits(&self, observer: &ObserverRecord, entity: &EntityRecord) -> Result<bool, EvalError> {
        self(observer, entity)
    }
}

/// Filter that admits every in-range pair.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdmitAll;

impl VisibilityFilter for AdmitAll {
    fn admits(&self, _observer: &ObserverRecord, _entity: &EntityRecord) -> Result<bool, EvalError> {
        Ok(true)
    }
}
