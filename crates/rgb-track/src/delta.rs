//! Visibility deltas and the apply step.

use crate::error::EvalError;
use crate::record::{EntityId, KnownState, ObserverId, TrackedSet};

/// What changes for one entity in one observer's view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// The entity became visible; the host should spawn it client-side.
    StartTrack,
    /// The entity left range or despawned; the host should remove it.
    StopTrack,
    /// A tracked entity changed materially; the host should send its state.
    Update,
}

/// One action in a delta.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrackAction {
    pub entity: EntityId,
    pub kind: ActionKind,
    /// State the observer knows after this action. For `StopTrack`, the
    /// last state it was sent.
    pub state: KnownState,
}

/// A candidate that failed evaluation and was skipped.
#[derive(Clone, Debug, PartialEq)]
pub struct Diagnostic {
    pub observer: ObserverId,
    pub entity: EntityId,
    pub error: EvalError,
}

/// Output of evaluating one work unit. Immutable once produced.
#[derive(Clone, Debug, PartialEq)]
pub struct Delta {
    pub observer: ObserverId,
    pub tick: u64,
    /// Sequence number of the unit that produced this delta.
    pub unit: usize,
    /// Index among the observer's units; the apply order.
    pub part: u32,
    /// Actions in ascending entity order.
    pub actions: Vec<TrackAction>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Apply actions to a tracked-set.
///
/// Idempotent: re-applying the same actions leaves the set unchanged.
pub fn apply_delta(tracked: &mut TrackedSet, actions: &[TrackAction]) {
    for action in actions {
        match action.kind {
            ActionKind::StartTrack | ActionKind::Update => {
                tracked.insert(action.entity, action.state);
            }
            ActionKind::StopTrack => {
                tracked.remove(&action.entity);
            }
        }
    }
}
