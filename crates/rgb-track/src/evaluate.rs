//! Visibility evaluation.
//!
//! Reads only the snapshot and the observer's frozen tracked-set, never
//! live state, so it is safe on any thread and yields the same delta no
//! matter what the host does after publish.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::{error, warn};

use crate::delta::{ActionKind, Delta, Diagnostic, TrackAction};
use crate::error::EvalError;
use crate::host::VisibilityFilter;
use crate::partition::WorkUnit;
use crate::record::{EntityId, EntityRecord, KnownState, ObserverRecord};
use crate::snapshot::{ObserverView, Snapshot};

/// Evaluate every candidate in a unit, producing exactly one delta.
///
/// A failing candidate is skipped and recorded as a diagnostic; the rest of
/// the unit is still evaluated.
pub fn evaluate_unit(unit: &WorkUnit, filter: &dyn VisibilityFilter) -> Delta {
    let snapshot = &unit.snapshot;
    let mut delta = Delta {
        observer: unit.observer,
        tick: snapshot.tick(),
        unit: unit.seq,
        part: unit.part,
        actions: Vec::new(),
        diagnostics: Vec::new(),
    };

    let Some(view) = snapshot.observer(unit.observer) else {
        return delta;
    };

    for &entity in &unit.entities {
        match evaluate_candidate(snapshot, view, entity, filter) {
            Ok(Some(action)) => delta.actions.push(action),
            Ok(None) => {}
            Err(error) => {
                warn!(
                    tick = snapshot.tick(),
                    observer = %unit.observer,
                    %entity,
                    %error,
                    "skipping tracking candidate"
                );
                delta.diagnostics.push(Diagnostic {
                    observer: unit.observer,
                    entity,
                    error,
                });
            }
        }
    }

    delta
}

/// [`evaluate_unit`], with any panic outside the filter contained.
///
/// `None` means the unit produced no delta and its observer must be
/// deferred for this tick.
pub(crate) fn evaluate_contained(unit: &WorkUnit, filter: &dyn VisibilityFilter) -> Option<Delta> {
    match panic::catch_unwind(AssertUnwindSafe(|| evaluate_unit(unit, filter))) {
        Ok(delta) => Some(delta),
        Err(payload) => {
            error!(
                tick = unit.tick(),
                observer = %unit.observer,
                seq = unit.seq,
                reason = %panic_message(payload.as_ref()),
                "tracking unit panicked; observer deferred"
            );
            None
        }
    }
}

/// Decide the action, if any, for one candidate.
pub fn evaluate_candidate(
    snapshot: &Snapshot,
    view: &ObserverView,
    id: EntityId,
    filter: &dyn VisibilityFilter,
) -> Result<Option<TrackAction>, EvalError> {
    let tick = snapshot.tick();
    let known = view.tracked.get(&id).copied();

    let Some(record) = snapshot.entity(id) else {
        // Despawned while tracked
        return Ok(known.map(|state| TrackAction {
            entity: id,
            kind: ActionKind::StopTrack,
            state,
        }));
    };

    if !record.position.is_finite() {
        return Err(EvalError::NonFinitePosition(id));
    }

    let visible = in_range(snapshot, &view.record, record)
        && admits(filter, &view.record, record)?;

    let action = match (visible, known) {
        (true, None) => Some(TrackAction {
            entity: id,
            kind: ActionKind::StartTrack,
            state: KnownState::of(record, tick),
        }),
        (false, Some(state)) => Some(TrackAction {
            entity: id,
            kind: ActionKind::StopTrack,
            state,
        }),
        (true, Some(state)) if snapshot.rules().is_material(&state, record, tick) => {
            Some(TrackAction {
                entity: id,
                kind: ActionKind::Update,
                state: KnownState::of(record, tick),
            })
        }
        _ => None,
    };

    Ok(action)
}

#[inline]
fn in_range(snapshot: &Snapshot, observer: &ObserverRecord, record: &EntityRecord) -> bool {
    if observer.self_entity == Some(record.id) {
        return false;
    }
    let radius = snapshot
        .rules()
        .effective_radius(observer.radius, record.category);
    observer.position.horizontal_distance_sq(record.position) <= radius * radius
}

fn admits(
    filter: &dyn VisibilityFilter,
    observer: &ObserverRecord,
    record: &EntityRecord,
) -> Result<bool, EvalError> {
    match panic::catch_unwind(AssertUnwindSafe(|| filter.admits(observer, record))) {
        Ok(result) => result,
        Err(payload) => Err(EvalError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}
