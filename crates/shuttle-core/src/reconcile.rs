//! Folds the newest action events into the next [`ShuttleState`].
//!
//! The backend emits a `start` event when a store or retrieve begins and a
//! `stop` event when it ends. A failed retrieve falls back to the previous
//! record, which holds the shuttle position before the failed move. A failed
//! store clears the target since the tray never left its slot.

use crate::pubsub::{DecodedEvent, Operation, Phase};
use crate::{DisplayLabel, ShuttleAction, ShuttleState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileRule {
    StoreStarted,
    StoreCompleted,
    StoreFailed,
    RetrieveStarted,
    RetrieveStartFailed,
    RetrieveCompleted,
    RetrieveFailedFallback,
    RetrieveFailedNoFallback,
    Unrecognized,
}

impl ReconcileRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileRule::StoreStarted => "store_started",
            ReconcileRule::StoreCompleted => "store_completed",
            ReconcileRule::StoreFailed => "store_failed",
            ReconcileRule::RetrieveStarted => "retrieve_started",
            ReconcileRule::RetrieveStartFailed => "retrieve_start_failed",
            ReconcileRule::RetrieveCompleted => "retrieve_completed",
            ReconcileRule::RetrieveFailedFallback => "retrieve_failed_fallback",
            ReconcileRule::RetrieveFailedNoFallback => "retrieve_failed_no_fallback",
            ReconcileRule::Unrecognized => "unrecognized",
        }
    }

    /// Whether this rule touches the `store_*` target fields at all.
    pub fn updates_target(&self) -> bool {
        !matches!(
            self,
            ReconcileRule::RetrieveStartFailed
                | ReconcileRule::RetrieveFailedNoFallback
                | ReconcileRule::Unrecognized
        )
    }
}

pub fn classify(first: &DecodedEvent, second: Option<&DecodedEvent>) -> ReconcileRule {
    match (first.operation(), first.phase(), first.success) {
        (Operation::Store, Phase::Start, _) => ReconcileRule::StoreStarted,
        (Operation::Store, Phase::Stop, true) => ReconcileRule::StoreCompleted,
        (Operation::Store, Phase::Stop, false) => ReconcileRule::StoreFailed,
        (Operation::Retrieve, Phase::Stop, true) => ReconcileRule::RetrieveCompleted,
        (Operation::Retrieve, Phase::Stop, false) => {
            if second.is_some() {
                ReconcileRule::RetrieveFailedFallback
            } else {
                ReconcileRule::RetrieveFailedNoFallback
            }
        }
        (Operation::Retrieve, Phase::Start, true) => ReconcileRule::RetrieveStarted,
        (Operation::Retrieve, Phase::Start, false) => ReconcileRule::RetrieveStartFailed,
        _ => ReconcileRule::Unrecognized,
    }
}

/// Compute the next state from `prev` and the newest one or two events.
///
/// The move fields always follow `first`. The target fields are patched only
/// by the rule that matches; everything else is carried over from `prev`.
pub fn reconcile(
    prev: &ShuttleState,
    first: &DecodedEvent,
    second: Option<&DecodedEvent>,
) -> ShuttleState {
    let mut next = prev.clone();
    next.shuttle_move_tray = first.metadata.tray_id.clone();
    next.shuttle_move_rack = Some(first.rack);
    next.shuttle_move_slot = first.metadata.slot_id.clone();
    next.shuttle_move_row = Some(first.row);

    match classify(first, second) {
        ReconcileRule::StoreStarted => {
            next.set_target(first.cell(), ShuttleAction::Storing, DisplayLabel::Storing)
        }
        ReconcileRule::StoreCompleted => {
            next.set_target(first.cell(), ShuttleAction::Stored, DisplayLabel::Stored)
        }
        ReconcileRule::StoreFailed => next.clear_target(),
        ReconcileRule::RetrieveCompleted => next.set_target(
            first.cell(),
            ShuttleAction::Retrieved,
            DisplayLabel::Retrieved,
        ),
        ReconcileRule::RetrieveFailedFallback => {
            if let Some(previous) = second {
                next.set_target(
                    previous.cell(),
                    ShuttleAction::Storing,
                    DisplayLabel::Retrieved,
                );
            }
        }
        ReconcileRule::RetrieveStarted => next.set_target(
            first.cell(),
            ShuttleAction::Retrieve,
            DisplayLabel::Retrieve,
        ),
        ReconcileRule::RetrieveStartFailed
        | ReconcileRule::RetrieveFailedNoFallback
        | ReconcileRule::Unrecognized => {}
    }
    next
}
