use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod motion;
pub mod pubsub;
pub mod reconcile;
pub mod viewport;

pub use pubsub::{decode_latest, decode_record, topic_name, DecodeError, DecodedEvent};
pub use reconcile::{classify, reconcile, ReconcileRule};

/// Sentinel `store_row` meaning the shuttle has no active target.
pub const NO_TARGET_ROW: i64 = -1;

/// Rows on either side of the aisle. Anything else is treated as idle.
pub const VISIBLE_ROWS: [i64; 2] = [0, 1];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ShuttleAction {
    Storing,
    Stored,
    Retrieved,
    Retrieve,
    /// Unanimated transit toward the back of the aisle; never rendered.
    Backward,
    /// Unanimated transit toward the front of the aisle; never rendered.
    Forward,
}

impl ShuttleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShuttleAction::Storing => "Storing",
            ShuttleAction::Stored => "Stored",
            ShuttleAction::Retrieved => "Retrieved",
            ShuttleAction::Retrieve => "Retrieve",
            ShuttleAction::Backward => "backward",
            ShuttleAction::Forward => "forward",
        }
    }

    pub fn is_transit(&self) -> bool {
        matches!(self, ShuttleAction::Backward | ShuttleAction::Forward)
    }
}

impl fmt::Display for ShuttleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShuttleAction {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "storing" => Ok(ShuttleAction::Storing),
            "stored" => Ok(ShuttleAction::Stored),
            "retrieved" => Ok(ShuttleAction::Retrieved),
            "retrieve" => Ok(ShuttleAction::Retrieve),
            "backward" => Ok(ShuttleAction::Backward),
            "forward" => Ok(ShuttleAction::Forward),
            other => Err(format!("Unknown shuttle action: {other}")),
        }
    }
}

/// Operator-facing label shown next to the rack grid.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum DisplayLabel {
    #[default]
    Ongoing,
    Storing,
    Stored,
    Retrieved,
    Retrieve,
}

impl DisplayLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayLabel::Ongoing => "Ongoing",
            DisplayLabel::Storing => "Storing",
            DisplayLabel::Stored => "Stored",
            DisplayLabel::Retrieved => "Retrieved",
            DisplayLabel::Retrieve => "Retrieve",
        }
    }
}

impl fmt::Display for DisplayLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical storage cell addressed by an action event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct CellCoord {
    pub row: i64,
    pub rack: i64,
    pub slot: i64,
    pub depth: i64,
}

/// Where the shuttle is and what it is doing, as last derived from the
/// pub/sub stream. Always replaced as a whole.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShuttleState {
    #[serde(default)]
    pub shuttle_move_tray: Option<String>,
    #[serde(default)]
    pub shuttle_move_rack: Option<i64>,
    #[serde(default)]
    pub shuttle_move_slot: Option<String>,
    #[serde(default)]
    pub shuttle_move_row: Option<i64>,
    pub store_row: i64,
    #[serde(default)]
    pub store_rack: Option<i64>,
    #[serde(default)]
    pub store_slot: Option<i64>,
    #[serde(default)]
    pub store_depth: Option<i64>,
    #[serde(default)]
    pub shuttle_action: Option<ShuttleAction>,
    #[serde(default)]
    pub store_data_display: DisplayLabel,
    #[serde(default)]
    pub destination_name: Option<i64>,
}

impl Default for ShuttleState {
    fn default() -> Self {
        Self {
            shuttle_move_tray: None,
            shuttle_move_rack: None,
            shuttle_move_slot: None,
            shuttle_move_row: None,
            store_row: NO_TARGET_ROW,
            store_rack: None,
            store_slot: None,
            store_depth: None,
            shuttle_action: None,
            store_data_display: DisplayLabel::Ongoing,
            destination_name: None,
        }
    }
}

impl ShuttleState {
    pub fn has_target(&self) -> bool {
        self.store_row != NO_TARGET_ROW && self.store_rack.is_some()
    }

    /// Occupy `cell` with the given labels.
    pub fn set_target(&mut self, cell: CellCoord, action: ShuttleAction, display: DisplayLabel) {
        self.store_row = cell.row;
        self.store_rack = Some(cell.rack);
        self.store_slot = Some(cell.slot);
        self.store_depth = Some(cell.depth);
        self.shuttle_action = Some(action);
        self.store_data_display = display;
        self.destination_name = Some(cell.slot);
    }

    pub fn clear_target(&mut self) {
        self.store_row = NO_TARGET_ROW;
        self.store_rack = None;
        self.store_slot = None;
        self.store_depth = None;
        self.shuttle_action = None;
        self.store_data_display = DisplayLabel::Ongoing;
        self.destination_name = None;
    }

    /// The shuttle is drawn only on a real aisle row, at a real rack, and
    /// never while in one of the unanimated transit modes.
    pub fn is_shuttle_visible(&self) -> bool {
        if !VISIBLE_ROWS.contains(&self.store_row) {
            return false;
        }
        if !matches!(self.store_rack, Some(rack) if rack >= 0) {
            return false;
        }
        !self
            .shuttle_action
            .map(|action| action.is_transit())
            .unwrap_or(false)
    }

    /// Rack the animator should track, if the shuttle is visible.
    pub fn visible_rack(&self) -> Option<i64> {
        if self.is_shuttle_visible() {
            self.store_rack
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targeted() -> ShuttleState {
        let mut state = ShuttleState::default();
        state.set_target(
            CellCoord {
                row: 1,
                rack: 4,
                slot: 7,
                depth: 0,
            },
            ShuttleAction::Stored,
            DisplayLabel::Stored,
        );
        state
    }

    #[test]
    fn default_state_has_no_visible_shuttle() {
        let state = ShuttleState::default();
        assert_eq!(state.store_row, NO_TARGET_ROW);
        assert_eq!(state.store_data_display, DisplayLabel::Ongoing);
        assert!(!state.has_target());
        assert!(!state.is_shuttle_visible());
    }

    #[test]
    fn row_outside_aisle_is_never_visible() {
        let mut state = targeted();
        assert!(state.is_shuttle_visible());
        state.store_row = 2;
        assert!(!state.is_shuttle_visible());
        assert_eq!(state.visible_rack(), None);
    }

    #[test]
    fn transit_actions_and_negative_racks_are_hidden() {
        let mut state = targeted();
        state.shuttle_action = Some(ShuttleAction::Backward);
        assert!(!state.is_shuttle_visible());
        state.shuttle_action = Some(ShuttleAction::Forward);
        assert!(!state.is_shuttle_visible());

        let mut state = targeted();
        state.store_rack = Some(-3);
        assert!(!state.is_shuttle_visible());
    }

    #[test]
    fn shuttle_action_parses_reserved_transit_modes() {
        assert_eq!(
            "backward".parse::<ShuttleAction>(),
            Ok(ShuttleAction::Backward)
        );
        assert_eq!(" Stored ".parse::<ShuttleAction>(), Ok(ShuttleAction::Stored));
        assert!("parked".parse::<ShuttleAction>().is_err());
    }
}
