//! Shuttle position animation and speed telemetry.
//!
//! Positions are expressed in layout pixels along the aisle. One rack takes
//! `SLOT_HEIGHT_PX + SLOT_GAP_PX`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::ShuttleState;

pub const SLOT_HEIGHT_PX: f64 = 25.0;
pub const SLOT_GAP_PX: f64 = 10.0;
pub const RACK_PITCH_PX: f64 = SLOT_HEIGHT_PX + SLOT_GAP_PX;
pub const ANIMATION_DURATION: Duration = Duration::from_millis(1500);
pub const MAX_DISPLAY_SPEED: f64 = 10.0;
pub const SPEED_HISTORY_LEN: usize = 20;
const MIN_ELAPSED_SECS: f64 = 0.001;

pub fn rack_offset_px(rack: i64) -> f64 {
    rack as f64 * RACK_PITCH_PX
}

/// Nearest rack index for an offset produced by [`rack_offset_px`].
pub fn rack_at_offset(offset_px: f64) -> i64 {
    (offset_px / RACK_PITCH_PX).round() as i64
}

pub fn ease_out_cubic(progress: f64) -> f64 {
    let p = progress.clamp(0.0, 1.0);
    1.0 - (1.0 - p).powi(3)
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Transition {
    from_px: f64,
    to_px: f64,
    started_at: Instant,
}

/// Output of one animation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnimationFrame {
    pub position_px: f64,
    pub implied_rack: i64,
    pub finished: bool,
}

#[derive(Debug, Clone)]
pub struct PositionAnimator {
    position_px: f64,
    is_animating: bool,
    shuttle_speed: f64,
    total_distance: f64,
    speed_history: VecDeque<f64>,
    previous_rack: Option<i64>,
    last_change_at: Option<Instant>,
    transition: Option<Transition>,
}

impl Default for PositionAnimator {
    fn default() -> Self {
        Self {
            position_px: 0.0,
            is_animating: false,
            shuttle_speed: 0.0,
            total_distance: 0.0,
            speed_history: VecDeque::with_capacity(SPEED_HISTORY_LEN),
            previous_rack: None,
            last_change_at: None,
            transition: None,
        }
    }
}

impl PositionAnimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// React to a new shuttle state. Only a change of the visible rack starts
    /// a transition; losing the rack stops the animation and zeroes speed.
    pub fn observe(&mut self, state: &ShuttleState, now: Instant) {
        let Some(rack) = state.visible_rack() else {
            // land on the rack `previous_rack` already points at
            if let Some(transition) = self.transition.take() {
                self.position_px = transition.to_px;
            }
            self.is_animating = false;
            self.shuttle_speed = 0.0;
            return;
        };

        let Some(previous) = self.previous_rack else {
            self.position_px = rack_offset_px(rack);
            self.previous_rack = Some(rack);
            self.last_change_at = Some(now);
            return;
        };
        if previous == rack {
            return;
        }

        let distance = (rack - previous).unsigned_abs() as f64;
        let elapsed = self
            .last_change_at
            .map(|at| now.saturating_duration_since(at).as_secs_f64())
            .unwrap_or(0.0)
            .max(MIN_ELAPSED_SECS);
        let speed = (distance / elapsed).min(MAX_DISPLAY_SPEED);
        self.shuttle_speed = speed;
        if self.speed_history.len() == SPEED_HISTORY_LEN {
            self.speed_history.pop_front();
        }
        self.speed_history.push_back(speed);
        self.total_distance += distance;

        self.transition = Some(Transition {
            from_px: self.position_px,
            to_px: rack_offset_px(rack),
            started_at: now,
        });
        self.is_animating = true;
        self.previous_rack = Some(rack);
        self.last_change_at = Some(now);
    }

    /// Advance the running transition, if any.
    pub fn step(&mut self, now: Instant) -> Option<AnimationFrame> {
        let transition = self.transition?;
        let elapsed = now.saturating_duration_since(transition.started_at);
        let progress = elapsed.as_secs_f64() / ANIMATION_DURATION.as_secs_f64();
        let eased = ease_out_cubic(progress);
        self.position_px = transition.from_px + (transition.to_px - transition.from_px) * eased;

        let finished = progress >= 1.0;
        if finished {
            self.position_px = transition.to_px;
            self.transition = None;
            self.is_animating = false;
            self.shuttle_speed = 0.0;
        }
        Some(AnimationFrame {
            position_px: self.position_px,
            implied_rack: rack_at_offset(self.position_px),
            finished,
        })
    }

    pub fn position_px(&self) -> f64 {
        self.position_px
    }

    pub fn current_rack(&self) -> i64 {
        rack_at_offset(self.position_px)
    }

    pub fn is_animating(&self) -> bool {
        self.is_animating
    }

    pub fn speed(&self) -> f64 {
        self.shuttle_speed
    }

    pub fn average_speed(&self) -> f64 {
        if self.speed_history.is_empty() {
            return 0.0;
        }
        self.speed_history.iter().sum::<f64>() / self.speed_history.len() as f64
    }

    pub fn total_distance(&self) -> f64 {
        self.total_distance
    }

    pub fn speed_history(&self) -> impl Iterator<Item = f64> + '_ {
        self.speed_history.iter().copied()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CellCoord, DisplayLabel, ShuttleAction};

    fn at_rack(rack: i64) -> ShuttleState {
        let mut state = ShuttleState::default();
        state.set_target(
            CellCoord {
                row: 0,
                rack,
                slot: 1,
                depth: 0,
            },
            ShuttleAction::Storing,
            DisplayLabel::Storing,
        );
        state
    }

    #[test]
    fn offsets_round_trip_through_rack_index() {
        assert_eq!(rack_offset_px(3), 105.0);
        assert_eq!(rack_at_offset(105.0), 3);
        assert_eq!(rack_at_offset(120.0), 3);
        assert_eq!(rack_at_offset(123.0), 4);
    }

    #[test]
    fn easing_is_cubic_ease_out() {
        assert_eq!(ease_out_cubic(0.0), 0.0);
        assert_eq!(ease_out_cubic(1.0), 1.0);
        assert!((ease_out_cubic(0.5) - 0.875).abs() < 1e-9);
        assert_eq!(ease_out_cubic(2.0), 1.0);
    }

    #[test]
    fn first_observation_snaps_without_speed() {
        let now = Instant::now();
        let mut animator = PositionAnimator::new();
        animator.observe(&at_rack(6), now);
        assert_eq!(animator.position_px(), rack_offset_px(6));
        assert!(!animator.is_animating());
        assert_eq!(animator.speed(), 0.0);
        assert_eq!(animator.total_distance(), 0.0);
        assert!(animator.step(now).is_none());
    }

    #[test]
    fn speed_is_capped_for_fast_moves() {
        let start = Instant::now();
        let mut animator = PositionAnimator::new();
        animator.observe(&at_rack(0), start);
        animator.observe(&at_rack(3), start + Duration::from_millis(100));
        assert_eq!(animator.speed(), MAX_DISPLAY_SPEED);
        assert_eq!(animator.total_distance(), 3.0);
        assert!(animator.speed_history().all(|s| s <= MAX_DISPLAY_SPEED));
    }

    #[test]
    fn speed_and_distance_accumulate() {
        let start = Instant::now();
        let mut animator = PositionAnimator::new();
        animator.observe(&at_rack(0), start);
        animator.observe(&at_rack(2), start + Duration::from_secs(1));
        assert!((animator.speed() - 2.0).abs() < 1e-9);
        animator.observe(&at_rack(6), start + Duration::from_secs(3));
        assert!((animator.speed() - 2.0).abs() < 1e-9);
        assert_eq!(animator.total_distance(), 6.0);
        assert!((animator.average_speed() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn speed_history_keeps_last_twenty_samples() {
        let start = Instant::now();
        let mut animator = PositionAnimator::new();
        animator.observe(&at_rack(0), start);
        for i in 1..=25_i64 {
            let rack = if i % 2 == 0 { 0 } else { 1 };
            animator.observe(&at_rack(rack), start + Duration::from_secs(i as u64));
        }
        assert_eq!(animator.speed_history().count(), SPEED_HISTORY_LEN);
        assert_eq!(animator.total_distance(), 25.0);
    }

    #[test]
    fn transition_eases_to_target_and_resets_speed() {
        let start = Instant::now();
        let mut animator = PositionAnimator::new();
        animator.observe(&at_rack(0), start);
        let moved_at = start + Duration::from_secs(2);
        animator.observe(&at_rack(4), moved_at);
        assert!(animator.is_animating());

        let halfway = animator
            .step(moved_at + Duration::from_millis(750))
            .expect("frame while animating");
        assert!(!halfway.finished);
        assert!((halfway.position_px - rack_offset_px(4) * 0.875).abs() < 1e-6);
        assert_eq!(halfway.implied_rack, 4);
        assert!(animator.speed() > 0.0);

        let done = animator
            .step(moved_at + ANIMATION_DURATION)
            .expect("final frame");
        assert!(done.finished);
        assert_eq!(done.position_px, rack_offset_px(4));
        assert!(!animator.is_animating());
        assert_eq!(animator.speed(), 0.0);
        assert!(animator.step(moved_at + Duration::from_secs(5)).is_none());
    }

    #[test]
    fn retarget_mid_flight_starts_from_current_offset() {
        let start = Instant::now();
        let mut animator = PositionAnimator::new();
        animator.observe(&at_rack(0), start);
        animator.observe(&at_rack(10), start + Duration::from_secs(1));
        let frame = animator
            .step(start + Duration::from_millis(1750))
            .expect("mid frame");
        animator.observe(&at_rack(2), start + Duration::from_millis(1750));
        let next = animator
            .step(start + Duration::from_millis(1750))
            .expect("restart frame");
        assert!((next.position_px - frame.position_px).abs() < 1e-9);
    }

    #[test]
    fn invisible_state_stops_animation() {
        let start = Instant::now();
        let mut animator = PositionAnimator::new();
        animator.observe(&at_rack(0), start);
        animator.observe(&at_rack(5), start + Duration::from_secs(1));
        assert!(animator.speed() > 0.0);

        let mut hidden = at_rack(5);
        hidden.store_row = 2;
        animator.observe(&hidden, start + Duration::from_millis(1100));
        assert!(!animator.is_animating());
        assert_eq!(animator.speed(), 0.0);
        assert!(animator.step(start + Duration::from_millis(1200)).is_none());
    }

    #[test]
    fn hidden_mid_flight_then_visible_at_same_rack_lands_on_it() {
        let start = Instant::now();
        let mut animator = PositionAnimator::new();
        animator.observe(&at_rack(0), start);
        animator.observe(&at_rack(10), start + Duration::from_secs(1));
        animator.step(start + Duration::from_millis(1100));
        assert!(animator.position_px() < rack_offset_px(10));

        let mut cleared = at_rack(10);
        cleared.clear_target();
        animator.observe(&cleared, start + Duration::from_millis(1200));
        assert_eq!(animator.position_px(), rack_offset_px(10));

        animator.observe(&at_rack(10), start + Duration::from_secs(3));
        animator.step(start + Duration::from_secs(6));
        assert_eq!(animator.current_rack(), 10);
        assert_eq!(animator.position_px(), rack_offset_px(10));
        assert!(!animator.is_animating());
    }
}
