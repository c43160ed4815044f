use std::time::{Duration, Instant};

use crate::motion::SLOT_HEIGHT_PX;

pub const SCROLL_PADDING_PX: f64 = 60.0;
pub const SCROLL_THROTTLE: Duration = Duration::from_millis(50);

/// Size of the scrollable rack container, in layout pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportMetrics {
    pub viewport_height: f64,
    pub content_height: f64,
}

impl ViewportMetrics {
    pub fn max_scroll(&self) -> f64 {
        (self.content_height - self.viewport_height).max(0.0)
    }
}

/// Keeps the animated shuttle inside the visible part of the rack column.
#[derive(Debug, Clone, Default)]
pub struct AutoScroller {
    scroll_top: f64,
    last_scroll_at: Option<Instant>,
}

impl AutoScroller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scroll_top(&self) -> f64 {
        self.scroll_top
    }

    /// Manual scrolling by the operator. Not throttled.
    pub fn set_scroll_top(&mut self, scroll_top: f64, metrics: ViewportMetrics) {
        self.scroll_top = scroll_top.clamp(0.0, metrics.max_scroll());
    }

    /// Whether an element at `target_px` sits inside the padded window.
    pub fn is_in_view(&self, target_px: f64, metrics: ViewportMetrics) -> bool {
        let top = self.scroll_top + SCROLL_PADDING_PX;
        let bottom = self.scroll_top + metrics.viewport_height - SCROLL_PADDING_PX;
        target_px >= top && target_px + SLOT_HEIGHT_PX <= bottom
    }

    /// Recenter on `target_px` if it left the padded window and the last
    /// scroll is older than [`SCROLL_THROTTLE`]. Returns the new scroll top.
    pub fn follow(&mut self, target_px: f64, metrics: ViewportMetrics, now: Instant) -> Option<f64> {
        if self.is_in_view(target_px, metrics) {
            return None;
        }
        if let Some(last) = self.last_scroll_at {
            if now.saturating_duration_since(last) < SCROLL_THROTTLE {
                return None;
            }
        }
        let centered = target_px - metrics.viewport_height / 2.0 + SLOT_HEIGHT_PX / 2.0;
        let next = centered.clamp(0.0, metrics.max_scroll());
        self.last_scroll_at = Some(now);
        if (next - self.scroll_top).abs() < f64::EPSILON {
            return None;
        }
        self.scroll_top = next;
        Some(next)
    }
}
