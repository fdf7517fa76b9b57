//! Sliding-window landmark averaging.

use log::debug;
use std::collections::VecDeque;
use std::time::Duration;

use crate::landmarks::{LANDMARK_COUNT, LandmarkFrame, Point, SmoothedFrame};

pub const DEFAULT_WINDOW: usize = 5;

#[derive(Debug)]
pub struct LandmarkSmoother {
    window: VecDeque<LandmarkFrame>,
    capacity: usize,
    reset_after: Duration,
    missing_since: Option<Duration>,
}

impl LandmarkSmoother {
    pub fn new(capacity: usize, reset_after: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            reset_after,
            missing_since: None,
        }
    }

    /// Adds a frame, evicting the oldest once full. Emits the coordinate-wise
    /// mean only while the window is full.
    pub fn push(&mut self, frame: LandmarkFrame) -> Option<SmoothedFrame> {
        self.missing_since = None;
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(frame);

        if self.window.len() < self.capacity {
            return None;
        }
        Some(self.mean())
    }

    /// Called for frames where the tracker saw no hand. Clears the window once
    /// the hand has been gone for `reset_after`.
    pub fn hand_missing(&mut self, now: Duration) {
        let since = *self.missing_since.get_or_insert(now);
        if !self.window.is_empty() && now.saturating_sub(since) >= self.reset_after {
            debug!(
                "hand lost for {:?}; dropping {} buffered frames",
                now - since,
                self.window.len()
            );
            self.window.clear();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.window.len()
    }

    #[cfg(test)]
    fn is_ready(&self) -> bool {
        self.window.len() == self.capacity
    }

    fn mean(&self) -> SmoothedFrame {
        // f64 accumulation: averaging identical f32 inputs gives them back exactly
        let mut acc = [(0.0f64, 0.0f64); LANDMARK_COUNT];
        for frame in &self.window {
            for (sum, p) in acc.iter_mut().zip(frame.points()) {
                sum.0 += f64::from(p.x);
                sum.1 += f64::from(p.y);
            }
        }
        let n = self.window.len() as f64;
        let mut points = [Point::default(); LANDMARK_COUNT];
        for (out, (sx, sy)) in points.iter_mut().zip(acc) {
            *out = Point::new((sx / n) as f32, (sy / n) as f32);
        }
        SmoothedFrame::from_frame(LandmarkFrame::new(points))
    }
}

impl Default for LandmarkSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, Duration::from_millis(500))
    }
}
