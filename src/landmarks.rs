//! Hand landmark frames as delivered by the external tracker.

use serde::Deserialize;

pub const LANDMARK_COUNT: usize = 21;

pub const WRIST: usize = 0;
pub const THUMB_IP: usize = 3;
pub const THUMB_TIP: usize = 4;
pub const INDEX_TIP: usize = 8;
pub const MIDDLE_TIP: usize = 12;
pub const RING_TIP: usize = 16;
pub const PINKY_TIP: usize = 20;

/// Fingertips in thumb, index, middle, ring, pinky order.
pub const TIP_IDS: [usize; 5] = [THUMB_TIP, INDEX_TIP, MIDDLE_TIP, RING_TIP, PINKY_TIP];

/// Normalized image coordinates, both axes in [0,1], y grows downward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// One tracked hand: 21 points indexed by anatomical landmark id.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkFrame {
    points: [Point; LANDMARK_COUNT],
}

impl LandmarkFrame {
    pub fn new(points: [Point; LANDMARK_COUNT]) -> Self {
        Self { points }
    }

    /// Returns `None` unless exactly 21 points are given.
    pub fn from_slice(points: &[Point]) -> Option<Self> {
        let points: [Point; LANDMARK_COUNT] = points.try_into().ok()?;
        Some(Self { points })
    }

    pub fn point(&self, id: usize) -> Point {
        self.points[id]
    }

    pub fn points(&self) -> &[Point; LANDMARK_COUNT] {
        &self.points
    }

    pub fn wrist(&self) -> Point {
        self.points[WRIST]
    }
}

/// Output of the smoother. Same shape as a raw frame, kept as a separate
/// type so only denoised geometry reaches the classifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmoothedFrame(LandmarkFrame);

impl SmoothedFrame {
    pub(crate) fn from_frame(frame: LandmarkFrame) -> Self {
        Self(frame)
    }

    pub fn point(&self, id: usize) -> Point {
        self.0.point(id)
    }

    #[cfg(test)]
    pub fn frame(&self) -> &LandmarkFrame {
        &self.0
    }

    /// Largest wrist-to-fingertip distance over the five fingertips.
    pub fn max_tip_distance(&self) -> f32 {
        let wrist = self.0.wrist();
        TIP_IDS
            .iter()
            .map(|&id| self.0.point(id).distance(&wrist))
            .fold(0.0, f32::max)
    }

    pub fn thumb_index_distance(&self) -> f32 {
        self.0.point(THUMB_TIP).distance(&self.0.point(INDEX_TIP))
    }
}

// --------- tracker wire format ----------

#[derive(Debug, Clone, Deserialize)]
pub struct HandJson {
    pub landmarks: Vec<Point>,
}

/// One line printed by the tracker process (or stored in a recording).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrackerLine {
    #[serde(default)]
    pub hands: Vec<HandJson>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub quit: bool,
}

impl TrackerLine {
    /// First detected hand, if it carries a full landmark set.
    pub fn first_hand(&self) -> Option<LandmarkFrame> {
        let hand = self.hands.first()?;
        LandmarkFrame::from_slice(&hand.landmarks)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Synthetic hands for tests. Wrist at (0.5, 0.8), fingers pointing up.

    use super::*;

    /// Builds a hand from a finger-state pattern (thumb..pinky).
    pub fn hand(extended: [bool; 5]) -> LandmarkFrame {
        let mut pts = [Point::new(0.5, 0.8); LANDMARK_COUNT];

        // thumb chain 1..=4, extended means tip left of the IP joint (mirrored view)
        pts[1] = Point::new(0.45, 0.75);
        pts[2] = Point::new(0.42, 0.70);
        pts[THUMB_IP] = Point::new(0.40, 0.66);
        pts[THUMB_TIP] = if extended[0] {
            Point::new(0.35, 0.62)
        } else {
            Point::new(0.44, 0.64)
        };

        let columns = [0.45, 0.50, 0.55, 0.60];
        for (f, &x) in columns.iter().enumerate() {
            let base = 5 + f * 4;
            pts[base] = Point::new(x, 0.60); // mcp
            pts[base + 1] = Point::new(x, 0.50); // pip
            pts[base + 2] = Point::new(x, 0.45); // dip
            pts[base + 3] = if extended[f + 1] {
                Point::new(x, 0.35)
            } else {
                Point::new(x, 0.55)
            };
        }
        LandmarkFrame::new(pts)
    }

    /// Closed fist: every landmark within `radius` of the wrist, all curled.
    pub fn fist(radius: f32) -> LandmarkFrame {
        let w = Point::new(0.5, 0.5);
        let mut pts = [w; LANDMARK_COUNT];
        // thumb tip right of its IP joint -> curled
        pts[THUMB_IP] = Point::new(w.x - radius * 0.5, w.y);
        pts[THUMB_TIP] = Point::new(w.x - radius * 0.2, w.y - radius * 0.2);
        for f in 0..4 {
            let base = 5 + f * 4;
            let x = w.x - radius * 0.3 + f as f32 * radius * 0.2;
            pts[base] = Point::new(x, w.y - radius * 0.9);
            pts[base + 1] = Point::new(x, w.y - radius * 0.8);
            pts[base + 2] = Point::new(x, w.y - radius * 0.6);
            // tip below pip -> curled
            pts[base + 3] = Point::new(x, w.y - radius * 0.4);
        }
        LandmarkFrame::new(pts)
    }

    pub fn smoothed(frame: LandmarkFrame) -> SmoothedFrame {
        SmoothedFrame::from_frame(frame)
    }
}
