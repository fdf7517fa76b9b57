//! Per-finger extended/curled flags from one smoothed frame.

use crate::landmarks::{SmoothedFrame, THUMB_IP, THUMB_TIP, TIP_IDS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FingerState(pub [bool; 5]);

impl FingerState {
    pub fn extended_count(&self) -> usize {
        self.0.iter().filter(|&&e| e).count()
    }

    pub fn all_curled(&self) -> bool {
        self.extended_count() == 0
    }
}

/// Thumb: tip left of the IP joint. This assumes the tracker mirrors the
/// camera image horizontally; an unmirrored feed needs the comparison flipped.
///
/// Other fingers: tip above (smaller y than) the PIP joint two landmarks down
/// the same chain.
pub fn extract(frame: &SmoothedFrame) -> FingerState {
    let mut state = [false; 5];
    state[0] = frame.point(THUMB_TIP).x < frame.point(THUMB_IP).x;
    for (i, &tip) in TIP_IDS.iter().enumerate().skip(1) {
        state[i] = frame.point(tip).y < frame.point(tip - 2).y;
    }
    FingerState(state)
}
