use crate::fingers::FingerState;
use crate::landmarks::SmoothedFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gesture {
    Fist,
    ThumbsUp,
    TwoFingers,
    ThreeFingers,
    FourFingers,
    FiveFingers,
    Rock,
    Notepad,
    Ok,
    None,
}

impl Gesture {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fist => "fist",
            Self::ThumbsUp => "thumbs_up",
            Self::TwoFingers => "two_fingers",
            Self::ThreeFingers => "three_fingers",
            Self::FourFingers => "four_fingers",
            Self::FiveFingers => "five_fingers",
            Self::Rock => "rock",
            Self::Notepad => "notepad",
            Self::Ok => "ok",
            Self::None => "none",
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl std::fmt::Display for Gesture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierThresholds {
    /// Fist requires every fingertip closer than this to the wrist.
    pub fist_max_tip_distance: f32,
    /// Ok requires thumb tip and index tip closer than this.
    pub ok_max_pinch_distance: f32,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        Self {
            fist_max_tip_distance: 0.10,
            ok_max_pinch_distance: 0.04,
        }
    }
}

struct RuleInput<'a> {
    fingers: FingerState,
    frame: &'a SmoothedFrame,
    th: &'a ClassifierThresholds,
}

type Predicate = fn(&RuleInput<'_>) -> bool;

// Evaluated top to bottom, first match wins. five_fingers is a count check,
// not a fixed vector. ok has no finger-state vector and must stay last.
const RULES: [(Gesture, Predicate); 9] = [
    (Gesture::Fist, is_fist),
    (Gesture::ThreeFingers, is_three_fingers),
    (Gesture::ThumbsUp, is_thumbs_up),
    (Gesture::TwoFingers, is_two_fingers),
    (Gesture::FourFingers, is_four_fingers),
    (Gesture::FiveFingers, is_five_fingers),
    (Gesture::Rock, is_rock),
    (Gesture::Notepad, is_notepad),
    (Gesture::Ok, is_ok),
];

fn is_fist(r: &RuleInput<'_>) -> bool {
    r.fingers.all_curled() && r.frame.max_tip_distance() < r.th.fist_max_tip_distance
}

fn is_three_fingers(r: &RuleInput<'_>) -> bool {
    r.fingers.0 == [false, true, true, true, false]
}

fn is_thumbs_up(r: &RuleInput<'_>) -> bool {
    r.fingers.0 == [true, false, false, false, false]
}

fn is_two_fingers(r: &RuleInput<'_>) -> bool {
    r.fingers.0 == [false, true, true, false, false]
}

fn is_four_fingers(r: &RuleInput<'_>) -> bool {
    r.fingers.0 == [false, true, true, true, true]
}

fn is_five_fingers(r: &RuleInput<'_>) -> bool {
    r.fingers.extended_count() == 5
}

fn is_rock(r: &RuleInput<'_>) -> bool {
    r.fingers.0 == [false, true, false, false, true]
}

fn is_notepad(r: &RuleInput<'_>) -> bool {
    r.fingers.0 == [false, true, false, false, false]
}

fn is_ok(r: &RuleInput<'_>) -> bool {
    r.frame.thumb_index_distance() < r.th.ok_max_pinch_distance
}

#[derive(Debug, Clone, Default)]
pub struct GestureClassifier {
    th: ClassifierThresholds,
}

impl GestureClassifier {
    pub fn new(th: ClassifierThresholds) -> Self {
        Self { th }
    }

    pub fn classify(&self, fingers: FingerState, frame: &SmoothedFrame) -> Gesture {
        let input = RuleInput {
            fingers,
            frame,
            th: &self.th,
        };
        RULES
            .iter()
            .find(|(_, matches)| matches(&input))
            .map(|(g, _)| *g)
            .unwrap_or(Gesture::None)
    }

    /// Rule names in evaluation order.
    #[cfg(test)]
    fn rule_order() -> impl Iterator<Item = Gesture> {
        RULES.iter().map(|(g, _)| *g)
    }
}
