//! Two independent rate limits: per-gesture repeat suppression and
//! per-action cooldowns.

use log::trace;
use std::collections::HashMap;
use std::time::Duration;

use crate::gestures::Gesture;

pub const DEFAULT_GESTURE_COOLDOWN: Duration = Duration::from_secs(1);
pub const DEFAULT_ACTION_COOLDOWN: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub struct GestureDebouncer {
    cooldown: Duration,
    last: Option<(Gesture, Duration)>,
}

impl GestureDebouncer {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last: None,
        }
    }

    /// Whether this occurrence should reach the dispatcher. A changed gesture
    /// always passes; holding the same pose passes again once the cooldown
    /// has elapsed since it last passed. `None` never passes and leaves the
    /// repeat state alone.
    pub fn accept(&mut self, gesture: Gesture, now: Duration) -> bool {
        if gesture.is_none() {
            return false;
        }
        let pass = match self.last {
            Some((prev, at)) if prev == gesture => now.saturating_sub(at) >= self.cooldown,
            _ => true,
        };
        if pass {
            self.last = Some((gesture, now));
        } else {
            trace!("repeat of {gesture} suppressed");
        }
        pass
    }

    #[cfg(test)]
    fn last(&self) -> Option<(Gesture, Duration)> {
        self.last
    }
}

impl Default for GestureDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_GESTURE_COOLDOWN)
    }
}

/// Last execution time per action key.
#[derive(Debug)]
pub struct ActionCooldowns {
    cooldown: Duration,
    last_run: HashMap<&'static str, Duration>,
}

impl ActionCooldowns {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_run: HashMap::new(),
        }
    }

    /// Checks and, on success, stamps `key` in one step.
    pub fn try_acquire(&mut self, key: &'static str, now: Duration) -> bool {
        if let Some(&at) = self.last_run.get(key) {
            if now.saturating_sub(at) < self.cooldown {
                return false;
            }
        }
        self.last_run.insert(key, now);
        true
    }

    #[cfg(test)]
    fn last_run(&self, key: &str) -> Option<Duration> {
        self.last_run.get(key).copied()
    }
}

impl Default for ActionCooldowns {
    fn default() -> Self {
        Self::new(DEFAULT_ACTION_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn held_pose_is_suppressed_inside_cooldown() {
        let mut d = GestureDebouncer::default();
        assert!(d.accept(Gesture::Rock, secs(0.0)));
        assert!(!d.accept(Gesture::Rock, secs(0.5)));
    }

    #[test]
    fn held_pose_retriggers_after_cooldown() {
        let mut d = GestureDebouncer::default();
        assert!(d.accept(Gesture::Rock, secs(0.0)));
        assert!(d.accept(Gesture::Rock, secs(1.1)));
    }

    #[test]
    fn suppressed_repeat_does_not_extend_window() {
        let mut d = GestureDebouncer::default();
        assert!(d.accept(Gesture::Rock, secs(0.0)));
        assert!(!d.accept(Gesture::Rock, secs(0.9)));
        assert!(d.accept(Gesture::Rock, secs(1.0)));
    }

    #[test]
    fn different_gesture_passes_immediately() {
        let mut d = GestureDebouncer::default();
        assert!(d.accept(Gesture::Rock, secs(0.0)));
        assert!(d.accept(Gesture::Fist, secs(0.1)));
        assert!(d.accept(Gesture::Rock, secs(0.2)));
    }

    #[test]
    fn none_never_passes_and_keeps_state() {
        let mut d = GestureDebouncer::default();
        assert!(!d.accept(Gesture::None, secs(0.0)));
        assert!(d.last().is_none());
        assert!(d.accept(Gesture::Ok, secs(0.1)));
        assert!(!d.accept(Gesture::None, secs(0.2)));
        assert!(!d.accept(Gesture::Ok, secs(0.3)));
        assert_eq!(d.last(), Some((Gesture::Ok, secs(0.1))));
    }

    #[test]
    fn action_cooldown_is_per_key() {
        let mut c = ActionCooldowns::default();
        assert!(c.try_acquire("notepad", secs(0.0)));
        assert!(!c.try_acquire("notepad", secs(1.0)));
        assert!(c.try_acquire("mute", secs(1.0)));
        assert!(c.try_acquire("notepad", secs(3.0)));
        assert_eq!(c.last_run("notepad"), Some(secs(3.0)));
    }
}
