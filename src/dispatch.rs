use log::{debug, info};
use std::collections::VecDeque;
use std::time::Duration;

use crate::actions::Action;
use crate::debounce::ActionCooldowns;
use crate::gestures::Gesture;

const ACTION_LOG_LEN: usize = 32;

/// Static gesture -> action table.
pub fn action_for(gesture: Gesture) -> Option<Action> {
    let action = match gesture {
        Gesture::ThumbsUp => Action::Terminate,
        Gesture::TwoFingers => Action::PlayPause,
        Gesture::Fist => Action::CloseWindow,
        Gesture::ThreeFingers => Action::SwitchTab,
        Gesture::FourFingers => Action::Minimize,
        Gesture::FiveFingers => Action::Maximize,
        Gesture::Rock => Action::ToggleMute,
        Gesture::Notepad => Action::LaunchEditor,
        Gesture::Ok => Action::OpenFileBrowser,
        Gesture::None => return None,
    };
    Some(action)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionOutcome {
    pub gesture: Gesture,
    pub action: Action,
    pub at: Duration,
}

impl ActionOutcome {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "gesture": self.gesture.as_str(),
            "action": self.action.key(),
            "at_ms": self.at.as_millis() as u64,
        })
    }
}

/// Resolves gestures to actions under per-action cooldowns and keeps a short
/// log of what was dispatched. Executing the action is the caller's job.
#[derive(Debug)]
pub struct ActionDispatcher {
    cooldowns: ActionCooldowns,
    log: VecDeque<ActionOutcome>,
    total: usize,
}

impl ActionDispatcher {
    pub fn new(cooldowns: ActionCooldowns) -> Self {
        Self {
            cooldowns,
            log: VecDeque::with_capacity(ACTION_LOG_LEN),
            total: 0,
        }
    }

    pub fn dispatch(&mut self, gesture: Gesture, now: Duration) -> Option<ActionOutcome> {
        let action = action_for(gesture)?;
        if !self.cooldowns.try_acquire(action.key(), now) {
            debug!("action '{action}' cooling down; '{gesture}' ignored");
            return None;
        }
        let outcome = ActionOutcome {
            gesture,
            action,
            at: now,
        };
        info!("gesture '{gesture}' -> action '{action}' at {:.2}s", now.as_secs_f32());
        if self.log.len() == ACTION_LOG_LEN {
            self.log.pop_front();
        }
        self.log.push_back(outcome);
        self.total += 1;
        Some(outcome)
    }

    pub fn recent(&self) -> impl Iterator<Item = &ActionOutcome> {
        self.log.iter()
    }

    /// Total dispatched, including entries that fell out of the log.
    pub fn dispatched(&self) -> usize {
        self.total
    }
}

impl Default for ActionDispatcher {
    fn default() -> Self {
        Self::new(ActionCooldowns::default())
    }
}
