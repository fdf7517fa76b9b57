//! The recognition session: one worker that pulls tracker frames and runs
//! them through smoothing, classification, debouncing and dispatch.

use log::{debug, info, warn};
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};
use thiserror::Error;

use crate::actions::{Action, ActionExecutor, KeyboardSink, SystemExecutor};
use crate::config::{Profile, Tuning};
use crate::debounce::{ActionCooldowns, GestureDebouncer};
use crate::dispatch::{ActionDispatcher, ActionOutcome};
use crate::fingers;
use crate::gestures::{ClassifierThresholds, GestureClassifier};
use crate::landmarks::LandmarkFrame;
use crate::smoother::LandmarkSmoother;
use crate::tracker::{Confidence, LandmarkSource, Observation, SourceError, SubprocessTracker};

pub trait Clock {
    fn now(&self) -> Duration;
}

pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Cooperative stop signal, checked once per frame.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The raw flag, for signal handler registration.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Terminating,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    ExitGesture,
    StopSignal,
    SourceClosed,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExitGesture => "exit_gesture",
            Self::StopSignal => "stop_signal",
            Self::SourceClosed => "source_closed",
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session startup failed: {0:#}")]
    Startup(anyhow::Error),
    #[error("session already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub reason: EndReason,
    pub frames: u64,
    pub hands_seen: u64,
    pub skipped: u64,
    pub actions_dispatched: usize,
    pub recent_actions: Vec<ActionOutcome>,
    pub duration: Duration,
}

impl SessionReport {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "reason": self.reason.as_str(),
            "frames": self.frames,
            "hands_seen": self.hands_seen,
            "skipped": self.skipped,
            "actions_dispatched": self.actions_dispatched,
            "recent_actions": self.recent_actions.iter().map(|a| a.to_json()).collect::<Vec<_>>(),
            "duration_ms": self.duration.as_millis() as u64,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub smoothing_window: usize,
    pub hand_lost_reset: Duration,
    pub gesture_cooldown: Duration,
    pub action_cooldown: Duration,
    pub thresholds: ClassifierThresholds,
    pub initial_confidence: Confidence,
    pub raised_confidence: Confidence,
    pub raise_after: Duration,
}

impl From<&Tuning> for SessionSettings {
    fn from(t: &Tuning) -> Self {
        Self {
            smoothing_window: t.smoothing_window,
            hand_lost_reset: t.hand_lost_reset(),
            gesture_cooldown: t.gesture_cooldown(),
            action_cooldown: t.action_cooldown(),
            thresholds: t.classifier_thresholds(),
            initial_confidence: Confidence {
                detection: t.detection_confidence,
                tracking: t.tracking_confidence,
            },
            raised_confidence: Confidence {
                detection: t.raised_detection_confidence,
                tracking: t.raised_tracking_confidence,
            },
            raise_after: t.raise_confidence_after(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&Tuning::default())
    }
}

/// All per-session state lives here; nothing is shared between sessions.
pub struct Session<E, C> {
    settings: SessionSettings,
    executor: E,
    clock: C,
    stop: StopHandle,
    state: SessionState,
    smoother: LandmarkSmoother,
    classifier: GestureClassifier,
    debouncer: GestureDebouncer,
    dispatcher: ActionDispatcher,
}

impl<E: ActionExecutor, C: Clock> Session<E, C> {
    pub fn new(settings: SessionSettings, executor: E, clock: C, stop: StopHandle) -> Self {
        let smoother = LandmarkSmoother::new(settings.smoothing_window, settings.hand_lost_reset);
        let classifier = GestureClassifier::new(settings.thresholds);
        let debouncer = GestureDebouncer::new(settings.gesture_cooldown);
        let dispatcher = ActionDispatcher::new(ActionCooldowns::new(settings.action_cooldown));
        Self {
            settings,
            executor,
            clock,
            stop,
            state: SessionState::Idle,
            smoother,
            classifier,
            debouncer,
            dispatcher,
        }
    }

    #[cfg(test)]
    fn state(&self) -> SessionState {
        self.state
    }

    /// Opens the source with the initial confidence thresholds and runs until
    /// the exit gesture, a stop signal, or the source closing. The source is
    /// released on every one of those paths before this returns.
    pub fn run<S, F>(&mut self, open: F) -> Result<SessionReport, SessionError>
    where
        S: LandmarkSource,
        F: FnOnce(Confidence) -> anyhow::Result<S>,
    {
        if self.state != SessionState::Idle {
            return Err(SessionError::AlreadyStarted);
        }
        let mut source = match open(self.settings.initial_confidence) {
            Ok(s) => s,
            Err(e) => {
                self.state = SessionState::Stopped;
                return Err(SessionError::Startup(e));
            }
        };

        self.state = SessionState::Running;
        let started = self.clock.now();
        info!(
            "session running (confidence {:.2}/{:.2})",
            self.settings.initial_confidence.detection, self.settings.initial_confidence.tracking
        );

        let mut raised = false;
        let mut frames = 0u64;
        let mut hands_seen = 0u64;
        let mut skipped = 0u64;
        let mut elapsed = Duration::ZERO;

        let reason = loop {
            if self.stop.is_stopped() {
                break EndReason::StopSignal;
            }
            elapsed = self.clock.now().saturating_sub(started);

            if !raised && elapsed >= self.settings.raise_after {
                raised = true;
                let c = self.settings.raised_confidence;
                match source.set_confidence(c) {
                    Ok(()) => info!("confidence raised to {:.2}/{:.2}", c.detection, c.tracking),
                    Err(e) => warn!("could not raise tracker confidence: {e}"),
                }
            }

            let observation = match source.next_observation() {
                Ok(o) => o,
                Err(SourceError::Transient(why)) => {
                    skipped += 1;
                    debug!("frame skipped: {why}");
                    continue;
                }
                Err(SourceError::Closed) => break EndReason::SourceClosed,
                Err(e) => {
                    warn!("landmark source failed: {e}");
                    break EndReason::SourceClosed;
                }
            };
            if matches!(observation, Observation::Pending) {
                continue;
            }
            frames += 1;

            match observation {
                Observation::Hand(frame) => {
                    hands_seen += 1;
                    if self.on_hand(frame, elapsed) {
                        break EndReason::ExitGesture;
                    }
                }
                Observation::NoHand => self.smoother.hand_missing(elapsed),
                Observation::Quit => break EndReason::StopSignal,
                Observation::Pending => {}
            }
        };

        self.state = SessionState::Terminating;
        source.release();
        self.state = SessionState::Stopped;
        info!(
            "session stopped ({}): {frames} frames, {} actions",
            reason.as_str(),
            self.dispatcher.dispatched()
        );

        Ok(SessionReport {
            reason,
            frames,
            hands_seen,
            skipped,
            actions_dispatched: self.dispatcher.dispatched(),
            recent_actions: self.dispatcher.recent().copied().collect(),
            duration: elapsed,
        })
    }

    /// Returns true when the exit gesture fired.
    fn on_hand(&mut self, frame: LandmarkFrame, now: Duration) -> bool {
        let Some(smoothed) = self.smoother.push(frame) else {
            return false;
        };
        let state = fingers::extract(&smoothed);
        let gesture = self.classifier.classify(state, &smoothed);
        if !self.debouncer.accept(gesture, now) {
            return false;
        }
        let Some(outcome) = self.dispatcher.dispatch(gesture, now) else {
            return false;
        };
        if outcome.action == Action::Terminate {
            info!("exit gesture recognized; ending session");
            return true;
        }
        self.executor.execute(outcome.action);
        false
    }
}

/// Runs a session against the live tracker process and the real keyboard.
pub fn run_live(profile: &Profile, stop: StopHandle) -> Result<SessionReport, SessionError> {
    let executor = SystemExecutor::new(
        KeyboardSink::or_noop(),
        profile.launch.clone(),
        profile.meta.allow_commands,
    );
    let mut session = Session::new(
        SessionSettings::from(&profile.tuning),
        executor,
        MonotonicClock::new(),
        stop,
    );
    let command = profile.tracker.command.clone();
    session.run(|confidence| SubprocessTracker::spawn(&command, confidence))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::testing;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::rc::Rc;

    const STEP: Duration = Duration::from_millis(33);

    struct StepClock {
        t: Cell<Duration>,
        step: Duration,
    }

    impl StepClock {
        fn new(step: Duration) -> Self {
            Self {
                t: Cell::new(Duration::ZERO),
                step,
            }
        }
    }

    impl Clock for StepClock {
        fn now(&self) -> Duration {
            let t = self.t.get();
            self.t.set(t + self.step);
            t
        }
    }

    #[derive(Default)]
    struct Tally {
        consumed: usize,
        released: usize,
        confidence: Vec<Confidence>,
    }

    struct ScriptedSource {
        script: VecDeque<Result<Observation, SourceError>>,
        tally: Rc<RefCell<Tally>>,
        /// Raises the stop flag right after the n-th read.
        stop_after: Option<(usize, StopHandle)>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<Observation, SourceError>>, tally: &Rc<RefCell<Tally>>) -> Self {
            Self {
                script: script.into(),
                tally: Rc::clone(tally),
                stop_after: None,
            }
        }
    }

    impl LandmarkSource for ScriptedSource {
        fn next_observation(&mut self) -> Result<Observation, SourceError> {
            assert_eq!(self.tally.borrow().released, 0, "read after release");
            let consumed = {
                let mut tally = self.tally.borrow_mut();
                tally.consumed += 1;
                tally.consumed
            };
            if let Some((n, stop)) = &self.stop_after {
                if consumed == *n {
                    stop.stop();
                }
            }
            self.script.pop_front().unwrap_or(Err(SourceError::Closed))
        }

        fn set_confidence(&mut self, c: Confidence) -> Result<(), SourceError> {
            self.tally.borrow_mut().confidence.push(c);
            Ok(())
        }

        fn release(&mut self) {
            self.tally.borrow_mut().released += 1;
        }
    }

    #[derive(Default, Clone)]
    struct Recorder(Rc<RefCell<Vec<Action>>>);

    impl ActionExecutor for Recorder {
        fn execute(&self, action: Action) {
            self.0.borrow_mut().push(action);
        }
    }

    fn hands(frame: LandmarkFrame, n: usize) -> Vec<Result<Observation, SourceError>> {
        (0..n).map(|_| Ok(Observation::Hand(frame))).collect()
    }

    fn run_script(
        script: Vec<Result<Observation, SourceError>>,
        step: Duration,
    ) -> (SessionReport, Rc<RefCell<Tally>>, Vec<Action>) {
        let tally = Rc::new(RefCell::new(Tally::default()));
        let recorder = Recorder::default();
        let mut session = Session::new(
            SessionSettings::default(),
            recorder.clone(),
            StepClock::new(step),
            StopHandle::new(),
        );
        let source = ScriptedSource::new(script, &tally);
        let report = session.run(|_| Ok(source)).unwrap();
        assert_eq!(session.state(), SessionState::Stopped);
        let actions = recorder.0.borrow().clone();
        (report, tally, actions)
    }

    #[test]
    fn held_fist_closes_window_once() {
        let (report, tally, actions) = run_script(hands(testing::fist(0.05), 6), STEP);
        assert_eq!(actions, vec![Action::CloseWindow]);
        assert_eq!(report.reason, EndReason::SourceClosed);
        assert_eq!(report.frames, 6);
        // the first smoothed output is on the fifth frame
        assert_eq!(report.recent_actions[0].at, STEP * 5);
        assert_eq!(tally.borrow().released, 1);
    }

    #[test]
    fn fist_held_past_both_cooldowns_fires_again() {
        // 3.3s of fist at 33ms per frame
        let (report, _, actions) = run_script(hands(testing::fist(0.05), 100), STEP);
        assert_eq!(actions, vec![Action::CloseWindow, Action::CloseWindow]);
        let gap = report.recent_actions[1].at - report.recent_actions[0].at;
        assert!(gap >= Duration::from_secs(3));
    }

    #[test]
    fn thumbs_up_releases_source_and_ends() {
        let thumbs = testing::hand([true, false, false, false, false]);
        let (report, tally, actions) = run_script(hands(thumbs, 20), STEP);
        assert_eq!(report.reason, EndReason::ExitGesture);
        assert!(actions.is_empty());
        let tally = tally.borrow();
        assert_eq!(tally.released, 1);
        // nothing read past the exit frame
        assert_eq!(tally.consumed, 5);
    }

    #[test]
    fn stop_signal_ends_before_reading() {
        let tally = Rc::new(RefCell::new(Tally::default()));
        let stop = StopHandle::new();
        stop.stop();
        let mut session = Session::new(
            SessionSettings::default(),
            Recorder::default(),
            StepClock::new(STEP),
            stop,
        );
        let source = ScriptedSource::new(hands(testing::fist(0.05), 6), &tally);
        let report = session.run(|_| Ok(source)).unwrap();
        assert_eq!(report.reason, EndReason::StopSignal);
        assert_eq!(tally.borrow().consumed, 0);
        assert_eq!(tally.borrow().released, 1);
    }

    fn run_until_stopped(
        script: Vec<Result<Observation, SourceError>>,
        stop_after: usize,
    ) -> (SessionReport, Rc<RefCell<Tally>>, Vec<Action>) {
        let tally = Rc::new(RefCell::new(Tally::default()));
        let stop = StopHandle::new();
        let recorder = Recorder::default();
        let mut session = Session::new(
            SessionSettings::default(),
            recorder.clone(),
            StepClock::new(STEP),
            stop.clone(),
        );
        let mut source = ScriptedSource::new(script, &tally);
        source.stop_after = Some((stop_after, stop));
        let report = session.run(|_| Ok(source)).unwrap();
        let actions = recorder.0.borrow().clone();
        (report, tally, actions)
    }

    #[test]
    fn stop_mid_session_ends_on_next_frame() {
        let (report, tally, actions) = run_until_stopped(hands(testing::fist(0.05), 20), 3);
        assert_eq!(report.reason, EndReason::StopSignal);
        assert_eq!(report.frames, 3);
        assert!(actions.is_empty());
        let tally = tally.borrow();
        assert_eq!(tally.consumed, 3);
        assert_eq!(tally.released, 1);
    }

    #[test]
    fn stop_while_tracker_is_silent() {
        let mut script = hands(testing::fist(0.05), 2);
        script.extend((0..50).map(|_| Ok(Observation::Pending)));
        let (report, tally, _) = run_until_stopped(script, 4);
        assert_eq!(report.reason, EndReason::StopSignal);
        assert_eq!(report.frames, 2);
        assert_eq!(tally.borrow().consumed, 4);
        assert_eq!(tally.borrow().released, 1);
    }

    #[test]
    fn pending_reads_do_not_break_smoothing() {
        let fist = testing::fist(0.05);
        let mut script = hands(fist, 3);
        script.extend((0..10).map(|_| Ok(Observation::Pending)));
        script.extend(hands(fist, 2));
        let (report, _, actions) = run_script(script, STEP);
        assert_eq!(report.frames, 5);
        assert_eq!(actions, vec![Action::CloseWindow]);
    }

    #[test]
    fn stop_interrupts_a_stalled_tracker_process() {
        let stop = StopHandle::new();
        let remote = stop.clone();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            remote.stop();
        });
        let mut session = Session::new(
            SessionSettings::default(),
            Recorder::default(),
            MonotonicClock::new(),
            stop,
        );
        let cmd: Vec<String> = ["sh", "-c", "echo READY; exec sleep 5"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let started = Instant::now();
        let report = session.run(|c| SubprocessTracker::spawn(&cmd, c)).unwrap();
        stopper.join().unwrap();
        assert_eq!(report.reason, EndReason::StopSignal);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn tracker_quit_is_a_stop_signal() {
        let mut script = hands(testing::fist(0.05), 2);
        script.push(Ok(Observation::Quit));
        script.extend(hands(testing::fist(0.05), 6));
        let (report, tally, actions) = run_script(script, STEP);
        assert_eq!(report.reason, EndReason::StopSignal);
        assert!(actions.is_empty());
        assert_eq!(tally.borrow().released, 1);
    }

    #[test]
    fn transient_failures_are_skipped() {
        let fist = testing::fist(0.05);
        let mut script = vec![];
        for _ in 0..5 {
            script.push(Err(SourceError::Transient("no frame".into())));
            script.push(Ok(Observation::Hand(fist)));
        }
        let (report, _, actions) = run_script(script, STEP);
        assert_eq!(report.skipped, 5);
        assert_eq!(report.frames, 5);
        assert_eq!(actions, vec![Action::CloseWindow]);
    }

    #[test]
    fn io_failure_ends_session_with_release() {
        let mut script = hands(testing::fist(0.05), 2);
        script.push(Err(SourceError::Io(std::io::Error::other("pipe broke"))));
        let (report, tally, _) = run_script(script, STEP);
        assert_eq!(report.reason, EndReason::SourceClosed);
        assert_eq!(tally.borrow().released, 1);
    }

    #[test]
    fn startup_failure_is_reported() {
        let mut session = Session::new(
            SessionSettings::default(),
            Recorder::default(),
            StepClock::new(STEP),
            StopHandle::new(),
        );
        let err = session
            .run(|_| -> anyhow::Result<ScriptedSource> { Err(anyhow::anyhow!("no camera")) })
            .unwrap_err();
        assert!(matches!(err, SessionError::Startup(_)));
        assert!(err.to_string().contains("no camera"));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[test]
    fn session_runs_once() {
        let mut session = Session::new(
            SessionSettings::default(),
            Recorder::default(),
            StepClock::new(STEP),
            StopHandle::new(),
        );
        let tally = Rc::new(RefCell::new(Tally::default()));
        let open = |p: Rc<RefCell<Tally>>| {
            move |_: Confidence| -> anyhow::Result<ScriptedSource> {
                Ok(ScriptedSource::new(vec![], &p))
            }
        };
        session.run(open(Rc::clone(&tally))).unwrap();
        let again = session.run(open(Rc::clone(&tally)));
        assert!(matches!(again, Err(SessionError::AlreadyStarted)));
    }

    #[test]
    fn opens_with_initial_confidence_and_raises_once() {
        let tally = Rc::new(RefCell::new(Tally::default()));
        let mut session = Session::new(
            SessionSettings::default(),
            Recorder::default(),
            StepClock::new(Duration::from_secs(1)),
            StopHandle::new(),
        );
        let opened_with = Cell::new(None);
        let source =
            ScriptedSource::new((0..10).map(|_| Ok(Observation::NoHand)).collect(), &tally);
        session
            .run(|c| {
                opened_with.set(Some(c));
                Ok(source)
            })
            .unwrap();
        let initial = opened_with.get().unwrap();
        assert_eq!(initial.detection, 0.5);
        assert_eq!(initial.tracking, 0.5);
        let tally = tally.borrow();
        let raised = &tally.confidence;
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].detection, 0.7);
        assert_eq!(raised[0].tracking, 0.7);
    }

    #[test]
    fn long_hand_loss_restarts_smoothing() {
        let fist = testing::fist(0.05);
        let mut script = hands(fist, 4);
        // ~660ms without a hand
        script.extend((0..20).map(|_| Ok(Observation::NoHand)));
        script.extend(hands(fist, 4));
        let (_, _, actions) = run_script(script, STEP);
        assert!(actions.is_empty());
    }

    #[test]
    fn short_hand_loss_keeps_smoothing() {
        let fist = testing::fist(0.05);
        let mut script = hands(fist, 4);
        script.extend((0..3).map(|_| Ok(Observation::NoHand)));
        script.extend(hands(fist, 1));
        let (_, _, actions) = run_script(script, STEP);
        assert_eq!(actions, vec![Action::CloseWindow]);
    }

    #[test]
    fn switching_gestures_dispatches_each() {
        let mut script = hands(testing::fist(0.05), 5);
        // four_fingers needs the window to fill with the new pose
        script.extend(hands(testing::hand([false, true, true, true, true]), 5));
        let (_, _, actions) = run_script(script, STEP);
        assert_eq!(actions.first(), Some(&Action::CloseWindow));
        assert_eq!(actions.last(), Some(&Action::Minimize));
    }
}
