//! Per-frame landmark acquisition from the external hand tracker.
//!
//! The tracker is a separate process that owns the camera and the hand model.
//! It prints `READY`, then one JSON line per processed frame (see
//! [`TrackerLine`]). Recorded sessions use the same line format.

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info, warn};
use std::{
    io::{self, BufRead, BufReader, Write},
    process::{Child, ChildStdin, Command, Stdio},
    sync::mpsc::{self, Receiver, RecvTimeoutError},
    thread,
    time::Duration,
};
use thiserror::Error;

use crate::landmarks::{LandmarkFrame, TrackerLine};

/// Detection/tracking confidence thresholds handed to the tracker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Confidence {
    pub detection: f32,
    pub tracking: f32,
}

/// Longest a live read blocks before handing control back to the session.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Model loading in the tracker can take a while.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Hand(LandmarkFrame),
    NoHand,
    /// The tracker produced nothing within [`POLL_INTERVAL`].
    Pending,
    /// The user asked to stop from the tracker side (preview window quit key).
    Quit,
}

#[derive(Debug, Error)]
pub enum SourceError {
    /// This frame is lost; the next one may be fine.
    #[error("frame acquisition failed: {0}")]
    Transient(String),
    #[error("landmark source closed")]
    Closed,
    #[error("tracker i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
impl SourceError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub trait LandmarkSource {
    /// Blocks until the tracker has processed one more frame.
    fn next_observation(&mut self) -> Result<Observation, SourceError>;

    fn set_confidence(&mut self, confidence: Confidence) -> Result<(), SourceError>;

    /// Frees the camera and tracker. Called once when the session ends.
    fn release(&mut self);
}

pub fn parse_line(line: &str) -> Result<Observation, SourceError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(SourceError::Transient("empty line".into()));
    }
    let parsed: TrackerLine = serde_json::from_str(line)
        .map_err(|e| SourceError::Transient(format!("bad tracker line: {e}")))?;
    if parsed.quit {
        return Ok(Observation::Quit);
    }
    if let Some(err) = parsed.error {
        return Err(SourceError::Transient(err));
    }
    match parsed.first_hand() {
        Some(frame) => Ok(Observation::Hand(frame)),
        None => {
            if let Some(h) = parsed.hands.first() {
                debug!("ignoring hand with {} landmarks", h.landmarks.len());
            }
            Ok(Observation::NoHand)
        }
    }
}

fn read_observation<R: BufRead>(reader: &mut R) -> Result<Observation, SourceError> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(SourceError::Closed);
        }
        // recordings may keep the handshake line
        if line.trim() == "READY" {
            continue;
        }
        return parse_line(&line);
    }
}

// --------- live tracker process ----------

pub struct SubprocessTracker {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<io::Result<String>>,
    reader: Option<thread::JoinHandle<()>>,
    released: bool,
}

impl SubprocessTracker {
    /// Starts the tracker and waits for its `READY` handshake. Any failure
    /// here means no camera for this session.
    pub fn spawn(command: &[String], confidence: Confidence) -> Result<Self> {
        let (prog, args) = command
            .split_first()
            .ok_or_else(|| anyhow!("tracker command is empty"))?;

        info!("starting hand tracker: {}", command.join(" "));
        let mut child = Command::new(prog)
            .args(args)
            .arg("--detection-confidence")
            .arg(confidence.detection.to_string())
            .arg("--tracking-confidence")
            .arg(confidence.tracking.to_string())
            .arg("--max-hands")
            .arg("1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to start tracker {prog}"))?;

        let stdin = child.stdin.take();
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            bail!("tracker stdout unavailable");
        };

        // stdout is drained on its own thread so reads never block the session
        let (tx, lines) = mpsc::channel();
        let reader = thread::Builder::new()
            .name("tracker-reader".into())
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let failed = line.is_err();
                    if tx.send(line).is_err() || failed {
                        break;
                    }
                }
            });
        let reader = match reader {
            Ok(h) => h,
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                bail!("failed to start tracker reader: {e}");
            }
        };

        let mut tracker = Self {
            child,
            stdin,
            lines,
            reader: Some(reader),
            released: false,
        };
        match tracker.lines.recv_timeout(STARTUP_TIMEOUT) {
            Ok(Ok(line)) if line.trim() == "READY" => {}
            Ok(Ok(line)) => bail!("tracker did not signal READY (got {:?})", line.trim()),
            Ok(Err(e)) => bail!("tracker did not signal READY ({e})"),
            Err(RecvTimeoutError::Timeout) => {
                bail!("tracker did not signal READY within {STARTUP_TIMEOUT:?}")
            }
            Err(RecvTimeoutError::Disconnected) => bail!("tracker did not signal READY (exited)"),
        }
        info!("hand tracker ready (pid={})", tracker.child.id());
        Ok(tracker)
    }

    fn send(&mut self, msg: serde_json::Value) -> Result<(), SourceError> {
        let stdin = self.stdin.as_mut().ok_or(SourceError::Closed)?;
        writeln!(stdin, "{msg}")?;
        stdin.flush()?;
        Ok(())
    }
}

impl LandmarkSource for SubprocessTracker {
    fn next_observation(&mut self) -> Result<Observation, SourceError> {
        if self.released {
            return Err(SourceError::Closed);
        }
        match self.lines.recv_timeout(POLL_INTERVAL) {
            Ok(Ok(line)) if line.trim() == "READY" => Ok(Observation::Pending),
            Ok(Ok(line)) => parse_line(&line),
            Ok(Err(e)) => Err(SourceError::Io(e)),
            Err(RecvTimeoutError::Timeout) => Ok(Observation::Pending),
            Err(RecvTimeoutError::Disconnected) => Err(SourceError::Closed),
        }
    }

    fn set_confidence(&mut self, c: Confidence) -> Result<(), SourceError> {
        self.send(serde_json::json!({
            "op": "set_confidence",
            "detection": c.detection,
            "tracking": c.tracking,
        }))
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.send(serde_json::json!({"op": "quit"})) {
            debug!("tracker quit request not delivered: {e}");
        }
        self.stdin = None;
        if let Err(e) = self.child.kill() {
            debug!("tracker kill: {e}");
        }
        match self.child.wait() {
            Ok(status) => info!("hand tracker released ({status})"),
            Err(e) => warn!("failed to reap tracker: {e}"),
        }
        // stdout hits EOF once the child is gone
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("tracker reader thread panicked");
            }
        }
    }
}

impl Drop for SubprocessTracker {
    fn drop(&mut self) {
        self.release();
    }
}

// --------- recorded sessions ----------

/// Plays back a recorded landmark stream, pacing frames by `interval`.
pub struct ReplaySource<R> {
    reader: R,
    interval: Duration,
    confidence: Option<Confidence>,
    released: bool,
}

impl<R: BufRead> ReplaySource<R> {
    pub fn new(reader: R, interval: Duration) -> Self {
        Self {
            reader,
            interval,
            confidence: None,
            released: false,
        }
    }
}

#[cfg(test)]
impl<R> ReplaySource<R> {
    fn confidence(&self) -> Option<Confidence> {
        self.confidence
    }

    fn is_released(&self) -> bool {
        self.released
    }
}

impl<R: BufRead> LandmarkSource for ReplaySource<R> {
    fn next_observation(&mut self) -> Result<Observation, SourceError> {
        if self.released {
            return Err(SourceError::Closed);
        }
        if !self.interval.is_zero() {
            thread::sleep(self.interval);
        }
        read_observation(&mut self.reader)
    }

    fn set_confidence(&mut self, c: Confidence) -> Result<(), SourceError> {
        debug!("replay: confidence -> {:.2}/{:.2}", c.detection, c.tracking);
        self.confidence = Some(c);
        Ok(())
    }

    fn release(&mut self) {
        self.released = true;
    }
}
