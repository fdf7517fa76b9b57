use anyhow::{Result, anyhow, bail};
use log::{debug, error, info, warn};
use std::{
    process::{Command, Stdio},
    sync::{Arc, Mutex},
    thread,
};

use crate::config::Launchers;

/// System-level effects a gesture can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Terminate,
    PlayPause,
    CloseWindow,
    SwitchTab,
    Minimize,
    Maximize,
    ToggleMute,
    LaunchEditor,
    OpenFileBrowser,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Action::Terminate,
        Action::PlayPause,
        Action::CloseWindow,
        Action::SwitchTab,
        Action::Minimize,
        Action::Maximize,
        Action::ToggleMute,
        Action::LaunchEditor,
        Action::OpenFileBrowser,
    ];

    /// Cooldown key; also the name used on the command line.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Terminate => "exit",
            Self::PlayPause => "playpause",
            Self::CloseWindow => "close_window",
            Self::SwitchTab => "switch_tab",
            Self::Minimize => "minimize",
            Self::Maximize => "maximize",
            Self::ToggleMute => "mute",
            Self::LaunchEditor => "notepad",
            Self::OpenFileBrowser => "explorer",
        }
    }

    pub fn from_key(key: &str) -> Option<Action> {
        Self::ALL.into_iter().find(|a| a.key() == key)
    }

    /// Key chord sent through the virtual keyboard, if this is a keystroke action.
    pub fn chord(&self) -> Option<&'static str> {
        match self {
            Self::PlayPause => Some("PLAYPAUSE"),
            Self::CloseWindow => Some("ALT+F4"),
            Self::SwitchTab => Some("CTRL+TAB"),
            Self::Minimize => Some("SUPER+DOWN"),
            Self::Maximize => Some("SUPER+UP"),
            Self::ToggleMute => Some("MUTE"),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Runs actions without reporting back. Implementations must not block the
/// caller on the action's completion.
pub trait ActionExecutor {
    fn execute(&self, action: Action);
}

/// Logs instead of acting. Used for replays.
pub struct DryRunExecutor;

impl ActionExecutor for DryRunExecutor {
    fn execute(&self, action: Action) {
        info!("dry-run: would perform '{action}'");
    }
}

/// Sends keystrokes through uinput and spawns launcher programs, each on a
/// short-lived detached thread.
pub struct SystemExecutor {
    sink: Arc<Mutex<KeyboardSink>>,
    launchers: Launchers,
    allow_commands: bool,
}

impl SystemExecutor {
    pub fn new(sink: KeyboardSink, launchers: Launchers, allow_commands: bool) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
            launchers,
            allow_commands,
        }
    }

    /// Same work as `execute`, on the calling thread.
    pub fn run_blocking(&self, action: Action) -> Result<()> {
        perform(action, &self.sink, &self.launchers, self.allow_commands)
    }
}

impl ActionExecutor for SystemExecutor {
    fn execute(&self, action: Action) {
        let sink = Arc::clone(&self.sink);
        let launchers = self.launchers.clone();
        let allow = self.allow_commands;
        let spawned = thread::Builder::new()
            .name(format!("action-{}", action.key()))
            .spawn(move || {
                if let Err(e) = perform(action, &sink, &launchers, allow) {
                    error!("action '{action}' failed: {e}");
                }
            });
        if let Err(e) = spawned {
            error!("could not start action '{action}': {e}");
        }
    }
}

fn perform(
    action: Action,
    sink: &Mutex<KeyboardSink>,
    launchers: &Launchers,
    allow_commands: bool,
) -> Result<()> {
    if let Some(chord) = action.chord() {
        let mut sink = sink.lock().unwrap_or_else(|p| p.into_inner());
        return sink.key_chord(chord);
    }
    let argv = match action {
        Action::LaunchEditor => &launchers.text_editor,
        Action::OpenFileBrowser => &launchers.file_browser,
        Action::Terminate => bail!("'exit' is handled by the session, not the executor"),
        _ => return Err(anyhow!("no effect bound to '{action}'")),
    };
    if !allow_commands {
        bail!("'{action}' launches a program but allow_commands=false");
    }
    spawn_detached(argv).map(drop)
}

/// Starts `argv` without waiting for it. A reaper thread collects the exit
/// status so the long-running daemon does not accumulate zombies.
fn spawn_detached(argv: &[String]) -> Result<(u32, thread::JoinHandle<()>)> {
    let (prog, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty launcher command"))?;
    let mut child = Command::new(prog)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| anyhow!("failed to launch {prog}: {e}"))?;
    let pid = child.id();
    info!("launched {prog} (pid={pid})");

    let name = prog.clone();
    let reaper = thread::Builder::new()
        .name(format!("reap-{pid}"))
        .spawn(move || match child.wait() {
            Ok(status) if status.success() => debug!("{name} (pid={pid}) exited"),
            Ok(status) => warn!("{name} (pid={pid}) exited with {status}"),
            Err(e) => warn!("failed to reap {name} (pid={pid}): {e}"),
        })?;
    Ok((pid, reaper))
}

pub struct KeyboardSink {
    #[allow(dead_code)]
    linux: Option<Box<LinuxUinput>>,
}

impl KeyboardSink {
    pub fn new() -> Result<Self> {
        #[cfg(target_os = "linux")]
        {
            let dev = LinuxUinput::create()?;
            return Ok(Self {
                linux: Some(Box::new(dev)),
            });
        }
        #[allow(unreachable_code)]
        {
            warn!("uinput not available; keystrokes run in NO-OP mode");
            Ok(Self { linux: None })
        }
    }

    pub fn noop() -> Self {
        Self { linux: None }
    }

    /// The uinput keyboard, or a no-op sink with a warning when it can't be created.
    pub fn or_noop() -> Self {
        Self::new().unwrap_or_else(|e| {
            warn!("virtual keyboard unavailable ({e}); keystrokes disabled");
            Self::noop()
        })
    }

    #[cfg(test)]
    fn is_live(&self) -> bool {
        self.linux.is_some()
    }

    /// Send a chord like "ALT+F4" or a single "MUTE"
    pub fn key_chord(&mut self, chord: &str) -> Result<()> {
        let parts: Vec<_> = chord
            .split('+')
            .map(|s| s.trim().to_ascii_uppercase())
            .collect();
        #[cfg(target_os = "linux")]
        if let Some(dev) = self.linux.as_mut() {
            let mut keys = Vec::with_capacity(parts.len());
            for p in &parts {
                keys.push(map_key(p)?);
            }
            // press in order
            for k in &keys {
                dev.key_send(*k, 1)?;
            }
            dev.sync()?;
            // release in reverse
            for k in keys.iter().rev() {
                dev.key_send(*k, 0)?;
            }
            dev.sync()?;
            return Ok(());
        }
        info!("no-op sink: skipped chord {}", parts.join("+"));
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn map_key(tok: &str) -> Result<uinput::event::Keyboard> {
    use uinput::event::Keyboard;
    use uinput::event::keyboard::{Key as K, Misc as M};
    let k = match tok {
        "CTRL" | "CONTROL" => Keyboard::Key(K::LeftControl),
        "ALT" => Keyboard::Key(K::LeftAlt),
        "SHIFT" => Keyboard::Key(K::LeftShift),
        "SUPER" | "META" | "WIN" => Keyboard::Key(K::LeftMeta),
        "TAB" => Keyboard::Key(K::Tab),
        "F4" => Keyboard::Key(K::F4),
        "UP" => Keyboard::Key(K::Up),
        "DOWN" => Keyboard::Key(K::Down),
        "MUTE" => Keyboard::Misc(M::Mute),
        "PLAYPAUSE" => Keyboard::Misc(M::PlayPause),
        other => return Err(anyhow!("unsupported key token: {other}")),
    };
    Ok(k)
}

#[cfg(target_os = "linux")]
struct LinuxUinput {
    dev: uinput::device::Device,
}

#[cfg(not(target_os = "linux"))]
struct LinuxUinput;

#[cfg(target_os = "linux")]
impl LinuxUinput {
    fn create() -> Result<Self> {
        use uinput::event::keyboard::{Key, Misc};

        let dev = uinput::default()?
            .name("Handctl Virtual Keyboard")?
            .event(Key::LeftControl)?
            .event(Key::LeftAlt)?
            .event(Key::LeftShift)?
            .event(Key::LeftMeta)?
            .event(Key::Tab)?
            .event(Key::F4)?
            .event(Key::Up)?
            .event(Key::Down)?
            .event(Misc::Mute)?
            .event(Misc::PlayPause)?
            .create()?;

        info!("uinput: created virtual keyboard");
        Ok(Self { dev })
    }

    fn sync(&mut self) -> Result<()> {
        self.dev.synchronize()?;
        Ok(())
    }

    fn key_send(&mut self, key: uinput::event::Keyboard, val: i32) -> Result<()> {
        self.dev.send(key, val)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launchers() -> Launchers {
        Launchers {
            text_editor: vec!["true".into()],
            file_browser: vec![],
        }
    }

    #[test]
    fn keys_round_trip() {
        for a in Action::ALL {
            assert_eq!(Action::from_key(a.key()), Some(a));
        }
        assert_eq!(Action::from_key("reboot"), None);
    }

    #[test]
    fn only_keystroke_actions_have_chords() {
        assert_eq!(Action::CloseWindow.chord(), Some("ALT+F4"));
        assert!(Action::LaunchEditor.chord().is_none());
        assert!(Action::Terminate.chord().is_none());
    }

    #[test]
    fn noop_sink_accepts_chords() {
        let mut sink = KeyboardSink::noop();
        assert!(!sink.is_live());
        sink.key_chord("SUPER+UP").unwrap();
    }

    #[test]
    fn launches_are_gated() {
        let exec = SystemExecutor::new(KeyboardSink::noop(), launchers(), false);
        let err = exec.run_blocking(Action::LaunchEditor).unwrap_err();
        assert!(err.to_string().contains("allow_commands"));
    }

    #[test]
    fn empty_launcher_is_an_error() {
        let exec = SystemExecutor::new(KeyboardSink::noop(), launchers(), true);
        assert!(exec.run_blocking(Action::OpenFileBrowser).is_err());
    }

    #[test]
    fn terminate_is_not_executable() {
        let exec = SystemExecutor::new(KeyboardSink::noop(), launchers(), true);
        assert!(exec.run_blocking(Action::Terminate).is_err());
    }

    #[test]
    fn launched_programs_are_reaped() {
        let argv = vec!["true".to_string()];
        let (pid, reaper) = spawn_detached(&argv).unwrap();
        reaper.join().unwrap();
        // a zombie keeps its /proc entry until waited on
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    }

    #[test]
    fn failing_launch_is_still_reaped() {
        let argv = vec!["false".to_string()];
        let (pid, reaper) = spawn_detached(&argv).unwrap();
        reaper.join().unwrap();
        assert!(!std::path::Path::new(&format!("/proc/{pid}")).exists());
    }

    #[test]
    fn missing_launcher_program_is_an_error() {
        let argv = vec!["/nonexistent/handctl-editor".to_string()];
        assert!(spawn_detached(&argv).is_err());
    }

    #[test]
    fn keystroke_runs_on_noop_sink() {
        let exec = SystemExecutor::new(KeyboardSink::noop(), launchers(), false);
        exec.run_blocking(Action::ToggleMute).unwrap();
    }
}
