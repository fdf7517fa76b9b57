use anyhow::{Result, anyhow};
use directories::UserDirs;
use log::info;
use serde::Deserialize;
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::gestures::ClassifierThresholds;
use crate::input;

#[derive(Debug, Clone, Deserialize)]
pub struct Meta {
    pub name: Option<String>,
    #[serde(default)]
    pub allow_commands: bool,
}

/// Numeric knobs of the recognition pipeline. Every field defaults to the
/// stock value so a profile can leave the table out.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Tuning {
    pub smoothing_window: usize,
    pub hand_lost_reset_ms: u64,
    pub gesture_cooldown_secs: f64,
    pub action_cooldown_secs: f64,
    pub fist_max_tip_distance: f32,
    pub ok_max_pinch_distance: f32,
    pub detection_confidence: f32,
    pub tracking_confidence: f32,
    pub raised_detection_confidence: f32,
    pub raised_tracking_confidence: f32,
    pub raise_confidence_after_secs: f64,
    pub frame_interval_ms: u64,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            smoothing_window: 5,
            hand_lost_reset_ms: 500,
            gesture_cooldown_secs: 1.0,
            action_cooldown_secs: 3.0,
            fist_max_tip_distance: 0.10,
            ok_max_pinch_distance: 0.04,
            detection_confidence: 0.5,
            tracking_confidence: 0.5,
            raised_detection_confidence: 0.7,
            raised_tracking_confidence: 0.7,
            raise_confidence_after_secs: 5.0,
            frame_interval_ms: 10,
        }
    }
}

/// Out-of-range seconds never reach here from a validated profile; if one
/// does, it saturates instead of panicking.
fn secs(v: f64) -> Duration {
    Duration::try_from_secs_f64(v).unwrap_or(Duration::MAX)
}

impl Tuning {
    pub fn hand_lost_reset(&self) -> Duration {
        Duration::from_millis(self.hand_lost_reset_ms)
    }

    pub fn gesture_cooldown(&self) -> Duration {
        secs(self.gesture_cooldown_secs)
    }

    pub fn action_cooldown(&self) -> Duration {
        secs(self.action_cooldown_secs)
    }

    pub fn raise_confidence_after(&self) -> Duration {
        secs(self.raise_confidence_after_secs)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn classifier_thresholds(&self) -> ClassifierThresholds {
        ClassifierThresholds {
            fist_max_tip_distance: self.fist_max_tip_distance,
            ok_max_pinch_distance: self.ok_max_pinch_distance,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Program and arguments of the external hand tracker.
    pub command: Vec<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            command: vec!["python3".into(), "hand_tracker.py".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Launchers {
    pub text_editor: Vec<String>,
    pub file_browser: Vec<String>,
}

impl Default for Launchers {
    fn default() -> Self {
        Self {
            text_editor: vec!["gedit".into()],
            file_browser: vec!["xdg-open".into(), ".".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub meta: Meta,
    #[serde(default)]
    pub tuning: Tuning,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub launch: Launchers,
}

impl Profile {
    pub fn from_toml_str(txt: &str) -> Result<Self> {
        let profile: Profile = toml::from_str(txt)?;
        validate_profile(&profile)?;
        Ok(profile)
    }

    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(default_profile_text())
    }
}

#[derive(Debug, Clone)]
pub struct DaemonConfigState {
    pub active_name: String,
    pub profile: Profile,
    pub profiles_dir: PathBuf,
    pub active_ptr: PathBuf,
}

fn home_dir() -> PathBuf {
    UserDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn config_dir() -> PathBuf {
    home_dir().join(".config").join("handctl")
}

pub fn profiles_dir() -> PathBuf {
    config_dir().join("profiles")
}

fn active_ptr_path() -> PathBuf {
    config_dir().join("active")
}

fn default_profile_text() -> &'static str {
    include_str!("../profiles/default.toml")
}

impl DaemonConfigState {
    pub fn load_or_install_default() -> Result<Self> {
        let profdir = profiles_dir();
        fs::create_dir_all(&profdir)?;

        let def_path = profdir.join("default.toml");
        if !def_path.exists() {
            fs::write(&def_path, default_profile_text())?;
            info!("installed default profile at {}", def_path.display());
        }

        let active_ptr = active_ptr_path();
        if !active_ptr.exists() {
            let mut f = fs::File::create(&active_ptr)?;
            f.write_all(b"default")?;
        }

        let active_name = fs::read_to_string(&active_ptr)?.trim().to_string();
        let profile = Self::load_profile(&active_name)?;

        Ok(Self {
            active_name,
            profile,
            profiles_dir: profdir,
            active_ptr,
        })
    }

    pub fn reload(&mut self) -> Result<()> {
        self.profile = Self::load_profile(&self.active_name)?;
        Ok(())
    }

    pub fn set_active(&mut self, name: &str) -> Result<()> {
        let p = self.profiles_dir.join(format!("{name}.toml"));
        if !p.exists() {
            return Err(anyhow!("profile not found: {}", p.display()));
        }
        // validate before switching the pointer
        let profile = Self::load_profile(name)?;
        fs::write(&self.active_ptr, name.as_bytes())?;
        self.active_name = name.to_string();
        self.profile = profile;
        Ok(())
    }

    pub fn list_profiles(&self) -> Vec<String> {
        let mut v = Vec::new();
        if let Ok(rd) = fs::read_dir(&self.profiles_dir) {
            for e in rd.flatten() {
                if let Some(ext) = e.path().extension() {
                    if ext == "toml" {
                        if let Some(stem) = e.path().file_stem().and_then(|s| s.to_str()) {
                            v.push(stem.to_string());
                        }
                    }
                }
            }
        }
        v.sort();
        v
    }

    fn load_profile(name: &str) -> Result<Profile> {
        let path = profiles_dir().join(format!("{name}.toml"));
        let txt = fs::read_to_string(&path)
            .map_err(|e| anyhow!("failed to read {}: {e}", path.display()))?;
        Profile::from_toml_str(&txt).map_err(|e| anyhow!("failed to parse {}: {e}", path.display()))
    }

    pub fn doctor_report(&self) -> serde_json::Value {
        let uinput_ok = Path::new("/dev/uinput").exists();
        let in_input_group = check_in_input_group();
        let tracker = &self.profile.tracker.command;
        let tracker_found = tracker.first().map(|p| program_on_path(p)).unwrap_or(false);
        serde_json::json!({
            "uinput_present": uinput_ok,
            "input_group_member": in_input_group,
            "profiles_dir": self.profiles_dir,
            "active_profile": self.active_name,
            "profile_name": self.profile.meta.name,
            "cameras": input::discover_cameras(),
            "tracker_command": tracker,
            "tracker_found": tracker_found,
            "hints": {
                "udev_rule": "/etc/udev/rules.d/80-uinput.rules",
                "add_user_to_input_group": "sudo usermod -aG input $USER && newgrp input",
                "tracker_protocol": "print READY, then one JSON line per frame"
            }
        })
    }
}

const MAX_SMOOTHING_WINDOW: usize = 120;
const MAX_TUNING_SECS: f64 = 86_400.0;

fn validate_profile(p: &Profile) -> Result<()> {
    let t = &p.tuning;
    if !(1..=MAX_SMOOTHING_WINDOW).contains(&t.smoothing_window) {
        return Err(anyhow!(
            "tuning.smoothing_window must be in 1..={MAX_SMOOTHING_WINDOW}"
        ));
    }
    // NaN fails every comparison, so the range check rejects it too
    for (name, v, min_exclusive) in [
        ("gesture_cooldown_secs", t.gesture_cooldown_secs, true),
        ("action_cooldown_secs", t.action_cooldown_secs, true),
        ("raise_confidence_after_secs", t.raise_confidence_after_secs, false),
    ] {
        let above_min = if min_exclusive { v > 0.0 } else { v >= 0.0 };
        if !(above_min && v <= MAX_TUNING_SECS) {
            return Err(anyhow!(
                "tuning.{name} must be a finite duration up to {MAX_TUNING_SECS}s (got {v})"
            ));
        }
    }
    for (name, v) in [
        ("fist_max_tip_distance", t.fist_max_tip_distance),
        ("ok_max_pinch_distance", t.ok_max_pinch_distance),
    ] {
        if !(v > 0.0 && v < 1.0) {
            return Err(anyhow!("tuning.{name} must be in (0,1) normalized units"));
        }
    }
    for (name, v) in [
        ("detection_confidence", t.detection_confidence),
        ("tracking_confidence", t.tracking_confidence),
        ("raised_detection_confidence", t.raised_detection_confidence),
        ("raised_tracking_confidence", t.raised_tracking_confidence),
    ] {
        if !(0.0..=1.0).contains(&v) {
            return Err(anyhow!("tuning.{name} must be in [0,1]"));
        }
    }
    if t.raised_detection_confidence < t.detection_confidence
        || t.raised_tracking_confidence < t.tracking_confidence
    {
        return Err(anyhow!("raised confidences must not be lower than the initial ones"));
    }

    if p.tracker.command.is_empty() || p.tracker.command[0].trim().is_empty() {
        return Err(anyhow!("tracker.command is empty"));
    }
    for (name, argv) in [
        ("text_editor", &p.launch.text_editor),
        ("file_browser", &p.launch.file_browser),
    ] {
        if argv.is_empty() || argv[0].trim().is_empty() {
            return Err(anyhow!("launch.{name} is empty"));
        }
    }
    Ok(())
}

fn program_on_path(prog: &str) -> bool {
    if prog.contains('/') {
        return Path::new(prog).exists();
    }
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|d| d.join(prog).is_file()))
        .unwrap_or(false)
}

fn check_in_input_group() -> bool {
    if let Ok(s) = fs::read_to_string("/etc/group") {
        let user = whoami::username();
        for line in s.lines() {
            if line.starts_with("input:") {
                if line
                    .split(':')
                    .nth(3)
                    .unwrap_or("")
                    .split(',')
                    .any(|u| u == user)
                {
                    return true;
                }
            }
        }
    }
    false
}
