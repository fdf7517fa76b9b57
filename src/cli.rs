use anyhow::{Context, Result, anyhow};
use log::info;
use pico_args::Arguments;
use signal_hook::consts::{SIGINT, SIGTERM};
use std::{env, fs::File, io::BufReader, process::Command, time::Duration};

use crate::actions::{Action, ActionExecutor, DryRunExecutor, KeyboardSink, SystemExecutor};
use crate::config::{DaemonConfigState, Profile};
use crate::ipc;
use crate::session::{self, MonotonicClock, Session, SessionReport, SessionSettings, StopHandle};
use crate::tracker::ReplaySource;

pub fn run() -> Result<()> {
    let mut pargs = Arguments::from_env();

    // Hidden daemon mode (spawned by `start`)
    if pargs.contains("--daemon") {
        return ipc::run_daemon();
    }

    // No args -> general help
    if env::args().len() == 1 {
        print_help();
        return Ok(());
    }

    // Flags-based help (-h/--help)
    if pargs.contains("-h") || pargs.contains("--help") {
        print_help();
        return Ok(());
    }

    // replay options
    let live = pargs.contains("--live");
    let interval_ms: Option<u64> = pargs.opt_value_from_str("--interval-ms")?;

    // First free arg is the subcommand
    let subcmd: Option<String> = pargs.free_from_str().ok();

    match subcmd.as_deref() {
        Some("help") => {
            let topic: Option<String> = pargs.free_from_str().ok();
            if let Some(t) = topic {
                print_subcmd_help(&t);
            } else {
                print_help();
            }
            Ok(())
        }

        Some("start") => {
            let exe = std::env::current_exe()?;
            let child = Command::new(exe).arg("--daemon").spawn()?;
            println!("handctl: started daemon (pid={})", child.id());
            Ok(())
        }

        Some("stop") => daemon_op("shutdown"),
        Some("status") => daemon_op("status"),
        Some("launch") => daemon_op("launch"),
        Some("halt") => daemon_op("halt"),
        Some("reload") => daemon_op("reload"),
        Some("list") => daemon_op("list"),
        Some("doctor") => daemon_op("doctor"),

        Some("use") => {
            let name: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: handctl use <profile_name>"))?;
            let r = ipc::client_request(serde_json::json!({"op":"use","profile":name}))?;
            print_response(&r);
            Ok(())
        }

        Some("run") => {
            let cfg = DaemonConfigState::load_or_install_default()?;
            let stop = stop_on_signals()?;
            info!("running session with profile '{}' (Ctrl-C to stop)", cfg.active_name);
            let report = session::run_live(&cfg.profile, stop)?;
            print_report(&report);
            Ok(())
        }

        Some("replay") => {
            let path: String = pargs
                .free_from_str()
                .map_err(|_| {
                    anyhow!("usage: handctl replay <file.jsonl> [--live] [--interval-ms N]")
                })?;
            let cfg = DaemonConfigState::load_or_install_default()?;
            let interval = interval_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| cfg.profile.tuning.frame_interval());
            let report = if live {
                let exec = SystemExecutor::new(
                    KeyboardSink::or_noop(),
                    cfg.profile.launch.clone(),
                    cfg.profile.meta.allow_commands,
                );
                replay(&cfg.profile, &path, interval, exec)?
            } else {
                replay(&cfg.profile, &path, interval, DryRunExecutor)?
            };
            print_report(&report);
            Ok(())
        }

        Some("emit") => {
            // usage:
            //   handctl emit mute
            //   handctl emit close_window
            let key: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: handctl emit <action>"))?;
            let action = Action::from_key(&key).ok_or_else(|| {
                let names: Vec<_> = Action::ALL.iter().map(|a| a.key()).collect();
                anyhow!("unknown action: {key} (one of: {})", names.join(", "))
            })?;
            let profile = DaemonConfigState::load_or_install_default()
                .map(|c| c.profile)
                .or_else(|_| Profile::builtin())?;
            let exec = SystemExecutor::new(
                KeyboardSink::or_noop(),
                profile.launch.clone(),
                profile.meta.allow_commands,
            );
            exec.run_blocking(action)?;
            println!("ok: performed {action}");
            Ok(())
        }

        Some(other) => {
            eprintln!("unknown subcommand: {other}\n");
            print_help();
            Ok(())
        }

        None => {
            print_help();
            Ok(())
        }
    }
}

fn daemon_op(op: &str) -> Result<()> {
    let r = ipc::client_request(serde_json::json!({ "op": op }))?;
    print_response(&r);
    Ok(())
}

fn stop_on_signals() -> Result<StopHandle> {
    let stop = StopHandle::new();
    for sig in [SIGINT, SIGTERM] {
        signal_hook::flag::register(sig, stop.flag())?;
    }
    Ok(stop)
}

fn replay<E: ActionExecutor>(
    profile: &Profile,
    path: &str,
    interval: Duration,
    exec: E,
) -> Result<SessionReport> {
    let file = File::open(path).with_context(|| format!("failed to open {path}"))?;
    let stop = stop_on_signals()?;
    let mut session = Session::new(
        SessionSettings::from(&profile.tuning),
        exec,
        MonotonicClock::new(),
        stop,
    );
    let report = session.run(|_| Ok(ReplaySource::new(BufReader::new(file), interval)))?;
    Ok(report)
}

fn print_help() {
    println!(
        r#"handctl: camera hand-gesture control daemon

USAGE:
  handctl help [command]                  Show general or command-specific help
  handctl start                           Start the daemon
  handctl stop                            Stop the daemon
  handctl status                          Show daemon and session state
  handctl launch                          Start a recognition session in the daemon
  handctl halt                            Stop the running session
  handctl reload                          Reload active profile
  handctl use <name>                      Switch active profile
  handctl list                            List profiles
  handctl doctor                          Diagnose permissions/cameras/tracker
  handctl run                             Run a session in the foreground
  handctl replay <file> [--live]          Run a session on recorded landmarks
  handctl emit <action>                   Perform one action (mute, close_window, ...)

GESTURES:
  thumbs_up -> end session      two_fingers -> play/pause
  fist -> close window          three_fingers -> switch tab
  four_fingers -> minimize      five_fingers -> maximize
  rock -> mute                  notepad (index) -> text editor
  ok -> file browser

TIPS:
  - Profiles: ~/.config/handctl/profiles
  - Active profile pointer: ~/.config/handctl/active
  - RUST_LOG=debug shows suppressed gestures and skipped frames
"#
    );
}

fn print_subcmd_help(cmd: &str) {
    match cmd {
        "start" => println!("usage: handctl start\nStarts the background daemon."),
        "stop" => println!("usage: handctl stop\nHalts any session and stops the daemon."),
        "status" => println!(
            "usage: handctl status\nShows active profile, session state and the last session result."
        ),
        "launch" => println!(
            "usage: handctl launch\nStarts a recognition session; returns once it is launched."
        ),
        "halt" => println!("usage: handctl halt\nAsks the running session to stop."),
        "reload" => println!(
            "usage: handctl reload\nReloads the current profile; keeps last good on error."
        ),
        "use" => {
            println!("usage: handctl use <name>\nSwitches active profile to <name> and reloads.")
        }
        "list" => {
            println!("usage: handctl list\nLists available profiles and the active one.")
        }
        "doctor" => println!(
            "usage: handctl doctor\nChecks uinput permissions, cameras and the tracker command."
        ),
        "run" => println!(
            "usage: handctl run\nRuns a session in the foreground. Ctrl-C or thumbs-up ends it."
        ),
        "replay" => println!(
            "usage: handctl replay <file.jsonl> [--live] [--interval-ms N]\nFeeds recorded tracker lines through the recognizer. Actions are only logged unless --live."
        ),
        "emit" => {
            let names: Vec<_> = Action::ALL.iter().map(|a| a.key()).collect();
            println!("usage: handctl emit <action>\nactions: {}", names.join(", "))
        }
        _ => {
            eprintln!("unknown command: {cmd}\n");
            print_help();
        }
    }
}

fn print_response(v: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(v).unwrap_or_default());
}

fn print_report(report: &SessionReport) {
    print_response(&report.to_json());
}
