use anyhow::{Result, anyhow};
use log::{error, info, warn};
use notify::{EventKind, RecursiveMode, Watcher};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    io::{BufRead, BufReader, Write},
    os::unix::net::{UnixListener, UnixStream},
    sync::mpsc::{self, Receiver, Sender},
    thread,
    time::{Duration, Instant},
};

use super::runtime::socket_path;
use crate::config::{DaemonConfigState, Profile};
use crate::session::{self, SessionReport, StopHandle};

const REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

pub fn run_daemon() -> Result<()> {
    // socket
    let sock = socket_path();
    if sock.exists() {
        let _ = std::fs::remove_file(&sock);
    }
    let listener = UnixListener::bind(&sock)?;
    info!("daemon: listening on {}", sock.display());

    // state
    let mut state = DaemonState::new()?;
    info!("daemon: active profile '{}'", state.cfg.active_name);

    // channels
    let (tx_req, rx_req) = mpsc::channel::<IpcMsg>();
    let (tx_evt, rx_evt) = mpsc::channel::<DaemonEvent>();

    // profile hot reload
    let tx_watch = tx_req.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(ev) if matches!(ev.kind, EventKind::Modify(_) | EventKind::Create(_)) => {
                let _ = tx_watch.send(IpcMsg::ProfilesChanged);
            }
            Ok(_) => {}
            Err(e) => warn!("profile watch error: {e}"),
        }
    })?;
    watcher.watch(&state.cfg.profiles_dir, RecursiveMode::NonRecursive)?;

    // SIGINT / SIGTERM -> orderly shutdown
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let tx_sig = tx_req.clone();
    thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!("daemon: received signal {sig}");
            let _ = tx_sig.send(IpcMsg::Shutdown);
        }
    });

    // accept loop
    listener.set_nonblocking(true)?;
    loop {
        if let Ok((stream, _)) = listener.accept() {
            let tx = tx_req.clone();
            let st_snapshot = state.clone_shallow();
            thread::spawn(move || {
                if let Err(e) = handle_client(stream, st_snapshot, tx) {
                    error!("ipc client error: {e}");
                }
            });
        }

        while let Ok(evt) = rx_evt.try_recv() {
            state.on_session_event(evt);
        }
        state.reap_worker(&rx_evt);

        let mut reload = false;
        while let Ok(msg) = rx_req.try_recv() {
            match msg {
                IpcMsg::Launch(reply) => {
                    let _ = reply.send(state.launch(tx_evt.clone()));
                }
                IpcMsg::Halt(reply) => {
                    let _ = reply.send(state.halt());
                }
                IpcMsg::Status(reply) => {
                    let _ = reply.send(state.status());
                }
                IpcMsg::Reload | IpcMsg::ProfilesChanged => reload = true,
                IpcMsg::UseProfile(name) => {
                    if let Err(e) = state.cfg.set_active(&name) {
                        error!("use profile failed: {e}");
                    } else {
                        info!("switched active profile to {}", state.cfg.active_name);
                    }
                }
                IpcMsg::Shutdown => {
                    state.shutdown(&rx_evt);
                    drop(watcher);
                    let _ = std::fs::remove_file(&sock);
                    info!("daemon: bye");
                    return Ok(());
                }
            }
        }
        // coalesce bursts of file events into one reload
        if reload {
            match state.cfg.reload() {
                Ok(()) => info!("profile '{}' reloaded", state.cfg.active_name),
                Err(e) => error!("reload failed (keeping last good profile): {e}"),
            }
        }

        thread::sleep(Duration::from_millis(5));
    }
}

fn handle_client(
    mut stream: UnixStream,
    st: DaemonState,
    tx_req: Sender<IpcMsg>,
) -> Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    if line.trim().is_empty() {
        return Ok(());
    }
    let req: serde_json::Value = serde_json::from_str(&line)?;
    let op = req.get("op").and_then(|v| v.as_str()).unwrap_or("");

    let resp = match op {
        "launch" => ask(&tx_req, IpcMsg::Launch),
        "halt" => ask(&tx_req, IpcMsg::Halt),
        "status" => ask(&tx_req, IpcMsg::Status),
        "reload" => {
            let _ = tx_req.send(IpcMsg::Reload);
            serde_json::json!({"ok": true, "data": {"active_profile": st.cfg.active_name}})
        }
        "use" => {
            let name = req.get("profile").and_then(|v| v.as_str()).unwrap_or("");
            let _ = tx_req.send(IpcMsg::UseProfile(name.to_string()));
            serde_json::json!({"ok": true, "data": {"active_profile": name}})
        }
        "list" => {
            let list = st.cfg.list_profiles();
            let active = &st.cfg.active_name;
            serde_json::json!({"ok": true, "data": {"profiles": list, "active": active}})
        }
        "doctor" => {
            let report = st.cfg.doctor_report();
            serde_json::json!({"ok": true, "data": report})
        }
        "shutdown" => {
            let _ = tx_req.send(IpcMsg::Shutdown);
            serde_json::json!({"ok": true, "data": "shutting down"})
        }
        _ => serde_json::json!({"ok": false, "error": format!("unknown op: {op}")}),
    };

    writeln!(stream, "{resp}")?;
    Ok(())
}

/// Round-trips a request through the daemon loop.
fn ask(
    tx_req: &Sender<IpcMsg>,
    make: fn(Sender<serde_json::Value>) -> IpcMsg,
) -> serde_json::Value {
    let (tx, rx) = mpsc::channel();
    if tx_req.send(make(tx)).is_err() {
        return serde_json::json!({"ok": false, "error": "daemon is shutting down"});
    }
    rx.recv_timeout(REPLY_TIMEOUT)
        .unwrap_or_else(|_| serde_json::json!({"ok": false, "error": "daemon did not answer"}))
}

struct DaemonState {
    cfg: DaemonConfigState,
    worker: Option<SessionWorker>,
    last_result: Option<serde_json::Value>,
    sessions_launched: u64,
}

impl DaemonState {
    fn new() -> Result<Self> {
        let cfg = DaemonConfigState::load_or_install_default()?;
        Ok(Self {
            cfg,
            worker: None,
            last_result: None,
            sessions_launched: 0,
        })
    }

    // only what client threads read
    fn clone_shallow(&self) -> Self {
        Self {
            cfg: self.cfg.clone(),
            worker: None,
            last_result: None,
            sessions_launched: self.sessions_launched,
        }
    }

    fn launch(&mut self, tx_evt: Sender<DaemonEvent>) -> serde_json::Value {
        if self.worker.is_some() {
            return serde_json::json!({"ok": false, "error": "a session is already running"});
        }
        match SessionWorker::start(self.cfg.profile.clone(), tx_evt) {
            Ok(w) => {
                self.worker = Some(w);
                self.sessions_launched += 1;
                info!("session #{} launched", self.sessions_launched);
                let profile = &self.cfg.active_name;
                serde_json::json!({"ok": true, "data": {"launched": true, "profile": profile}})
            }
            Err(e) => serde_json::json!({"ok": false, "error": e.to_string()}),
        }
    }

    fn halt(&mut self) -> serde_json::Value {
        match &self.worker {
            Some(w) => {
                w.stop.stop();
                serde_json::json!({"ok": true, "data": "stop requested"})
            }
            None => serde_json::json!({"ok": false, "error": "no session running"}),
        }
    }

    fn status(&self) -> serde_json::Value {
        let session = match &self.worker {
            Some(w) => serde_json::json!({
                "running": true,
                "uptime_ms": w.started_at.elapsed().as_millis() as u64,
            }),
            None => serde_json::json!({"running": false}),
        };
        serde_json::json!({"ok": true, "data": {
            "active_profile": self.cfg.active_name,
            "socket": socket_path(),
            "session": session,
            "sessions_launched": self.sessions_launched,
            "last_result": self.last_result,
        }})
    }

    fn on_session_event(&mut self, evt: DaemonEvent) {
        match evt {
            DaemonEvent::Started => info!("[session] started"),
            DaemonEvent::Finished(report) => {
                info!(
                    "[session] finished ({}), {} actions",
                    report.reason.as_str(),
                    report.actions_dispatched
                );
                let report = report.to_json();
                self.last_result = Some(serde_json::json!({"ok": true, "report": report}));
                self.worker = None;
            }
            DaemonEvent::Failed(err) => {
                error!("[session] failed: {err}");
                self.last_result = Some(serde_json::json!({"ok": false, "error": err}));
                self.worker = None;
            }
        }
    }

    /// Clears a worker whose thread ended without reporting (it panicked).
    fn reap_worker(&mut self, rx_evt: &Receiver<DaemonEvent>) {
        if !self.worker.as_ref().is_some_and(SessionWorker::is_finished) {
            return;
        }
        // the thread may have reported between the caller's drain and now
        while let Ok(evt) = rx_evt.try_recv() {
            self.on_session_event(evt);
        }
        let Some(w) = self.worker.take() else {
            return;
        };
        let why = match w.thread.join() {
            Ok(()) => "session thread exited without a result".to_string(),
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                format!("session thread panicked: {msg}")
            }
        };
        self.on_session_event(DaemonEvent::Failed(why));
    }

    fn shutdown(&mut self, rx_evt: &Receiver<DaemonEvent>) {
        let Some(w) = &self.worker else {
            return;
        };
        w.stop.stop();
        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.worker.is_some() {
            let left = deadline.saturating_duration_since(Instant::now());
            match rx_evt.recv_timeout(left.min(Duration::from_millis(50))) {
                Ok(evt) => self.on_session_event(evt),
                Err(_) if left > Duration::ZERO => self.reap_worker(rx_evt),
                Err(_) => {
                    warn!("session did not stop within {SHUTDOWN_GRACE:?}");
                    break;
                }
            }
        }
    }
}

enum IpcMsg {
    Launch(Sender<serde_json::Value>),
    Halt(Sender<serde_json::Value>),
    Status(Sender<serde_json::Value>),
    Reload,
    ProfilesChanged,
    UseProfile(String),
    Shutdown,
}

pub enum DaemonEvent {
    Started,
    Finished(SessionReport),
    Failed(String),
}

struct SessionWorker {
    stop: StopHandle,
    started_at: Instant,
    thread: thread::JoinHandle<()>,
}

impl SessionWorker {
    fn start(profile: Profile, tx_evt: Sender<DaemonEvent>) -> Result<Self> {
        Self::spawn(tx_evt, move |stop| match session::run_live(&profile, stop) {
            Ok(report) => DaemonEvent::Finished(report),
            Err(e) => DaemonEvent::Failed(e.to_string()),
        })
    }

    fn spawn<F>(tx_evt: Sender<DaemonEvent>, body: F) -> Result<Self>
    where
        F: FnOnce(StopHandle) -> DaemonEvent + Send + 'static,
    {
        let stop = StopHandle::new();
        let stop_clone = stop.clone();
        let thread = thread::Builder::new()
            .name("session".into())
            .spawn(move || {
                let _ = tx_evt.send(DaemonEvent::Started);
                let _ = tx_evt.send(body(stop_clone));
            })?;
        Ok(Self {
            stop,
            started_at: Instant::now(),
            thread,
        })
    }

    fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

// client helper
pub fn client_request(req: serde_json::Value) -> Result<serde_json::Value> {
    let sock = socket_path();
    if !sock.exists() {
        return Err(anyhow!(
            "handctl daemon is not running (socket missing at {})",
            sock.display()
        ));
    }
    let mut stream = UnixStream::connect(sock)?;
    let line = serde_json::to_string(&req)? + "\n";
    stream.write_all(line.as_bytes())?;
    let mut reader = BufReader::new(stream);
    let mut resp = String::new();
    reader.read_line(&mut resp)?;
    let v: serde_json::Value = serde_json::from_str(&resp)?;
    Ok(v)
}
