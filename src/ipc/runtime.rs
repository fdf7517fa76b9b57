use directories::{BaseDirs, UserDirs};
use std::{fs, path::PathBuf};

/// `$XDG_RUNTIME_DIR/handctl` when the session has one, else
/// `~/.local/run/handctl`.
pub fn runtime_dir() -> PathBuf {
    let base = BaseDirs::new()
        .and_then(|b| b.runtime_dir().map(|p| p.to_path_buf()))
        .or_else(|| UserDirs::new().map(|u| u.home_dir().join(".local").join("run")))
        .unwrap_or_else(std::env::temp_dir);
    let dir = base.join("handctl");
    let _ = fs::create_dir_all(&dir);
    dir
}

pub fn socket_path() -> PathBuf {
    runtime_dir().join("daemon.sock")
}
