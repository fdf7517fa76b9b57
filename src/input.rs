//! Camera discovery (V4L2 nodes), reported by `doctor`.

use serde::Serialize;
use std::fs;

#[derive(Debug, Clone, Serialize)]
pub struct CameraInfo {
    pub path: String,
    pub name: String,
}

pub fn discover_cameras() -> Vec<CameraInfo> {
    let mut out = vec![];
    if let Ok(rd) = fs::read_dir("/dev") {
        for e in rd.flatten() {
            let p = e.path();
            let Some(node) = p.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if !node.starts_with("video") {
                continue;
            }
            let name = fs::read_to_string(format!("/sys/class/video4linux/{node}/name"))
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| "unknown".to_string());
            out.push(CameraInfo {
                path: p.display().to_string(),
                name,
            });
        }
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    out
}
