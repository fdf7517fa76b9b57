//! Control surface: a daemon on a unix socket that launches recognition
//! sessions on request and reports how they ended.

mod runtime;
mod server;

pub use server::{client_request, run_daemon};
