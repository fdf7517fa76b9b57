mod actions;
mod cli;
mod config;
mod debounce;
mod dispatch;
mod fingers;
mod gestures;
mod input;
mod ipc;
mod landmarks;
mod logging;
mod session;
mod smoother;
mod tracker;

fn main() -> anyhow::Result<()> {
    logging::init();
    cli::run()
}
