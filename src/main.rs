// src/main.rs
use std::env;
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use tracing::error;

use minuet::{Config, MinuetError, MinuetResult, ThreadPool, Timer, WebServer};

fn main() -> ExitCode {
    minuet::logging::init_logging();

    let config_path = env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    match run(&config_path) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("server init failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(config_path: &str) -> MinuetResult<()> {
    let config = Config::load_from_file(Path::new(config_path))?;

    let timer = Timer::new();
    let pool = ThreadPool::new(config.server.thread.count);
    let mut server = WebServer::new(&config.server, timer, pool)?;

    let closed = server.shutdown_handle();
    ctrlc::set_handler(move || closed.store(true, Ordering::Release))
        .map_err(|err| MinuetError::Init(format!("failed to install signal handler: {err}")))?;

    server.start();
    Ok(())
}
