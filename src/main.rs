//! hello-udp: Hello protocol client and server
//!
//! Usage:
//! - `hello-udp client <host> <port> <prefix> [lanes [requests]]`
//! - `hello-udp server <port> [workers]`
//!
//! Both modes accept `--runtime blocking|reactor` and an optional TOML
//! configuration file via `--config`.

use hello_udp::config::{Config, Mode, Runtime};
use hello_udp::{
    BlockingClient, BlockingServer, ClientConfig, HelloClient, HelloServer, ReactorClient,
    ReactorServer, ServerConfig,
};
use std::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.mode {
        Mode::Client { runtime, config } => run_client(runtime, &config),
        Mode::Server { runtime, config } => run_server(runtime, &config),
    }
}

fn run_client(runtime: Runtime, config: &ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let report = match runtime {
        Runtime::Blocking => BlockingClient::new().run(config)?,
        Runtime::Reactor => ReactorClient::new().run(config)?,
    };

    info!(
        sent = report.total_sent(),
        lanes = report.lanes.len(),
        "Client finished"
    );
    for lane in report.abandoned() {
        warn!(
            lane = lane.lane,
            accepted = lane.accepted,
            requests = config.requests,
            "Lane abandoned"
        );
    }
    Ok(())
}

fn run_server(runtime: Runtime, config: &ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    match runtime {
        Runtime::Blocking => serve_until_interrupted(BlockingServer::start(config)?),
        Runtime::Reactor => serve_until_interrupted(ReactorServer::start(config)?),
    }
}

/// Block until Ctrl-C, then close the server.
fn serve_until_interrupted<S: HelloServer>(server: S) -> Result<(), Box<dyn std::error::Error>> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    info!(addr = %server.local_addr(), "Serving, press Ctrl-C to stop");
    let _ = rx.recv();

    info!("Shutting down");
    server.close();
    Ok(())
}
