//! `Taskman` development server: the task API and its realtime channel,
//! kept entirely in memory.
//!
//! ```bash
//! # Run on the default address 127.0.0.1:8000
//! cargo run --bin taskman-devserver
//!
//! # Run on a custom address
//! TASKMAN_DEVSERVER_ADDR=0.0.0.0:9000 cargo run --bin taskman-devserver
//! ```

use clap::Parser;
use taskman_devserver::config::{ServerCliArgs, ServerConfig};
use taskman_devserver::server;

#[tokio::main]
async fn main() {
    let cli = ServerCliArgs::parse();

    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::info!(addr = %config.bind_addr, "starting taskman dev server");

    match server::start_server(&config.bind_addr).await {
        Ok((bound_addr, handle, _state)) => {
            tracing::info!(addr = %bound_addr, "dev server listening");
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "dev server task failed");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to start dev server");
            std::process::exit(1);
        }
    }
}
