//! greeter: a TCP greeting server
//!
//! Accepts connections on an OS-assigned port, greets each client, and
//! acknowledges every chunk of text the client sends back. Every socket the
//! process opens is tracked, so an interrupt closes them all before exiting.
//!
//! Features:
//! - One task per connection; a slow client never stalls the acceptor
//! - Signal-driven cleanup of every tracked socket
//! - Configuration via CLI arguments or TOML file

mod config;
mod connection;
mod server;
mod shutdown;

use config::Config;
use shutdown::HandleRegistry;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // Diagnostics go to stderr; stdout carries only the assigned port
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        listen = %config.listen,
        backlog = config.backlog,
        buffer_size = config.buffer_size,
        workers = ?config.workers,
        "Starting greeter server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.build()?;

    let registry = Arc::new(HandleRegistry::new());

    runtime.block_on(async {
        // Installed before the listener exists, as an interrupt can arrive
        // at any point after that
        shutdown::install_interrupt_handler(Arc::clone(&registry));

        let server = match server::Server::bind(&config, Arc::clone(&registry)) {
            Ok(server) => server,
            Err(e) => {
                error!(error = %e, "Failed to start listener");
                shutdown::cleanup_and_exit(&registry)
            }
        };

        if let Err(e) = server.run().await {
            error!(error = %e, "Failed to accept connection");
        }

        // The accept loop only ends on a fatal error; close everything and
        // exit with failure status
        shutdown::cleanup_and_exit(&registry)
    })
}
