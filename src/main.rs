//! floodgate server binary.

use floodgate::config::Config;
use floodgate::limits;
use floodgate::server::Server;
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

    // Lift the descriptor ceiling before any sockets are created; without
    // this the server tops out around the default soft limit.
    match limits::raise_nofile_limit() {
        Ok(limit) => info!(nofile = limit, "raised open file limit"),
        Err(e) => warn!(error = %e, "could not raise open file limit"),
    }

    info!(
        listen = %config.listen,
        topology = ?config.topology,
        dispatch = ?config.dispatch,
        tls = config.tls.is_some(),
        max_frame_len = config.max_frame_len,
        "starting floodgate server"
    );

    let server = Server::bind(&config)?;
    server.run()?;
    Ok(())
}
