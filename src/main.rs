// # RustyPlane Agent
//
// Main entry point for the dataplane agent. Initializes the host
// environment, builds the shared map registry and managers, and runs
// the reconciliation driver until the process is terminated.

use std::fs;

use rusty_dataplane::driver::DataplaneDriver;
use rusty_dataplane::environment;
use rusty_dataplane::{AgentConfig, Result, VERSION};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let config = AgentConfig::default();

    info!("Initializing dataplane agent");
    info!("Version: {}", VERSION);

    let _ = fs::create_dir_all(&config.state_dir);

    if let Err(e) = environment::prepare_host(&config) {
        warn!("Host environment preparation incomplete: {}", e);
    }

    let (driver, _handle) = DataplaneDriver::new(config)?;
    driver.run().await
}
