//! kestrel: a RESP-compatible key-value server
//!
//! Features:
//! - Strings with optional expiry (SET EX/PX, lazy and active expiry)
//! - Append-only streams with XADD, XRANGE and blocking XREAD
//! - Startup load of an RDB snapshot
//! - Primary/replica replication with WAIT
//! - Configuration via CLI arguments or TOML file

use kestrel::config::Config;
use kestrel::runtime;
use tracing::info;
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

    info!(
        host = %config.host,
        port = config.port,
        dir = %config.dir.display(),
        dbfilename = %config.dbfilename,
        replicaof = ?config.replicaof.as_ref().map(|r| format!("{}:{}", r.host, r.port)),
        "Starting kestrel server"
    );

    runtime::run(&config)?;
    Ok(())
}
