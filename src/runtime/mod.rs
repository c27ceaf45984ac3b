//! Networking runtime.
//!
//! A single mio reactor thread owns every socket and all server state.
//! Blocking commands never block the thread; their replies are parked and
//! delivered by a later event or tick.

mod connection;
mod event_loop;

pub use event_loop::EventLoop;

use crate::config::Config;
use crate::error::ServerError;
use crate::snapshot;
use crate::storage::{now_millis, Keyspace};

/// Load the snapshot, bind, and serve until an I/O error.
pub fn run(config: &Config) -> Result<(), ServerError> {
    let path = config.snapshot_path();
    let mut keyspace = Keyspace::new();
    snapshot::load_file(&path, &mut keyspace, now_millis())?;

    let mut event_loop = EventLoop::bind(config, keyspace)?;
    event_loop.run()?;
    Ok(())
}
