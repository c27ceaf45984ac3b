//! kestrel: a RESP-compatible key-value server.
//!
//! Strings with expiry, append-only streams with blocking reads, RDB
//! snapshot loading, and primary/replica replication, all served from one
//! single-threaded reactor.

pub mod commands;
pub mod config;
pub mod error;
pub mod outbox;
pub mod protocol;
pub mod replication;
pub mod runtime;
pub mod snapshot;
pub mod storage;

pub use config::Config;
pub use error::ServerError;
