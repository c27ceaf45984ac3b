//! Error types shared across the server.
//!
//! Each layer has its own enum so the reactor can decide how far an error
//! reaches:
//! - `ProtocolError`: malformed frame, reply then close that connection
//! - `CommandError`: bad arity/syntax/type/value, reply only
//! - `ReplicationError`: handshake or apply violation, tear down the link
//! - `ServerError`: startup and socket failures

use crate::snapshot::SnapshotError;
use crate::storage::stream::StreamError;
use thiserror::Error;

/// Malformed request or reply bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid {what} '{text}'")]
    InvalidLength { what: &'static str, text: String },

    #[error("expected '{expected}', got '{got}'")]
    UnexpectedByte { expected: char, got: char },

    #[error("unknown frame type '{0}'")]
    UnknownFrameType(char),

    #[error("missing CRLF after bulk data")]
    MissingCrlf,

    #[error("{what} exceeds limit of {limit}")]
    TooLarge { what: &'static str, limit: usize },

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
}

impl ProtocolError {
    /// Wire text sent to the client before the connection is closed.
    pub fn reply_text(&self) -> String {
        format!("ERR Protocol error: {self}")
    }
}

/// Per-command failure. The `Display` text is the exact error reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR unknown subcommand '{subcommand}' for '{command}'")]
    UnknownSubcommand {
        command: &'static str,
        subcommand: String,
    },

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),

    #[error("ERR syntax error")]
    Syntax,

    #[error("ERR value is not an integer or out of range")]
    NotAnInteger,

    #[error("ERR invalid expire time in '{0}' command")]
    InvalidExpire(&'static str),

    #[error("ERR timeout is negative")]
    NegativeTimeout,

    #[error("ERR Unbalanced 'xread' list of streams: for each stream key an ID or '$' must be specified.")]
    UnbalancedStreams,

    #[error("ERR invalid pattern '{0}'")]
    InvalidPattern(String),

    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,

    #[error("READONLY You can't write against a read only replica.")]
    ReadOnly,

    #[error("ERR {0}")]
    NotSupported(&'static str),

    #[error("ERR {0}")]
    Stream(#[from] StreamError),
}

/// Failure on a replication link, fatal to that link only.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("unexpected reply while {state}: {reply}")]
    UnexpectedReply { state: &'static str, reply: String },

    #[error("malformed FULLRESYNC line '{0}'")]
    BadFullResync(String),

    #[error("data received before handshake started")]
    UnexpectedData,

    #[error("protocol error on replication stream: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("snapshot load failed: {0}")]
    Snapshot(#[from] SnapshotError),
}

/// Startup-level failures surfaced from `main`.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("failed to load snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_wire_text() {
        assert_eq!(
            CommandError::WrongArity("echo").to_string(),
            "ERR wrong number of arguments for 'echo' command"
        );
        assert_eq!(
            CommandError::UnknownCommand("FOO".to_string()).to_string(),
            "ERR unknown command 'FOO'"
        );
        assert!(CommandError::WrongType.to_string().starts_with("WRONGTYPE"));
    }

    #[test]
    fn test_stream_error_converts() {
        let err: CommandError = StreamError::InvalidId.into();
        assert_eq!(
            err.to_string(),
            "ERR Invalid stream ID specified as stream command argument"
        );
    }

    #[test]
    fn test_protocol_error_reply_text() {
        let err = ProtocolError::UnexpectedByte {
            expected: '$',
            got: ':',
        };
        assert_eq!(
            err.reply_text(),
            "ERR Protocol error: expected '$', got ':'"
        );
    }
}
