//! RESP (Redis Serialization Protocol) codec.
//!
//! Requests arrive as multi-bulk arrays or inline lines; replies use the
//! RESP2 types plus maps and the raw snapshot payload.

pub mod frame;
pub mod parser;

pub use frame::Frame;
pub use parser::{decode_request, parse, parse_snapshot_header, ParseResult, Request};
