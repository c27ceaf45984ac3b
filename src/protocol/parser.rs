//! RESP parsing from partial byte buffers.
//!
//! Three entry points share the same line/length helpers:
//! - [`decode_request`]: client requests, either a multi-bulk array of bulk
//!   strings or an inline line of space-separated tokens
//! - [`parse`]: any reply frame (used by the replica during its handshake)
//! - [`parse_snapshot_header`]: the `$<len>\r\n` prefix of a resync payload
//!
//! None of them consume anything on `Incomplete`; the caller keeps its buffer
//! and retries once more bytes have arrived.

use super::frame::Frame;
use crate::error::ProtocolError;
use bytes::{Bytes, BytesMut};

/// Maximum bulk string payload (512 MB)
pub const MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Maximum number of elements in a multi-bulk request
pub const MAX_ARRAY_LEN: usize = 1024 * 1024;

/// Maximum length of an inline request or a header line
pub const MAX_INLINE_LEN: usize = 64 * 1024;

/// Upper bound on elements reserved ahead of parsing
const PREALLOC_LIMIT: usize = 1024;

/// Parse result
#[derive(Debug, PartialEq)]
pub enum ParseResult<T = Frame> {
    /// Successfully parsed a value with bytes consumed
    Complete(T, usize),
    /// Need more data
    Incomplete,
    /// Parse error
    Error(ProtocolError),
}

/// A decoded client request together with the exact bytes it arrived as.
///
/// `raw` is what gets forwarded to replicas and what advances replication
/// offsets, so its length is the frame's wire length.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub parts: Vec<Bytes>,
    pub raw: Bytes,
}

impl Request {
    /// Decode one request from the front of `buf`, splitting its bytes off.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when the frame is not
    /// complete yet.
    pub fn take(buf: &mut BytesMut) -> Result<Option<Request>, ProtocolError> {
        match decode_request(buf) {
            ParseResult::Complete(parts, consumed) => {
                let raw = buf.split_to(consumed).freeze();
                Ok(Some(Request { parts, raw }))
            }
            ParseResult::Incomplete => Ok(None),
            ParseResult::Error(e) => Err(e),
        }
    }

    /// Build a request as a client would send it in array form.
    pub fn from_parts<I, B>(parts: I) -> Request
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        let parts: Vec<Bytes> = parts.into_iter().map(Into::into).collect();
        let raw = Frame::command(parts.iter().cloned()).encode().freeze();
        Request { parts, raw }
    }

    /// Number of bytes this request occupied on the wire.
    pub fn wire_len(&self) -> usize {
        self.raw.len()
    }

    /// Case-insensitive check of the leading words, e.g. `["REPLCONF", "GETACK"]`.
    pub fn starts_with(&self, words: &[&str]) -> bool {
        words.len() <= self.parts.len()
            && words
                .iter()
                .zip(&self.parts)
                .all(|(word, part)| part.eq_ignore_ascii_case(word.as_bytes()))
    }
}

/// Decode a client request from a buffer.
pub fn decode_request(buffer: &[u8]) -> ParseResult<Vec<Bytes>> {
    match buffer.first() {
        None => ParseResult::Incomplete,
        Some(b'*') => decode_multibulk(buffer),
        Some(_) => decode_inline(buffer),
    }
}

/// Decode `*N\r\n` followed by N bulk strings.
fn decode_multibulk(buffer: &[u8]) -> ParseResult<Vec<Bytes>> {
    let (count, mut offset) = match parse_length(buffer, "multibulk length", MAX_ARRAY_LEN) {
        ParseResult::Complete(n, consumed) => (n, consumed),
        ParseResult::Incomplete => return ParseResult::Incomplete,
        ParseResult::Error(e) => return ParseResult::Error(e),
    };

    // *-1 and *0 carry no command
    if count <= 0 {
        return ParseResult::Complete(Vec::new(), offset);
    }

    // The count is untrusted until the elements actually arrive
    let mut parts = Vec::with_capacity((count as usize).min(PREALLOC_LIMIT));
    for _ in 0..count {
        let Some(&prefix) = buffer.get(offset) else {
            return ParseResult::Incomplete;
        };
        if prefix != b'$' {
            return ParseResult::Error(ProtocolError::UnexpectedByte {
                expected: '$',
                got: prefix as char,
            });
        }

        let (len, header) = match parse_length(&buffer[offset..], "bulk length", MAX_BULK_LEN) {
            ParseResult::Complete(n, consumed) => (n, consumed),
            ParseResult::Incomplete => return ParseResult::Incomplete,
            ParseResult::Error(e) => return ParseResult::Error(e),
        };
        if len < 0 {
            return ParseResult::Error(ProtocolError::InvalidLength {
                what: "bulk length",
                text: len.to_string(),
            });
        }

        let data_start = offset + header;
        let data_end = data_start + len as usize;
        if buffer.len() < data_end + 2 {
            return ParseResult::Incomplete;
        }
        if &buffer[data_end..data_end + 2] != b"\r\n" {
            return ParseResult::Error(ProtocolError::MissingCrlf);
        }

        parts.push(Bytes::copy_from_slice(&buffer[data_start..data_end]));
        offset = data_end + 2;
    }

    ParseResult::Complete(parts, offset)
}

/// Decode a whitespace-separated line terminated by `\n` or `\r\n`.
fn decode_inline(buffer: &[u8]) -> ParseResult<Vec<Bytes>> {
    let Some(newline) = buffer.iter().position(|&b| b == b'\n') else {
        if buffer.len() > MAX_INLINE_LEN {
            return ParseResult::Error(ProtocolError::TooLarge {
                what: "inline request",
                limit: MAX_INLINE_LEN,
            });
        }
        return ParseResult::Incomplete;
    };

    let line = buffer[..newline]
        .strip_suffix(b"\r")
        .unwrap_or(&buffer[..newline]);
    let parts = line
        .split(|b| b.is_ascii_whitespace())
        .filter(|token| !token.is_empty())
        .map(Bytes::copy_from_slice)
        .collect();

    ParseResult::Complete(parts, newline + 1)
}

/// Parse a RESP reply frame from a buffer
pub fn parse(buffer: &[u8]) -> ParseResult {
    let Some(&prefix) = buffer.first() else {
        return ParseResult::Incomplete;
    };

    match prefix {
        b'+' => parse_line(buffer, "simple string").map(Frame::Simple),
        b'-' => parse_line(buffer, "error").map(Frame::Error),
        b':' => parse_integer(buffer),
        b'$' => parse_bulk_string(buffer),
        b'*' => parse_array(buffer),
        other => ParseResult::Error(ProtocolError::UnknownFrameType(other as char)),
    }
}

/// Parse the `$<len>\r\n` header that precedes a snapshot payload.
///
/// Returns the payload length; the payload itself has no trailing CRLF.
pub fn parse_snapshot_header(buffer: &[u8]) -> ParseResult<usize> {
    let Some(&prefix) = buffer.first() else {
        return ParseResult::Incomplete;
    };
    if prefix != b'$' {
        return ParseResult::Error(ProtocolError::UnexpectedByte {
            expected: '$',
            got: prefix as char,
        });
    }

    match parse_length(buffer, "snapshot length", MAX_BULK_LEN) {
        ParseResult::Complete(len, consumed) if len >= 0 => {
            ParseResult::Complete(len as usize, consumed)
        }
        ParseResult::Complete(len, _) => ParseResult::Error(ProtocolError::InvalidLength {
            what: "snapshot length",
            text: len.to_string(),
        }),
        ParseResult::Incomplete => ParseResult::Incomplete,
        ParseResult::Error(e) => ParseResult::Error(e),
    }
}

impl<T> ParseResult<T> {
    fn map<U>(self, f: impl FnOnce(T) -> U) -> ParseResult<U> {
        match self {
            ParseResult::Complete(value, consumed) => ParseResult::Complete(f(value), consumed),
            ParseResult::Incomplete => ParseResult::Incomplete,
            ParseResult::Error(e) => ParseResult::Error(e),
        }
    }
}

/// Find CRLF in buffer, return position of \r
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// Read the text after the one-byte prefix up to CRLF.
fn parse_line(buffer: &[u8], what: &'static str) -> ParseResult<String> {
    match find_crlf(buffer) {
        Some(end) => match std::str::from_utf8(&buffer[1..end]) {
            Ok(s) => ParseResult::Complete(s.to_string(), end + 2),
            Err(_) => ParseResult::Error(ProtocolError::InvalidUtf8(what)),
        },
        None if buffer.len() > MAX_INLINE_LEN => ParseResult::Error(ProtocolError::TooLarge {
            what,
            limit: MAX_INLINE_LEN,
        }),
        None => ParseResult::Incomplete,
    }
}

/// Parse a `<prefix><signed integer>\r\n` header, bounded by `limit`.
fn parse_length(buffer: &[u8], what: &'static str, limit: usize) -> ParseResult<i64> {
    let (text, consumed) = match parse_line(buffer, what) {
        ParseResult::Complete(text, consumed) => (text, consumed),
        ParseResult::Incomplete => return ParseResult::Incomplete,
        ParseResult::Error(e) => return ParseResult::Error(e),
    };

    match text.parse::<i64>() {
        Ok(n) if n > 0 && n as u64 > limit as u64 => {
            ParseResult::Error(ProtocolError::TooLarge { what, limit })
        }
        Ok(n) => ParseResult::Complete(n, consumed),
        Err(_) => ParseResult::Error(ProtocolError::InvalidLength { what, text }),
    }
}

/// Parse an integer: :1000\r\n
fn parse_integer(buffer: &[u8]) -> ParseResult {
    let (text, consumed) = match parse_line(buffer, "integer") {
        ParseResult::Complete(text, consumed) => (text, consumed),
        ParseResult::Incomplete => return ParseResult::Incomplete,
        ParseResult::Error(e) => return ParseResult::Error(e),
    };
    match text.parse::<i64>() {
        Ok(n) => ParseResult::Complete(Frame::Integer(n), consumed),
        Err(_) => ParseResult::Error(ProtocolError::InvalidLength {
            what: "integer",
            text,
        }),
    }
}

/// Parse a bulk string: $5\r\nhello\r\n or $-1\r\n
fn parse_bulk_string(buffer: &[u8]) -> ParseResult {
    let (len, header) = match parse_length(buffer, "bulk length", MAX_BULK_LEN) {
        ParseResult::Complete(n, consumed) => (n, consumed),
        ParseResult::Incomplete => return ParseResult::Incomplete,
        ParseResult::Error(e) => return ParseResult::Error(e),
    };

    // Null bulk string
    if len < 0 {
        return ParseResult::Complete(Frame::Bulk(None), header);
    }

    let data_end = header + len as usize;
    let total_len = data_end + 2;
    if buffer.len() < total_len {
        return ParseResult::Incomplete;
    }
    if &buffer[data_end..total_len] != b"\r\n" {
        return ParseResult::Error(ProtocolError::MissingCrlf);
    }

    let data = Bytes::copy_from_slice(&buffer[header..data_end]);
    ParseResult::Complete(Frame::Bulk(Some(data)), total_len)
}

/// Parse an array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n or *-1\r\n
fn parse_array(buffer: &[u8]) -> ParseResult {
    let (len, mut offset) = match parse_length(buffer, "array length", MAX_ARRAY_LEN) {
        ParseResult::Complete(n, consumed) => (n, consumed),
        ParseResult::Incomplete => return ParseResult::Incomplete,
        ParseResult::Error(e) => return ParseResult::Error(e),
    };

    // Null array
    if len < 0 {
        return ParseResult::Complete(Frame::Array(None), offset);
    }

    let mut frames = Vec::with_capacity((len as usize).min(PREALLOC_LIMIT));
    for _ in 0..len {
        match parse(&buffer[offset..]) {
            ParseResult::Complete(frame, consumed) => {
                frames.push(frame);
                offset += consumed;
            }
            ParseResult::Incomplete => return ParseResult::Incomplete,
            ParseResult::Error(e) => return ParseResult::Error(e),
        }
    }

    ParseResult::Complete(Frame::Array(Some(frames)), offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(items: &[&str]) -> Vec<Bytes> {
        items
            .iter()
            .map(|s| Bytes::copy_from_slice(s.as_bytes()))
            .collect()
    }

    #[test]
    fn test_decode_multibulk() {
        let buffer = b"*2\r\n$4\r\nECHO\r\n$3\r\nhey\r\n";
        match decode_request(buffer) {
            ParseResult::Complete(p, consumed) => {
                assert_eq!(p, parts(&["ECHO", "hey"]));
                assert_eq!(consumed, buffer.len());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_reports_exact_consumed_with_trailing_data() {
        let buffer = b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPI";
        match decode_request(buffer) {
            ParseResult::Complete(p, consumed) => {
                assert_eq!(p, parts(&["PING"]));
                assert_eq!(consumed, 14);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(decode_request(&buffer[14..]), ParseResult::Incomplete);
    }

    #[test]
    fn test_decode_incomplete_at_every_split() {
        let buffer = b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n";
        for split in 0..buffer.len() {
            assert_eq!(
                decode_request(&buffer[..split]),
                ParseResult::Incomplete,
                "split at {split}"
            );
        }
    }

    #[test]
    fn test_decode_is_idempotent() {
        let buffer = b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n";
        assert_eq!(decode_request(buffer), decode_request(buffer));
    }

    #[test]
    fn test_decode_inline() {
        match decode_request(b"SET  foo bar\r\nGET") {
            ParseResult::Complete(p, consumed) => {
                assert_eq!(p, parts(&["SET", "foo", "bar"]));
                assert_eq!(consumed, 14);
            }
            other => panic!("unexpected: {:?}", other),
        }

        match decode_request(b"PING\n") {
            ParseResult::Complete(p, 5) => assert_eq!(p, parts(&["PING"])),
            other => panic!("unexpected: {:?}", other),
        }

        assert_eq!(decode_request(b"PING"), ParseResult::Incomplete);
    }

    #[test]
    fn test_decode_empty_inline_line() {
        match decode_request(b"\r\n") {
            ParseResult::Complete(p, 2) => assert!(p.is_empty()),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_non_bulk_element() {
        match decode_request(b"*1\r\n:1\r\n") {
            ParseResult::Error(ProtocolError::UnexpectedByte { expected: '$', got: ':' }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        match decode_request(b"*x\r\n") {
            ParseResult::Error(ProtocolError::InvalidLength { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
        match decode_request(b"*1\r\n$3\r\nabcd\r\n") {
            ParseResult::Error(ProtocolError::MissingCrlf) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_encode_then_decode() {
        let frame = Frame::command(["XADD", "s", "*", "temp", "36"]);
        let encoded = frame.encode();
        match decode_request(&encoded) {
            ParseResult::Complete(p, consumed) => {
                assert_eq!(p, parts(&["XADD", "s", "*", "temp", "36"]));
                assert_eq!(consumed, encoded.len());
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_request_take_splits_buffer() {
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\nECHO hi\r\n"[..]);
        let first = Request::take(&mut buf).unwrap().unwrap();
        assert_eq!(first.wire_len(), 14);
        assert_eq!(&first.raw[..], b"*1\r\n$4\r\nPING\r\n");

        let second = Request::take(&mut buf).unwrap().unwrap();
        assert_eq!(second.parts, parts(&["ECHO", "hi"]));
        assert!(buf.is_empty());
        assert!(Request::take(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_request_starts_with() {
        let request = Request::from_parts(["replconf", "GetAck", "*"]);
        assert!(request.starts_with(&["REPLCONF", "GETACK"]));
        assert!(!request.starts_with(&["REPLCONF", "ACK"]));
        assert!(!Request::from_parts(["PING"]).starts_with(&["PING", "x"]));
    }

    #[test]
    fn test_parse_simple_and_error() {
        match parse(b"+OK\r\n") {
            ParseResult::Complete(Frame::Simple(s), 5) => assert_eq!(s, "OK"),
            other => panic!("unexpected: {:?}", other),
        }
        match parse(b"-ERR unknown command\r\n") {
            ParseResult::Complete(Frame::Error(s), 22) => assert_eq!(s, "ERR unknown command"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_integer() {
        match parse(b":-42\r\n") {
            ParseResult::Complete(Frame::Integer(n), 6) => assert_eq!(n, -42),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_non_negative_integers() {
        assert_eq!(parse(b":0\r\n"), ParseResult::Complete(Frame::Integer(0), 4));
        assert_eq!(parse(b":1\r\n"), ParseResult::Complete(Frame::Integer(1), 4));
        assert_eq!(
            parse(b":9223372036854775807\r\n"),
            ParseResult::Complete(Frame::Integer(i64::MAX), 22)
        );
        match parse(b":12a\r\n") {
            ParseResult::Error(ProtocolError::InvalidLength { what: "integer", .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_reply_frames_survive_encoding() {
        let frames = [
            Frame::integer(0),
            Frame::integer(1),
            Frame::integer(-7),
            Frame::error("ERR unknown command 'FOO'"),
            Frame::null(),
            Frame::null_array(),
            Frame::array(vec![]),
            Frame::array(vec![
                Frame::bulk(Bytes::from_static(b"s")),
                Frame::array(vec![Frame::array(vec![
                    Frame::bulk(Bytes::from_static(b"1-1")),
                    Frame::array(vec![
                        Frame::bulk(Bytes::from_static(b"f")),
                        Frame::bulk(Bytes::from_static(b"v")),
                    ]),
                ])]),
                Frame::integer(3),
                Frame::null(),
            ]),
        ];
        for frame in frames {
            let encoded = frame.encode();
            assert_eq!(
                parse(&encoded),
                ParseResult::Complete(frame.clone(), encoded.len()),
                "{:?}",
                frame
            );
        }
    }

    #[test]
    fn test_huge_declared_count_stays_incomplete() {
        assert_eq!(decode_request(b"*1048576\r\n"), ParseResult::Incomplete);
        assert_eq!(parse(b"*1048576\r\n$1\r\na\r\n"), ParseResult::Incomplete);
        match decode_request(b"*1048577\r\n") {
            ParseResult::Error(ProtocolError::TooLarge { .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_bulk_and_array() {
        match parse(b"$-1\r\n") {
            ParseResult::Complete(Frame::Bulk(None), 5) => {}
            other => panic!("unexpected: {:?}", other),
        }
        match parse(b"*2\r\n$3\r\nfoo\r\n:7\r\n") {
            ParseResult::Complete(Frame::Array(Some(frames)), 17) => {
                assert_eq!(frames[0], Frame::bulk(Bytes::from_static(b"foo")));
                assert_eq!(frames[1], Frame::Integer(7));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(parse(b"*2\r\n$3\r\nfoo\r\n"), ParseResult::Incomplete);
    }

    #[test]
    fn test_parse_unknown_type() {
        match parse(b"?x\r\n") {
            ParseResult::Error(ProtocolError::UnknownFrameType('?')) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_parse_snapshot_header() {
        match parse_snapshot_header(b"$88\r\nREDIS") {
            ParseResult::Complete(88, 5) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(parse_snapshot_header(b"$88"), ParseResult::Incomplete);
        match parse_snapshot_header(b"+OK\r\n") {
            ParseResult::Error(ProtocolError::UnexpectedByte { expected: '$', .. }) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
