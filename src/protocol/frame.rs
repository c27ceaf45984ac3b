//! RESP frame values and their wire encoding.

use bytes::{Bytes, BytesMut};

/// RESP frame types
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string: +OK\r\n
    Simple(String),
    /// Error: -ERR message\r\n
    Error(String),
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $5\r\nhello\r\n or $-1\r\n (null)
    Bulk(Option<Bytes>),
    /// Array: *2\r\n... or *-1\r\n (null)
    Array(Option<Vec<Frame>>),
    /// Map: %1\r\n<key><value>
    Map(Vec<(Frame, Frame)>),
    /// Length-prefixed payload with no trailing CRLF: $5\r\nhello
    ///
    /// Only used to ship a snapshot during full resync.
    RawBulk(Bytes),
}

impl Frame {
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Append the wire form to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Frame::Simple(s) => write_line(buf, b'+', s.as_bytes()),
            Frame::Error(s) => write_line(buf, b'-', s.as_bytes()),
            Frame::Integer(n) => write_line(buf, b':', n.to_string().as_bytes()),
            Frame::Bulk(None) => buf.extend_from_slice(b"$-1\r\n"),
            Frame::Bulk(Some(data)) => {
                write_line(buf, b'$', data.len().to_string().as_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            Frame::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
            Frame::Array(Some(frames)) => {
                write_line(buf, b'*', frames.len().to_string().as_bytes());
                frames.iter().for_each(|frame| frame.encode_into(buf));
            }
            Frame::Map(pairs) => {
                write_line(buf, b'%', pairs.len().to_string().as_bytes());
                for (key, value) in pairs {
                    key.encode_into(buf);
                    value.encode_into(buf);
                }
            }
            Frame::RawBulk(data) => {
                write_line(buf, b'$', data.len().to_string().as_bytes());
                buf.extend_from_slice(data);
            }
        }
    }

    pub fn simple<S: Into<String>>(s: S) -> Frame {
        Frame::Simple(s.into())
    }

    pub fn error<S: Into<String>>(s: S) -> Frame {
        Frame::Error(s.into())
    }

    /// `$-1`, the missing-value reply.
    pub fn null() -> Frame {
        Frame::Bulk(None)
    }

    /// `*-1`, used for timed-out blocking reads.
    pub fn null_array() -> Frame {
        Frame::Array(None)
    }

    pub fn bulk<B: Into<Bytes>>(data: B) -> Frame {
        Frame::Bulk(Some(data.into()))
    }

    pub fn integer(n: i64) -> Frame {
        Frame::Integer(n)
    }

    pub fn array(frames: Vec<Frame>) -> Frame {
        Frame::Array(Some(frames))
    }

    /// Encode a command the way clients send it: an array of bulk strings.
    pub fn command<I, B>(parts: I) -> Frame
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Frame::array(parts.into_iter().map(Frame::bulk).collect())
    }
}

const CRLF: &[u8] = b"\r\n";

/// `<prefix><body>\r\n`
fn write_line(buf: &mut BytesMut, prefix: u8, body: &[u8]) {
    buf.reserve(body.len() + 3);
    buf.extend_from_slice(&[prefix]);
    buf.extend_from_slice(body);
    buf.extend_from_slice(CRLF);
}
