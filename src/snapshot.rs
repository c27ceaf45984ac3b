//! RDB snapshot loading and writing.
//!
//! The loader reads the on-disk layout at startup and the payload a primary
//! ships during full resync. Only string values are representable; streams
//! are skipped by the writer. Everything flows into the keyspace through
//! [`Keyspace::set`].
//!
//! Layout:
//! ```text
//! "REDIS" <4 digit version>
//! { FA <aux key> <aux value>
//! | FE <db number>
//! | FB <table size> <expires size>
//! | [FD <u32 LE secs> | FC <u64 LE ms>] <type> <key> <value> }
//! FF <8 byte checksum>
//! ```

use crate::storage::{Keyspace, Millis, Value};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

const MAGIC: &[u8] = b"REDIS";
const VERSION: &[u8] = b"0011";

const OP_AUX: u8 = 0xFA;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EXPIRETIME_MS: u8 = 0xFC;
const OP_EXPIRETIME: u8 = 0xFD;
const OP_SELECTDB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;

const TYPE_STRING: u8 = 0;

const ENC_INT8: u8 = 0;
const ENC_INT16: u8 = 1;
const ENC_INT32: u8 = 2;
const ENC_LZF: u8 = 3;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("missing REDIS magic header")]
    BadMagic,

    #[error("invalid version field")]
    BadVersion,

    #[error("unexpected end of data while reading {0}")]
    UnexpectedEof(&'static str),

    #[error("unsupported value type {0}")]
    UnsupportedType(u8),

    #[error("unsupported string encoding {0}")]
    UnsupportedEncoding(u8),

    #[error("corrupt LZF data: {0}")]
    Lzf(&'static str),

    #[error("key is not valid UTF-8")]
    InvalidKey,
}

/// A length-prefixed field: either a plain length or a special encoding tag.
enum Length {
    Plain(usize),
    Encoded(u8),
}

/// Cursor over snapshot bytes.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8], SnapshotError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.data.len())
            .ok_or(SnapshotError::UnexpectedEof(what))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, SnapshotError> {
        Ok(self.take(1, what)?[0])
    }

    fn array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N], SnapshotError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    fn length(&mut self) -> Result<Length, SnapshotError> {
        let first = self.u8("length")?;
        match first >> 6 {
            0b00 => Ok(Length::Plain((first & 0x3F) as usize)),
            0b01 => {
                let next = self.u8("length")?;
                Ok(Length::Plain((((first & 0x3F) as usize) << 8) | next as usize))
            }
            0b10 if first == 0x80 => {
                Ok(Length::Plain(u32::from_be_bytes(self.array("length")?) as usize))
            }
            0b10 if first == 0x81 => {
                Ok(Length::Plain(u64::from_be_bytes(self.array("length")?) as usize))
            }
            0b10 => Err(SnapshotError::UnsupportedEncoding(first)),
            _ => Ok(Length::Encoded(first & 0x3F)),
        }
    }

    fn plain_length(&mut self) -> Result<usize, SnapshotError> {
        match self.length()? {
            Length::Plain(n) => Ok(n),
            Length::Encoded(enc) => Err(SnapshotError::UnsupportedEncoding(enc)),
        }
    }

    fn string(&mut self) -> Result<Bytes, SnapshotError> {
        match self.length()? {
            Length::Plain(n) => Ok(Bytes::copy_from_slice(self.take(n, "string")?)),
            Length::Encoded(ENC_INT8) => {
                let n = i8::from_le_bytes(self.array("int8")?);
                Ok(Bytes::from(n.to_string()))
            }
            Length::Encoded(ENC_INT16) => {
                let n = i16::from_le_bytes(self.array("int16")?);
                Ok(Bytes::from(n.to_string()))
            }
            Length::Encoded(ENC_INT32) => {
                let n = i32::from_le_bytes(self.array("int32")?);
                Ok(Bytes::from(n.to_string()))
            }
            Length::Encoded(ENC_LZF) => {
                let compressed_len = self.plain_length()?;
                let plain_len = self.plain_length()?;
                let compressed = self.take(compressed_len, "compressed string")?;
                lzf_decompress(compressed, plain_len).map(Bytes::from)
            }
            Length::Encoded(other) => Err(SnapshotError::UnsupportedEncoding(other)),
        }
    }
}

/// Load snapshot bytes into the keyspace, returning the number of keys stored.
///
/// Entries whose expiry is already at or before `now` are skipped.
pub fn load(data: &[u8], keyspace: &mut Keyspace, now: Millis) -> Result<usize, SnapshotError> {
    let mut reader = Reader::new(data);

    if reader.take(MAGIC.len(), "magic")? != MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let version = reader.take(4, "version")?;
    if !version.iter().all(u8::is_ascii_digit) {
        return Err(SnapshotError::BadVersion);
    }

    let mut loaded = 0;
    let mut expires_at: Option<Millis> = None;

    loop {
        match reader.u8("opcode")? {
            OP_EOF => break,
            OP_AUX => {
                let key = reader.string()?;
                let value = reader.string()?;
                debug!(
                    key = %String::from_utf8_lossy(&key),
                    value = %String::from_utf8_lossy(&value),
                    "Snapshot aux field"
                );
            }
            OP_SELECTDB => {
                let db = reader.plain_length()?;
                debug!(db, "Snapshot selects database");
            }
            OP_RESIZEDB => {
                let size = reader.plain_length()?;
                let expires = reader.plain_length()?;
                debug!(size, expires, "Snapshot resize hint");
            }
            OP_EXPIRETIME => {
                let secs = u32::from_le_bytes(reader.array("expiry")?);
                expires_at = Some(secs as Millis * 1000);
            }
            OP_EXPIRETIME_MS => {
                expires_at = Some(u64::from_le_bytes(reader.array("expiry")?));
            }
            TYPE_STRING => {
                let key = reader.string()?;
                let value = reader.string()?;
                let key = String::from_utf8(key.to_vec()).map_err(|_| SnapshotError::InvalidKey)?;

                match expires_at.take() {
                    Some(at) if at <= now => {
                        debug!(key = %key, "Skipping expired snapshot entry");
                    }
                    expiry => {
                        keyspace.set(key, Value::String(value), expiry);
                        loaded += 1;
                    }
                }
            }
            other => return Err(SnapshotError::UnsupportedType(other)),
        }
    }

    Ok(loaded)
}

/// Load a snapshot file. A missing file leaves the keyspace empty.
pub fn load_file(path: &Path, keyspace: &mut Keyspace, now: Millis) -> Result<usize, SnapshotError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No snapshot file, starting empty");
            return Ok(0);
        }
        Err(e) => return Err(e.into()),
    };

    let loaded = load(&data, keyspace, now)?;
    info!(path = %path.display(), keys = loaded, "Loaded snapshot");
    Ok(loaded)
}

/// Serialise the live string keys of the keyspace.
pub fn write(keyspace: &Keyspace, now: Millis) -> Bytes {
    let mut entries: Vec<_> = keyspace
        .iter_live(now)
        .filter_map(|(key, value, expires_at)| match value {
            Value::String(data) => Some((key, data, expires_at)),
            Value::Stream(_) => {
                debug!(key, "Stream key left out of snapshot");
                None
            }
        })
        .collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    let with_expiry = entries.iter().filter(|e| e.2.is_some()).count();

    let mut buf = BytesMut::new();
    buf.put_slice(MAGIC);
    buf.put_slice(VERSION);

    buf.put_u8(OP_AUX);
    put_string(&mut buf, b"redis-ver");
    put_string(&mut buf, b"7.2.0");

    buf.put_u8(OP_SELECTDB);
    put_length(&mut buf, 0);
    buf.put_u8(OP_RESIZEDB);
    put_length(&mut buf, entries.len());
    put_length(&mut buf, with_expiry);

    for (key, data, expires_at) in entries {
        if let Some(at) = expires_at {
            buf.put_u8(OP_EXPIRETIME_MS);
            buf.put_u64_le(at);
        }
        buf.put_u8(TYPE_STRING);
        put_string(&mut buf, key.as_bytes());
        put_string(&mut buf, data);
    }

    buf.put_u8(OP_EOF);
    // Checksum disabled
    buf.put_u64(0);
    buf.freeze()
}

fn put_length(buf: &mut BytesMut, len: usize) {
    if len < 1 << 6 {
        buf.put_u8(len as u8);
    } else if len < 1 << 14 {
        buf.put_u8(0x40 | (len >> 8) as u8);
        buf.put_u8(len as u8);
    } else if let Ok(len) = u32::try_from(len) {
        buf.put_u8(0x80);
        buf.put_u32(len);
    } else {
        buf.put_u8(0x81);
        buf.put_u64(len as u64);
    }
}

fn put_string(buf: &mut BytesMut, data: &[u8]) {
    put_length(buf, data.len());
    buf.put_slice(data);
}

/// Decompress an LZF block into exactly `expected` bytes.
fn lzf_decompress(input: &[u8], expected: usize) -> Result<Vec<u8>, SnapshotError> {
    let mut out = Vec::with_capacity(expected);
    let mut ip = 0;

    while ip < input.len() {
        let ctrl = input[ip] as usize;
        ip += 1;

        if ctrl < 32 {
            // Literal run of ctrl + 1 bytes
            let run = ctrl + 1;
            let literal = input
                .get(ip..ip + run)
                .ok_or(SnapshotError::Lzf("literal runs past input"))?;
            out.extend_from_slice(literal);
            ip += run;
        } else {
            // Back reference
            let mut len = ctrl >> 5;
            if len == 7 {
                len += *input.get(ip).ok_or(SnapshotError::Lzf("truncated length"))? as usize;
                ip += 1;
            }
            let low = *input.get(ip).ok_or(SnapshotError::Lzf("truncated offset"))? as usize;
            ip += 1;

            let distance = ((ctrl & 0x1F) << 8) + low + 1;
            let start = out
                .len()
                .checked_sub(distance)
                .ok_or(SnapshotError::Lzf("reference before start"))?;
            // Source and destination may overlap, copy byte by byte
            for i in 0..len + 2 {
                let byte = out[start + i];
                out.push(byte);
            }
        }
    }

    if out.len() != expected {
        return Err(SnapshotError::Lzf("length mismatch"));
    }
    Ok(out)
}
