//! Append-only stream values and entry ID resolution.
//!
//! Entries are keyed by `(ms, seq)` in a `BTreeMap`, so range scans and
//! "everything after X" reads come straight off the ordered map.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;
use thiserror::Error;

/// Field/value pairs of one entry, kept in the order they were given.
pub type Fields = Vec<(Bytes, Bytes)>;

/// Stream ID errors surfaced to clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Invalid stream ID specified as stream command argument")]
    InvalidId,

    #[error("{0}")]
    ConstraintViolation(&'static str),
}

const ZERO_ID: &str = "The ID specified in XADD must be greater than 0-0";
const NOT_ABOVE_TOP: &str =
    "The ID specified in XADD is equal or smaller than the target stream top item";

/// Entry ID, ordered by milliseconds then sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId {
    pub ms: u64,
    pub seq: u64,
}

impl StreamId {
    pub const MIN: StreamId = StreamId { ms: 0, seq: 0 };
    pub const MAX: StreamId = StreamId {
        ms: u64::MAX,
        seq: u64::MAX,
    };

    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// Parse `<ms>-<seq>`, or a bare `<ms>` with `missing_seq` filled in.
    fn parse_with_default(s: &str, missing_seq: u64) -> Result<Self, StreamError> {
        match s.split_once('-') {
            Some((ms, seq)) => Ok(Self {
                ms: ms.parse().map_err(|_| StreamError::InvalidId)?,
                seq: seq.parse().map_err(|_| StreamError::InvalidId)?,
            }),
            None => Ok(Self {
                ms: s.parse().map_err(|_| StreamError::InvalidId)?,
                seq: missing_seq,
            }),
        }
    }

    /// Parse the start bound of XRANGE: `-`, `<ms>` or `<ms>-<seq>`.
    pub fn parse_range_start(s: &str) -> Result<Self, StreamError> {
        if s == "-" {
            return Ok(Self::MIN);
        }
        Self::parse_with_default(s, 0)
    }

    /// Parse the end bound of XRANGE: `+`, `<ms>` or `<ms>-<seq>`.
    pub fn parse_range_end(s: &str) -> Result<Self, StreamError> {
        if s == "+" {
            return Ok(Self::MAX);
        }
        Self::parse_with_default(s, u64::MAX)
    }

    /// Parse an explicit XREAD position: `<ms>` or `<ms>-<seq>`.
    pub fn parse_read_position(s: &str) -> Result<Self, StreamError> {
        Self::parse_with_default(s, 0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// The ID argument of XADD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSpec {
    /// `*`
    Auto,
    /// `<ms>-*`
    AutoSeq(u64),
    /// `<ms>-<seq>`
    Explicit(StreamId),
}

impl IdSpec {
    pub fn parse(s: &str) -> Result<Self, StreamError> {
        if s == "*" {
            return Ok(IdSpec::Auto);
        }
        match s.split_once('-') {
            Some((ms, "*")) => ms
                .parse()
                .map(IdSpec::AutoSeq)
                .map_err(|_| StreamError::InvalidId),
            Some(_) => StreamId::parse_with_default(s, 0).map(IdSpec::Explicit),
            None => Err(StreamError::InvalidId),
        }
    }
}

/// One stream entry as returned by reads.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: StreamId,
    pub fields: Fields,
}

/// An append-only log of entries with strictly increasing IDs.
#[derive(Debug, Clone, Default)]
pub struct Stream {
    entries: BTreeMap<StreamId, Fields>,
}

impl Stream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The highest ID in the stream, if any.
    pub fn last_id(&self) -> Option<StreamId> {
        self.entries.keys().next_back().copied()
    }

    /// Resolve an XADD ID argument against the current top of the stream.
    pub fn resolve_id(&self, spec: IdSpec, now_ms: u64) -> Result<StreamId, StreamError> {
        let top = self.last_id();

        let id = match spec {
            IdSpec::Auto => match top {
                // Clock at or behind the top: stay on the top's millisecond.
                Some(top) if top.ms >= now_ms => {
                    StreamId::new(top.ms, top.seq.saturating_add(1))
                }
                _ if now_ms == 0 => StreamId::new(0, 1),
                _ => StreamId::new(now_ms, 0),
            },
            IdSpec::AutoSeq(ms) => match top {
                Some(top) if top.ms == ms => StreamId::new(ms, top.seq.saturating_add(1)),
                _ if ms == 0 => StreamId::new(0, 1),
                _ => StreamId::new(ms, 0),
            },
            IdSpec::Explicit(id) => id,
        };

        if id == StreamId::MIN {
            return Err(StreamError::ConstraintViolation(ZERO_ID));
        }
        if top.is_some_and(|top| id <= top) {
            return Err(StreamError::ConstraintViolation(NOT_ABOVE_TOP));
        }
        Ok(id)
    }

    /// Append an entry, returning the ID it was stored under.
    pub fn append(
        &mut self,
        spec: IdSpec,
        fields: Fields,
        now_ms: u64,
    ) -> Result<StreamId, StreamError> {
        let id = self.resolve_id(spec, now_ms)?;
        self.entries.insert(id, fields);
        Ok(id)
    }

    /// Entries with `start <= id <= end`, ascending, at most `count`.
    pub fn range(&self, start: StreamId, end: StreamId, count: Option<usize>) -> Vec<StreamEntry> {
        if start > end {
            return Vec::new();
        }
        collect(
            self.entries.range((Bound::Included(start), Bound::Included(end))),
            count,
        )
    }

    /// Entries with `id > after`, ascending, at most `count`.
    pub fn read_after(&self, after: StreamId, count: Option<usize>) -> Vec<StreamEntry> {
        collect(
            self.entries.range((Bound::Excluded(after), Bound::Unbounded)),
            count,
        )
    }
}

fn collect<'a>(
    iter: impl Iterator<Item = (&'a StreamId, &'a Fields)>,
    count: Option<usize>,
) -> Vec<StreamEntry> {
    iter.take(count.unwrap_or(usize::MAX))
        .map(|(id, fields)| StreamEntry {
            id: *id,
            fields: fields.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(f, v)| {
                (
                    Bytes::copy_from_slice(f.as_bytes()),
                    Bytes::copy_from_slice(v.as_bytes()),
                )
            })
            .collect()
    }

    fn explicit(s: &str) -> IdSpec {
        IdSpec::parse(s).unwrap()
    }

    #[test]
    fn test_id_spec_parse() {
        assert_eq!(IdSpec::parse("*"), Ok(IdSpec::Auto));
        assert_eq!(IdSpec::parse("5-*"), Ok(IdSpec::AutoSeq(5)));
        assert_eq!(
            IdSpec::parse("5-3"),
            Ok(IdSpec::Explicit(StreamId::new(5, 3)))
        );
        assert_eq!(IdSpec::parse("abc"), Err(StreamError::InvalidId));
        assert_eq!(IdSpec::parse("1-x"), Err(StreamError::InvalidId));
        assert_eq!(IdSpec::parse("x-*"), Err(StreamError::InvalidId));
    }

    #[test]
    fn test_explicit_ids_must_increase() {
        let mut stream = Stream::new();
        assert_eq!(
            stream.append(explicit("1-1"), fields(&[("a", "b")]), 0),
            Ok(StreamId::new(1, 1))
        );
        assert_eq!(
            stream.append(explicit("1-1"), fields(&[("c", "d")]), 0),
            Err(StreamError::ConstraintViolation(NOT_ABOVE_TOP))
        );
        assert_eq!(
            stream.append(explicit("0-5"), fields(&[("c", "d")]), 0),
            Err(StreamError::ConstraintViolation(NOT_ABOVE_TOP))
        );
        assert_eq!(
            stream.append(explicit("1-2"), fields(&[("c", "d")]), 0),
            Ok(StreamId::new(1, 2))
        );
        assert_eq!(stream.len(), 2);
    }

    #[test]
    fn test_zero_id_always_rejected() {
        let stream = Stream::new();
        assert_eq!(
            stream.resolve_id(explicit("0-0"), 0),
            Err(StreamError::ConstraintViolation(ZERO_ID))
        );
    }

    #[test]
    fn test_auto_seq() {
        let mut stream = Stream::new();
        assert_eq!(
            stream.append(IdSpec::AutoSeq(0), fields(&[("a", "1")]), 0),
            Ok(StreamId::new(0, 1))
        );
        assert_eq!(
            stream.append(IdSpec::AutoSeq(5), fields(&[("a", "1")]), 0),
            Ok(StreamId::new(5, 0))
        );
        assert_eq!(
            stream.append(IdSpec::AutoSeq(5), fields(&[("a", "1")]), 0),
            Ok(StreamId::new(5, 1))
        );
        assert_eq!(
            stream.append(IdSpec::AutoSeq(4), fields(&[("a", "1")]), 0),
            Err(StreamError::ConstraintViolation(NOT_ABOVE_TOP))
        );
    }

    #[test]
    fn test_auto_ids_strictly_increase_within_one_millisecond() {
        let mut stream = Stream::new();
        let mut last = StreamId::MIN;
        for _ in 0..5 {
            let id = stream.append(IdSpec::Auto, fields(&[("f", "v")]), 1000).unwrap();
            assert!(id > last);
            assert_eq!(id.ms, 1000);
            last = id;
        }
        assert_eq!(last, StreamId::new(1000, 4));

        // Clock moved backwards: still above the top.
        let id = stream.append(IdSpec::Auto, fields(&[("f", "v")]), 10).unwrap();
        assert_eq!(id, StreamId::new(1000, 5));

        let id = stream.append(IdSpec::Auto, fields(&[("f", "v")]), 2000).unwrap();
        assert_eq!(id, StreamId::new(2000, 0));
    }

    #[test]
    fn test_range_inclusive_and_capped() {
        let mut stream = Stream::new();
        for id in ["1-1", "1-2", "2-0", "3-5"] {
            stream.append(explicit(id), fields(&[("k", id)]), 0).unwrap();
        }

        let ids = |entries: Vec<StreamEntry>| -> Vec<String> {
            entries.iter().map(|e| e.id.to_string()).collect()
        };

        assert_eq!(
            ids(stream.range(StreamId::new(1, 2), StreamId::new(3, 5), None)),
            vec!["1-2", "2-0", "3-5"]
        );
        assert_eq!(
            ids(stream.range(StreamId::MIN, StreamId::MAX, Some(2))),
            vec!["1-1", "1-2"]
        );
        assert_eq!(
            ids(stream.range(
                StreamId::parse_range_start("1").unwrap(),
                StreamId::parse_range_end("1").unwrap(),
                None
            )),
            vec!["1-1", "1-2"]
        );
        assert!(stream.range(StreamId::new(3, 0), StreamId::new(2, 0), None).is_empty());
    }

    #[test]
    fn test_read_after_is_exclusive() {
        let mut stream = Stream::new();
        for id in ["1-1", "1-2", "2-0"] {
            stream.append(explicit(id), fields(&[("k", "v")]), 0).unwrap();
        }
        let entries = stream.read_after(StreamId::new(1, 1), None);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, StreamId::new(1, 2));

        let entries = stream.read_after(StreamId::new(1, 1), Some(1));
        assert_eq!(entries.len(), 1);

        assert!(stream
            .read_after(stream.last_id().unwrap(), None)
            .is_empty());
    }

    #[test]
    fn test_range_bounds_parse() {
        assert_eq!(StreamId::parse_range_start("-"), Ok(StreamId::MIN));
        assert_eq!(StreamId::parse_range_end("+"), Ok(StreamId::MAX));
        assert_eq!(
            StreamId::parse_range_end("7"),
            Ok(StreamId::new(7, u64::MAX))
        );
        assert_eq!(
            StreamId::parse_range_start("bogus"),
            Err(StreamError::InvalidId)
        );
    }
}
