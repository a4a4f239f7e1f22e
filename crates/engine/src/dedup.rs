//! Content-hash duplicate suppression.
//!
//! Each stream keeps the set of hashes it has accepted and the next log
//! sequence number. Admission is computed first and committed only after the
//! accepted body is persisted, so a failed write leaves the seen-set as it was.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::hashing::content_hash;
use crate::{CorrelationId, Error, Result};

/// A message body split into independently deduplicated records.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Records {
    /// Leading part repeated in every message and never deduplicated
    pub header: Option<Vec<u8>>,
    /// Records in body order
    pub records: Vec<Vec<u8>>,
}

/// Splits bodies into records and reassembles filtered ones.
pub trait RecordCodec: Send + Sync + fmt::Debug {
    /// Split a body into records.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` if the body does not have the expected shape.
    fn split(&self, body: &[u8]) -> Result<Records>;

    /// Reassemble a body from records.
    fn join(&self, records: &Records) -> Vec<u8>;
}

/// Bodies are JSON arrays; each element is a record.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonArrayCodec;

impl RecordCodec for JsonArrayCodec {
    fn split(&self, body: &[u8]) -> Result<Records> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| Error::invalid_record(e.to_string()))?;
        let Value::Array(items) = value else {
            return Err(Error::invalid_record("expected a JSON array"));
        };
        let records = items
            .iter()
            .map(|item| serde_json::to_vec(item).map_err(|e| Error::serialization(e.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Records {
            header: None,
            records,
        })
    }

    fn join(&self, records: &Records) -> Vec<u8> {
        let mut out = Vec::with_capacity(records.records.iter().map(Vec::len).sum::<usize>().saturating_add(2));
        out.push(b'[');
        for (i, record) in records.records.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            out.extend_from_slice(record);
        }
        out.push(b']');
        out
    }
}

/// Bodies are newline-separated lines, optionally led by a header line
/// (CSV chunks repeat their header in every message).
#[derive(Debug, Clone, Copy, Default)]
pub struct LinesCodec {
    /// Whether the first line is a header
    pub header: bool,
}

impl LinesCodec {
    /// Lines with a leading header line.
    #[must_use]
    pub const fn with_header() -> Self {
        Self { header: true }
    }
}

impl RecordCodec for LinesCodec {
    fn split(&self, body: &[u8]) -> Result<Records> {
        let mut lines = body
            .split(|b| *b == b'\n')
            .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
            .filter(|line| !line.is_empty())
            .map(<[u8]>::to_vec);
        let header = if self.header { lines.next() } else { None };
        Ok(Records {
            header,
            records: lines.collect(),
        })
    }

    fn join(&self, records: &Records) -> Vec<u8> {
        let mut out = Vec::new();
        for line in records.header.iter().chain(records.records.iter()) {
            out.extend_from_slice(line);
            out.push(b'\n');
        }
        out
    }
}

/// Deduplication granularity of a stage.
#[derive(Debug, Clone, Default)]
pub enum DedupMode {
    /// Pass every message through; nothing is logged.
    Off,
    /// Hash whole bodies.
    #[default]
    Message,
    /// Hash individual records.
    Records(Arc<dyn RecordCodec>),
}

impl DedupMode {
    /// Record-level dedup with `codec`.
    pub fn records(codec: impl RecordCodec + 'static) -> Self {
        Self::Records(Arc::new(codec))
    }

    /// Whether accepted messages are logged and deduplicated.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        !matches!(self, Self::Off)
    }
}

/// Outcome of offering a body to the deduplicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Dedup is off; deliver as is.
    Passthrough(Vec<u8>),
    /// New content to persist at `seq`, then commit.
    Accept {
        /// Body to log and deliver (filtered in record mode)
        body: Vec<u8>,
        /// Log position
        seq: u64,
        /// Hashes to commit once persisted
        hashes: Vec<String>,
    },
    /// Nothing new; acknowledge and drop.
    Duplicate {
        /// Number of records (or 1 for whole messages) that were already seen
        dropped: usize,
    },
}

#[derive(Debug, Default)]
struct StreamLog {
    seen: HashSet<String>,
    next_seq: u64,
}

/// Per-stream seen-sets and log sequence counters.
#[derive(Debug, Default)]
pub struct Deduplicator {
    mode: DedupMode,
    streams: HashMap<CorrelationId, StreamLog>,
}

impl Deduplicator {
    /// Create a deduplicator for `mode`.
    #[must_use]
    pub fn new(mode: DedupMode) -> Self {
        Self {
            mode,
            streams: HashMap::new(),
        }
    }

    /// Configured mode.
    #[must_use]
    pub const fn mode(&self) -> &DedupMode {
        &self.mode
    }

    /// Decide what to do with `body`. Does not change state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` if record mode cannot split the body.
    pub fn admit(&self, correlation_id: &CorrelationId, body: &[u8]) -> Result<Admission> {
        let stream = self.streams.get(correlation_id);
        let seen = |hash: &str| stream.is_some_and(|s| s.seen.contains(hash));
        let seq = stream.map_or(0, |s| s.next_seq);

        match &self.mode {
            DedupMode::Off => Ok(Admission::Passthrough(body.to_vec())),
            DedupMode::Message => {
                let hash = content_hash(body);
                if seen(&hash) {
                    Ok(Admission::Duplicate { dropped: 1 })
                } else {
                    Ok(Admission::Accept {
                        body: body.to_vec(),
                        seq,
                        hashes: vec![hash],
                    })
                }
            }
            DedupMode::Records(codec) => {
                let split = codec.split(body)?;
                let total = split.records.len();
                let mut hashes = Vec::new();
                let mut fresh = Vec::new();
                for record in split.records {
                    let hash = content_hash(&record);
                    if !seen(&hash) && !hashes.contains(&hash) {
                        hashes.push(hash);
                        fresh.push(record);
                    }
                }
                if fresh.is_empty() {
                    return Ok(Admission::Duplicate { dropped: total });
                }
                let filtered = Records {
                    header: split.header,
                    records: fresh,
                };
                Ok(Admission::Accept {
                    body: codec.join(&filtered),
                    seq,
                    hashes,
                })
            }
        }
    }

    /// Record an accepted body once it is durably logged.
    pub fn commit(&mut self, correlation_id: &CorrelationId, hashes: Vec<String>) {
        let stream = self.streams.entry(correlation_id.clone()).or_default();
        stream.seen.extend(hashes);
        stream.next_seq = stream.next_seq.saturating_add(1);
    }

    /// Rebuild state from a logged body during replay.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRecord` if record mode cannot split the body.
    pub fn restore(&mut self, correlation_id: &CorrelationId, body: &[u8]) -> Result<()> {
        let hashes = match &self.mode {
            DedupMode::Off => Vec::new(),
            DedupMode::Message => vec![content_hash(body)],
            DedupMode::Records(codec) => codec
                .split(body)?
                .records
                .iter()
                .map(|r| content_hash(r))
                .collect(),
        };
        self.commit(correlation_id, hashes);
        Ok(())
    }

    /// Whether the stream has accepted anything yet.
    #[must_use]
    pub fn is_tracking(&self, correlation_id: &CorrelationId) -> bool {
        self.streams.contains_key(correlation_id)
    }

    /// Next log position of a stream.
    #[must_use]
    pub fn next_seq(&self, correlation_id: &CorrelationId) -> u64 {
        self.streams.get(correlation_id).map_or(0, |s| s.next_seq)
    }

    /// Drop a terminated stream.
    pub fn forget(&mut self, correlation_id: &CorrelationId) {
        self.streams.remove(correlation_id);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use proptest::prelude::*;

    fn offer(dedup: &mut Deduplicator, cid: &CorrelationId, body: &[u8]) -> Option<Vec<u8>> {
        match dedup.admit(cid, body).expect("admit") {
            Admission::Accept { body, hashes, .. } => {
                dedup.commit(cid, hashes);
                Some(body)
            }
            Admission::Passthrough(body) => Some(body),
            Admission::Duplicate { .. } => None,
        }
    }

    #[test]
    fn whole_message_duplicates_are_dropped() {
        let mut dedup = Deduplicator::new(DedupMode::Message);
        let cid = CorrelationId::new("s1");
        assert!(offer(&mut dedup, &cid, b"a").is_some());
        assert!(offer(&mut dedup, &cid, b"a").is_none());
        assert!(offer(&mut dedup, &cid, b"b").is_some());
        assert_eq!(dedup.next_seq(&cid), 2);
    }

    #[test]
    fn streams_are_independent() {
        let mut dedup = Deduplicator::new(DedupMode::Message);
        assert!(offer(&mut dedup, &CorrelationId::new("s1"), b"a").is_some());
        assert!(offer(&mut dedup, &CorrelationId::new("s2"), b"a").is_some());
    }

    #[test]
    fn admit_without_commit_changes_nothing() {
        let dedup = Deduplicator::new(DedupMode::Message);
        let cid = CorrelationId::new("s1");
        let first = dedup.admit(&cid, b"a").unwrap();
        let second = dedup.admit(&cid, b"a").unwrap();
        assert_eq!(first, second);
        assert!(!dedup.is_tracking(&cid));
    }

    #[test]
    fn json_records_are_filtered_individually() {
        let mut dedup = Deduplicator::new(DedupMode::records(JsonArrayCodec));
        let cid = CorrelationId::new("s1");

        let first = offer(&mut dedup, &cid, br#"[{"id":1},{"id":2}]"#).unwrap();
        assert_eq!(first, br#"[{"id":1},{"id":2}]"#.to_vec());

        let second = offer(&mut dedup, &cid, br#"[{"id":2},{"id":3},{"id":3}]"#).unwrap();
        assert_eq!(second, br#"[{"id":3}]"#.to_vec());

        assert!(offer(&mut dedup, &cid, br#"[{"id":1}]"#).is_none());
    }

    #[test]
    fn csv_header_survives_filtering() {
        let mut dedup = Deduplicator::new(DedupMode::records(LinesCodec::with_header()));
        let cid = CorrelationId::new("s1");

        assert!(offer(&mut dedup, &cid, b"Id,Score\n1,10\n2,20\n").is_some());
        let filtered = offer(&mut dedup, &cid, b"Id,Score\n2,20\n3,30\n").unwrap();
        assert_eq!(filtered, b"Id,Score\n3,30\n".to_vec());
        assert!(offer(&mut dedup, &cid, b"Id,Score\r\n1,10\r\n").is_none());
    }

    #[test]
    fn malformed_json_is_invalid_record() {
        let dedup = Deduplicator::new(DedupMode::records(JsonArrayCodec));
        let result = dedup.admit(&CorrelationId::new("s1"), b"{\"not\":\"array\"}");
        assert!(matches!(result, Err(Error::InvalidRecord { .. })));
    }

    #[test]
    fn restore_rebuilds_seen_set_and_sequence() {
        let mut dedup = Deduplicator::new(DedupMode::records(JsonArrayCodec));
        let cid = CorrelationId::new("s1");
        dedup.restore(&cid, b"[1,2]").unwrap();
        dedup.restore(&cid, b"[3]").unwrap();

        assert_eq!(dedup.next_seq(&cid), 2);
        assert!(offer(&mut dedup, &cid, b"[2,3]").is_none());
        assert!(matches!(
            dedup.admit(&cid, b"[4]").unwrap(),
            Admission::Accept { seq: 2, .. }
        ));
    }

    #[test]
    fn off_mode_passes_duplicates() {
        let mut dedup = Deduplicator::new(DedupMode::Off);
        let cid = CorrelationId::new("s1");
        assert!(offer(&mut dedup, &cid, b"a").is_some());
        assert!(offer(&mut dedup, &cid, b"a").is_some());
    }

    proptest! {
        #[test]
        fn callback_sees_first_arrivals_in_order(bodies in proptest::collection::vec(0u8..6, 0..40)) {
            let mut dedup = Deduplicator::new(DedupMode::Message);
            let cid = CorrelationId::new("s1");

            let delivered: Vec<u8> = bodies
                .iter()
                .filter_map(|b| offer(&mut dedup, &cid, &[*b]).map(|body| body[0]))
                .collect();

            let mut expected = Vec::new();
            for b in &bodies {
                if !expected.contains(b) {
                    expected.push(*b);
                }
            }
            prop_assert_eq!(delivered, expected);
        }
    }
}
