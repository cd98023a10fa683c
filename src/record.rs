//! # Record Model
//!
//! The fundamental unit of tidelog is the [`Record`]: an immutable event
//! carrying opaque JSON payload bytes and two sets of coordinates.
//!
//! ## Dual Coordinates
//!
//! Every record belongs to exactly one *origin* stream, but can be observed
//! through two views:
//!
//! ```text
//! own stream view            $all view (global order)
//! ┌──────────────────┐       ┌────────────────────────┐
//! │ stream:  "foo"   │       │ stream:  "$all"        │
//! │ index:   2       │       │ index:   17            │
//! │ origin:  "foo"/2 │       │ origin:  "foo"/2       │
//! └──────────────────┘       └────────────────────────┘
//! ```
//!
//! In its own stream, `stream_id`/`stream_index` equal the origin fields. In
//! the merged `$all` view, `stream_id` is the [`ALL`] sentinel and
//! `stream_index` is the store-wide position; the origin fields stay put, so
//! a record can always be traced back to the stream it was appended to.
//!
//! ## Payloads
//!
//! `data` and `metadata` are opaque bytes. The store never parses them; the
//! wire format embeds them verbatim as raw JSON. Producers that want typed
//! events go through the [`codec`](crate::codec).

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// =============================================================================
// Constants
// =============================================================================

/// Sentinel stream id denoting the merged, globally ordered view of every
/// stream in the store.
pub const ALL: &str = "$all";

/// Buffer size for record delivery channels. Producers block once this many
/// records are in flight, which is how consumers apply backpressure.
pub(crate) const STREAM_BUFFER: usize = 64;

// =============================================================================
// Record
// =============================================================================

/// An immutable event record.
///
/// Records are created by appending to a store and live forever. The store
/// assigns `stream_index`, the origin fields, and (when unset) `recorded_on`;
/// producers supply `id`, `record_type`, and the payloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Producer-chosen opaque identifier, useful for deduplication.
    pub id: String,

    /// The stream this view of the record belongs to; [`ALL`] in the global
    /// view.
    #[serde(rename = "stream-id", default)]
    pub stream_id: String,

    /// 0-based position of the record within `stream_id`.
    #[serde(rename = "stream-index", default)]
    pub stream_index: u64,

    /// The stream the record was originally appended to.
    #[serde(rename = "origin-stream-id", default)]
    pub origin_stream_id: String,

    /// Position within the origin stream.
    #[serde(rename = "origin-stream-index", default)]
    pub origin_stream_index: u64,

    /// UTC timestamp assigned at append time. `None` on records that have not
    /// been stored yet.
    #[serde(
        rename = "recorded-on",
        default,
        skip_serializing_if = "Option::is_none",
        with = "sortable_time"
    )]
    pub recorded_on: Option<DateTime<Utc>>,

    /// Symbolic event type name, registered with the codec layer.
    #[serde(rename = "type", default)]
    pub record_type: String,

    /// Opaque event payload, treated as JSON bytes.
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "raw_json")]
    pub data: Vec<u8>,

    /// Opaque event metadata, treated as JSON bytes.
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "raw_json")]
    pub metadata: Vec<u8>,
}

impl Record {
    /// Creates an unstored record with an id, a type name, and a payload.
    pub fn new(
        id: impl Into<String>,
        record_type: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: id.into(),
            record_type: record_type.into(),
            data: data.into(),
            ..Self::default()
        }
    }

    /// Attaches metadata to this record (builder pattern).
    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = metadata.into();
        self
    }

    /// Pins the recorded-on timestamp instead of letting the store assign one.
    pub fn with_recorded_on(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_on = Some(at);
        self
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.stream_id, self.stream_index, self.id)
    }
}

/// An ordered batch of records.
pub type Records = Vec<Record>;

// =============================================================================
// Timestamp Format
// =============================================================================

/// Formats a timestamp as `YYYY-MM-DDTHH:MM:SS.nnnnnnnnnZ`.
///
/// The fractional part has a fixed width of nine digits so that the string
/// representation sorts lexicographically in time order, which the storage
/// layer relies on.
pub(crate) fn format_recorded_on(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parses any RFC 3339 variant back into a UTC timestamp.
pub(crate) fn parse_recorded_on(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Serde adapter for the sortable timestamp string representation.
mod sortable_time {
    use chrono::{DateTime, Utc};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(at: &Option<DateTime<Utc>>, ser: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match at {
            Some(t) => ser.serialize_str(&super::format_recorded_on(*t)),
            None => ser.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(de: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(de)?;
        match raw {
            None => Ok(None),
            Some(s) if s.is_empty() => Ok(None),
            Some(s) => super::parse_recorded_on(&s)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid timestamp: {s}"))),
        }
    }
}

/// Serde adapter embedding payload bytes as raw JSON on the wire.
///
/// Serialization writes the stored bytes through as-is (they must be valid
/// JSON); deserialization goes through `serde_json::Value`, so it works from
/// both text and pre-parsed documents and re-encodes the payload compactly.
mod raw_json {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use serde_json::value::RawValue;
    use serde_json::Value;

    pub fn serialize<S>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| S::Error::custom("payload is not valid UTF-8"))?;
        let raw = RawValue::from_string(text.to_owned())
            .map_err(|_| S::Error::custom("payload is not valid JSON"))?;
        raw.serialize(ser)
    }

    pub fn deserialize<'de, D>(de: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<Value> = Option::deserialize(de)?;
        match value {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(value) => serde_json::to_vec(&value).map_err(D::Error::custom),
        }
    }
}

// =============================================================================
// Record Streams
// =============================================================================

/// A lazy, ordered sequence of records.
///
/// Backed by a bounded channel: the producing side runs on its own thread or
/// task and blocks when the consumer falls behind. The stream ends when the
/// producer is done or the producing side was cancelled; in both cases
/// [`next`](RecordStream::next) returns `None`.
///
/// Dropping the stream cancels the producer at its next send.
pub struct RecordStream {
    rx: mpsc::Receiver<Record>,
}

impl RecordStream {
    /// Creates a delivery channel pair for a producer.
    pub(crate) fn channel(capacity: usize) -> (mpsc::Sender<Record>, RecordStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, RecordStream { rx })
    }

    /// Creates a pre-filled stream over an in-memory batch.
    pub fn of(records: Records) -> RecordStream {
        let (tx, stream) = Self::channel(records.len());
        for r in records {
            // Capacity covers the whole batch, so this cannot fail.
            let _ = tx.try_send(r);
        }
        stream
    }

    /// Receives the next record, or `None` when the stream has ended.
    pub async fn next(&mut self) -> Option<Record> {
        self.rx.recv().await
    }

    /// Blocking variant of [`next`](RecordStream::next) for synchronous
    /// consumers. Must not be called from within an async runtime.
    pub fn blocking_next(&mut self) -> Option<Record> {
        self.rx.blocking_recv()
    }

    /// Drains the stream into a batch.
    pub async fn collect(mut self) -> Records {
        let mut out = Records::new();
        while let Some(r) = self.next().await {
            out.push(r);
        }
        out
    }

    /// Blocking variant of [`collect`](RecordStream::collect).
    pub fn blocking_collect(mut self) -> Records {
        let mut out = Records::new();
        while let Some(r) = self.blocking_next() {
            out.push(r);
        }
        out
    }
}

impl fmt::Debug for RecordStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordStream").finish_non_exhaustive()
    }
}

// =============================================================================
// Partitioning
// =============================================================================

/// Splits a `$all`-view batch into per-origin-stream groups, rewriting each
/// record back to its origin view.
///
/// Groups appear in order of first appearance and records keep their relative
/// order, so replicating group by group preserves both per-stream and global
/// ordering.
pub fn partition_by_origin_stream(records: &[Record]) -> Vec<Records> {
    let mut groups: Vec<(String, Records)> = Vec::new();
    for r in records {
        let origin = r.origin_stream_id.clone();
        let mut rewritten = r.clone();
        rewritten.stream_id = origin.clone();
        rewritten.stream_index = r.origin_stream_index;
        match groups.iter_mut().find(|(id, _)| *id == origin) {
            Some((_, group)) => group.push(rewritten),
            None => groups.push((origin, vec![rewritten])),
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}

// =============================================================================
// Tests
// =============================================================================
