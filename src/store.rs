//! # Store Contract
//!
//! Every backend exposes the same surface: versioned streams, lazy range
//! reads, optimistic appends, and catch-up subscriptions. The two
//! implementations are [`BasicStore`](crate::basic::BasicStore) (one SQLite
//! file) and [`ChunkedStore`](crate::chunked::ChunkedStore) (a directory of
//! fixed-span shards behind a global index).
//!
//! ## Two Append Modes
//!
//! Ordinary [`append`](Store::append) assigns all coordinates and refuses the
//! `$all` sentinel. Replication [`append_all`](Store::append_all) writes
//! records into the global view verbatim, preserving their origin
//! coordinates. They are distinct entry points on purpose; a mode flag on one
//! call would make every caller carry the other caller's invariants.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use serde::{Deserialize, Serialize};

use crate::basic::BasicStore;
use crate::chunked::ChunkedStore;
use crate::error::Result;
use crate::record::{RecordStream, Records, STREAM_BUFFER};
use crate::subscription::Subscription;

// =============================================================================
// Constants
// =============================================================================

/// Topic published after every committed append; the payload is the origin
/// stream id. Exactly one event per append call, not one per record.
pub const TOPIC_APPEND: &str = "append";

// =============================================================================
// Slice
// =============================================================================

/// A bounded page of records with paging metadata.
///
/// `next` is the index at which a reader should resume; `is_end_of_stream`
/// is true iff no more records were available at read time. A caller that
/// receives fewer than `limit` records together with `is_end_of_stream` has
/// observed the entire stream up to that instant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Slice {
    #[serde(rename = "stream-id")]
    pub stream_id: String,
    pub from: u64,
    pub next: u64,
    #[serde(default)]
    pub records: Records,
    #[serde(rename = "is-end-of-stream")]
    pub is_end_of_stream: bool,
}

// =============================================================================
// Store Trait
// =============================================================================

/// The operations every event-store backend provides.
///
/// Implementations are cheap to clone (an `Arc` around shared state) and safe
/// to use from many tasks; each store serializes its writers internally.
pub trait Store: Send + Sync {
    /// Current length of a stream: `last_index + 1`, or 0 for an empty or
    /// unknown stream. `version(ALL)` is the total number of records stored.
    /// Never fails.
    fn version(&self, stream_id: &str) -> u64;

    /// Lazy sequence of all records of a stream, in order.
    fn load(&self, stream_id: &str) -> RecordStream {
        self.load_from(stream_id, 0)
    }

    /// Lazy sequence starting at `stream_index == skip`.
    fn load_from(&self, stream_id: &str, skip: u64) -> RecordStream;

    /// One bounded page of a stream.
    fn load_slice(&self, stream_id: &str, skip: u64, limit: u64) -> Result<Slice>;

    /// Appends records to a stream under optimistic concurrency control.
    ///
    /// Fails with [`Error::Conflict`](crate::Error::Conflict) when
    /// `expected_version` does not match the stream's current version, and
    /// with [`Error::NotSupported`](crate::Error::NotSupported) when
    /// `stream_id` is the `$all` sentinel.
    fn append(&self, stream_id: &str, expected_version: u64, records: Records) -> Result<()>;

    /// Replication append into the global view.
    ///
    /// Records must carry their origin coordinates; they are written
    /// verbatim. The optimistic check runs against `version(ALL)`. Publishes
    /// one append notification per distinct origin stream touched.
    fn append_all(&self, expected_version: u64, records: Records) -> Result<()>;

    /// Subscribes to a stream from position 0.
    fn subscribe_to_stream(&self, stream_id: &str) -> Subscription {
        self.subscribe_to_stream_from(stream_id, 0)
    }

    /// Subscribes to a stream from the given position.
    fn subscribe_to_stream_from(&self, stream_id: &str, version: u64) -> Subscription;

    /// Subscribes to a stream from its current version, observing only
    /// records appended after this call.
    fn subscribe_to_stream_from_current(&self, stream_id: &str) -> Subscription {
        self.subscribe_to_stream_from(stream_id, self.version(stream_id))
    }

    /// Releases the store. Connections held by open record streams close as
    /// those streams finish.
    fn close(&self) -> Result<()>;
}

// =============================================================================
// Shared Read Plumbing
// =============================================================================

/// An empty page: nothing available at `skip`, resume from `skip`.
pub(crate) fn empty_slice(stream_id: &str, skip: u64) -> Slice {
    Slice {
        stream_id: stream_id.to_string(),
        from: skip,
        next: skip,
        records: Records::new(),
        is_end_of_stream: true,
    }
}

/// Applies the `limit + 1` pagination contract to a fetched batch: on
/// `limit + 1` results the extra record is dropped and the page is marked as
/// having more; otherwise the page is the end of the stream.
pub(crate) fn finish_slice(stream_id: &str, skip: u64, limit: u64, mut records: Records) -> Slice {
    let fetched = records.len() as u64;
    let is_end_of_stream = fetched <= limit;
    let next = if is_end_of_stream {
        skip + fetched
    } else {
        records.truncate(limit as usize);
        records.last().map(|r| r.stream_index + 1).unwrap_or(skip)
    };
    Slice {
        stream_id: stream_id.to_string(),
        from: skip,
        next,
        records,
        is_end_of_stream,
    }
}

/// Page loader shared between lazy streams and subscriptions:
/// `(stream_id, skip, limit) -> Slice`.
pub(crate) type SliceFn = Arc<dyn Fn(&str, u64, u64) -> Result<Slice> + Send + Sync>;

/// Spawns the producer behind [`Store::load_from`].
///
/// A dedicated thread pages through the stream and forwards records over a
/// bounded channel; it stops at end of stream, on a read error, or when the
/// consumer drops the stream.
pub(crate) fn spawn_load(
    load_slice: SliceFn,
    stream_id: String,
    skip: u64,
    batch_size: u64,
) -> RecordStream {
    let (tx, stream) = RecordStream::channel(STREAM_BUFFER);
    thread::spawn(move || {
        let mut next = skip;
        loop {
            let slice = match load_slice(&stream_id, next, batch_size) {
                Ok(slice) => slice,
                Err(err) => {
                    tracing::debug!(stream = %stream_id, %err, "load aborted");
                    return;
                }
            };
            for record in slice.records {
                if tx.blocking_send(record).is_err() {
                    // Consumer went away.
                    return;
                }
            }
            if slice.is_end_of_stream {
                return;
            }
            next = slice.next;
        }
    });
    stream
}

// =============================================================================
// Data Source Names
// =============================================================================

/// A parsed data source name: a path plus `name=value` options.
///
/// `path/to/store?batch-size=50&chunk-size=1000000`
#[derive(Debug, Clone)]
pub(crate) struct Dsn {
    pub path: String,
    params: Vec<(String, String)>,
}

impl Dsn {
    pub fn parse(raw: &str) -> Dsn {
        let (path, query) = match raw.split_once('?') {
            Some((path, query)) => (path, query),
            None => (raw, ""),
        };
        let params = query
            .split('&')
            .filter_map(|pair| {
                let (name, value) = pair.split_once('=')?;
                Some((name.to_string(), value.to_string()))
            })
            .collect();
        Dsn {
            path: path.to_string(),
            params,
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        self.get(name).and_then(|v| v.parse().ok())
    }
}

/// Opens a store for a data source name.
///
/// A DSN whose path is an existing directory, or that carries `chunk-size` /
/// `batch-size` options, opens a [`ChunkedStore`]; anything else opens a
/// [`BasicStore`] on a single database file.
pub fn open(dsn: &str) -> Result<Arc<dyn Store>> {
    let parsed = Dsn::parse(dsn);
    let chunked = Path::new(&parsed.path).is_dir()
        || parsed.get("chunk-size").is_some()
        || parsed.get("batch-size").is_some();
    if chunked {
        Ok(Arc::new(ChunkedStore::open(dsn)?))
    } else {
        Ok(Arc::new(BasicStore::open(dsn)?))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsn_without_query() {
        let dsn = Dsn::parse("/var/data/events.db");
        assert_eq!(dsn.path, "/var/data/events.db");
        assert!(dsn.get("batch-size").is_none());
    }

    #[test]
    fn dsn_with_options() {
        let dsn = Dsn::parse("/var/data/events?batch-size=10&chunk-size=2");
        assert_eq!(dsn.path, "/var/data/events");
        assert_eq!(dsn.get_u64("batch-size"), Some(10));
        assert_eq!(dsn.get_u64("chunk-size"), Some(2));
    }

    #[test]
    fn dsn_ignores_malformed_pairs() {
        let dsn = Dsn::parse("store?garbage&batch-size=7");
        assert_eq!(dsn.get_u64("batch-size"), Some(7));
        assert!(dsn.get("garbage").is_none());
    }

    #[test]
    fn slice_wire_names() {
        let slice = Slice {
            stream_id: "foo".to_string(),
            from: 0,
            next: 1,
            records: Vec::new(),
            is_end_of_stream: true,
        };
        let json = serde_json::to_value(&slice).unwrap();
        assert_eq!(json["stream-id"], "foo");
        assert_eq!(json["is-end-of-stream"], true);
    }
}
