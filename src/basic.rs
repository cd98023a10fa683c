//! # BasicStore — Single-File Backend
//!
//! Every record lives in one SQLite file, in the single `events` table of
//! [`schema`](crate::schema). One connection, opened in WAL mode, is shared
//! behind a mutex; that mutex is also the writer lock, so appends are
//! serialized across the process and readers always observe committed state.
//!
//! Ordinary appends assign coordinates inside the transaction that persists
//! them; the optimistic version check runs inside the same transaction, so a
//! conflicting writer can never slip in between check and insert.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::pubsub::Publisher;
use crate::record::{partition_by_origin_stream, RecordStream, Records, ALL};
use crate::schema;
use crate::store::{empty_slice, finish_slice, spawn_load, Dsn, Slice, SliceFn, Store, TOPIC_APPEND};
use crate::subscription::Subscription;

/// Default page size for lazy streams and subscriptions.
const DEFAULT_BATCH_SIZE: u64 = 50;

// =============================================================================
// BasicStore
// =============================================================================

/// The single-file event store backend.
///
/// Cheap to clone; all clones share the connection and the append
/// notification bus.
#[derive(Clone)]
pub struct BasicStore {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Mutex<Connection>,
    batch_size: u64,
    bus: Publisher,
}

impl BasicStore {
    /// Opens (creating if necessary) a store at the path named by the DSN.
    ///
    /// Parent directories are created. The special path `:memory:` opens an
    /// ephemeral in-memory store.
    pub fn open(dsn: &str) -> Result<Self> {
        let path = Dsn::parse(dsn).path;
        if path == ":memory:" {
            return Self::open_in_memory();
        }
        if let Some(dir) = Path::new(&path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        Self::with_connection(Connection::open(&path)?)
    }

    /// Opens an ephemeral in-memory store, primarily for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        schema::apply_pragmas(&conn)?;
        schema::init_events_schema(&conn)?;
        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                batch_size: DEFAULT_BATCH_SIZE,
                bus: Publisher::new(),
            }),
        })
    }

    fn slice_fn(&self) -> SliceFn {
        let inner = self.inner.clone();
        Arc::new(move |stream_id, skip, limit| inner.load_slice(stream_id, skip, limit))
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection poisoned")
    }

    fn load_slice(&self, stream_id: &str, skip: u64, limit: u64) -> Result<Slice> {
        if limit == 0 {
            return Ok(empty_slice(stream_id, skip));
        }
        let conn = self.lock();
        let fetch = limit.saturating_add(1);
        let records = if stream_id == ALL {
            schema::load_all_page(&conn, skip, fetch)?
        } else {
            schema::load_stream_page(&conn, stream_id, skip, fetch)?
        };
        Ok(finish_slice(stream_id, skip, limit, records))
    }

    fn append(&self, stream_id: &str, expected_version: u64, records: Records) -> Result<()> {
        if stream_id == ALL {
            return Err(Error::NotSupported(format!(
                "cannot append to the {ALL} stream; use a replication append"
            )));
        }
        {
            let mut conn = self.lock();
            let tx = conn.transaction()?;

            let mut stream_version = schema::read_version(&tx, stream_id);
            if stream_version != expected_version {
                return Err(Error::Conflict {
                    stream: stream_id.to_string(),
                    expected: expected_version,
                    actual: stream_version,
                });
            }
            let mut store_version = schema::read_version(&tx, ALL);

            for record in &records {
                let store_index = store_version;
                store_version += 1;
                let stream_index = stream_version;
                stream_version += 1;
                let recorded_on = record.recorded_on.unwrap_or_else(Utc::now);
                schema::insert_event(&tx, store_index, stream_id, stream_index, recorded_on, record)?;
            }
            tx.commit()?;
        }
        self.bus.publish(TOPIC_APPEND, stream_id);
        Ok(())
    }

    fn append_all(&self, expected_version: u64, records: Records) -> Result<()> {
        {
            let mut conn = self.lock();
            let tx = conn.transaction()?;

            let mut store_version = schema::read_version(&tx, ALL);
            if store_version != expected_version {
                return Err(Error::Conflict {
                    stream: ALL.to_string(),
                    expected: expected_version,
                    actual: store_version,
                });
            }

            for record in &records {
                let store_index = store_version;
                store_version += 1;
                let recorded_on = record.recorded_on.unwrap_or_else(Utc::now);
                schema::insert_event(
                    &tx,
                    store_index,
                    &record.origin_stream_id,
                    record.origin_stream_index,
                    recorded_on,
                    record,
                )?;
            }
            tx.commit()?;
        }
        for group in partition_by_origin_stream(&records) {
            self.bus.publish(TOPIC_APPEND, &group[0].stream_id);
        }
        Ok(())
    }
}

impl Store for BasicStore {
    fn version(&self, stream_id: &str) -> u64 {
        schema::read_version(&self.inner.lock(), stream_id)
    }

    fn load_from(&self, stream_id: &str, skip: u64) -> RecordStream {
        spawn_load(
            self.slice_fn(),
            stream_id.to_string(),
            skip,
            self.inner.batch_size,
        )
    }

    fn load_slice(&self, stream_id: &str, skip: u64, limit: u64) -> Result<Slice> {
        self.inner.load_slice(stream_id, skip, limit)
    }

    fn append(&self, stream_id: &str, expected_version: u64, records: Records) -> Result<()> {
        self.inner.append(stream_id, expected_version, records)
    }

    fn append_all(&self, expected_version: u64, records: Records) -> Result<()> {
        self.inner.append_all(expected_version, records)
    }

    fn subscribe_to_stream_from(&self, stream_id: &str, version: u64) -> Subscription {
        Subscription::new(
            stream_id,
            version,
            self.inner.batch_size,
            self.slice_fn(),
            self.inner.bus.clone(),
        )
    }

    fn close(&self) -> Result<()> {
        // The connection closes when the last clone and open stream drop.
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{format_recorded_on, Record};

    fn test_records(ids: &[&str]) -> Records {
        ids.iter()
            .map(|id| Record::new(*id, "test", b"{}".to_vec()))
            .collect()
    }

    #[test]
    fn version_of_unknown_stream_is_zero() {
        let store = BasicStore::open_in_memory().unwrap();
        assert_eq!(store.version("nope"), 0);
        assert_eq!(store.version(ALL), 0);
    }

    #[test]
    fn append_assigns_contiguous_indices() {
        let store = BasicStore::open_in_memory().unwrap();
        store.append("foo", 0, test_records(&["1"])).unwrap();
        store.append("foo", 1, test_records(&["2", "3"])).unwrap();
        assert_eq!(store.version("foo"), 3);

        let slice = store.load_slice("foo", 0, 10).unwrap();
        assert!(slice.is_end_of_stream);
        assert_eq!(slice.next, 3);
        let indices: Vec<u64> = slice.records.iter().map(|r| r.stream_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        for r in &slice.records {
            assert_eq!(r.stream_id, r.origin_stream_id);
            assert_eq!(r.stream_index, r.origin_stream_index);
            assert!(r.recorded_on.is_some());
        }
    }

    #[test]
    fn version_mismatch_is_a_conflict_and_changes_nothing() {
        let store = BasicStore::open_in_memory().unwrap();
        store.append("foo", 0, test_records(&["1"])).unwrap();

        let err = store.append("foo", 0, test_records(&["2"])).unwrap_err();
        match err {
            Error::Conflict {
                stream,
                expected,
                actual,
            } => {
                assert_eq!(stream, "foo");
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected conflict, got {other}"),
        }
        assert_eq!(store.version("foo"), 1);
    }

    #[test]
    fn append_to_all_is_rejected() {
        let store = BasicStore::open_in_memory().unwrap();
        let err = store.append(ALL, 0, test_records(&["1"])).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
        assert_eq!(store.version(ALL), 0);
    }

    #[test]
    fn empty_append_is_a_noop() {
        let store = BasicStore::open_in_memory().unwrap();
        store.append("foo", 0, Records::new()).unwrap();
        assert_eq!(store.version("foo"), 0);
    }

    #[test]
    fn all_view_preserves_origin() {
        let store = BasicStore::open_in_memory().unwrap();
        store.append("foo", 0, test_records(&["1", "2"])).unwrap();
        store.append("bar", 0, test_records(&["3"])).unwrap();

        let slice = store.load_slice(ALL, 0, 10).unwrap();
        assert_eq!(slice.records.len(), 3);
        let r = &slice.records[2];
        assert_eq!(r.stream_id, ALL);
        assert_eq!(r.stream_index, 2);
        assert_eq!(r.origin_stream_id, "bar");
        assert_eq!(r.origin_stream_index, 0);
    }

    #[test]
    fn pagination_contract() {
        let store = BasicStore::open_in_memory().unwrap();
        store
            .append("foo", 0, test_records(&["1", "2", "3"]))
            .unwrap();

        let page = store.load_slice("foo", 0, 2).unwrap();
        assert_eq!(page.records.len(), 2);
        assert!(!page.is_end_of_stream);
        assert_eq!(page.next, 2);

        let rest = store.load_slice("foo", page.next, 2).unwrap();
        assert_eq!(rest.records.len(), 1);
        assert!(rest.is_end_of_stream);
        assert_eq!(rest.next, 3);

        let empty = store.load_slice("foo", 0, 0).unwrap();
        assert!(empty.records.is_empty());
        assert!(empty.is_end_of_stream);
        assert_eq!(empty.next, 0);

        let past_end = store.load_slice("foo", 9, 5).unwrap();
        assert!(past_end.records.is_empty());
        assert!(past_end.is_end_of_stream);
        assert_eq!(past_end.next, 9);
    }

    #[test]
    fn replication_append_preserves_origin_indices() {
        let source = BasicStore::open_in_memory().unwrap();
        source.append("foo", 0, test_records(&["1", "2"])).unwrap();
        source.append("bar", 0, test_records(&["3"])).unwrap();
        let all = source.load_slice(ALL, 0, 10).unwrap().records;

        let target = BasicStore::open_in_memory().unwrap();
        target.append_all(0, all.clone()).unwrap();

        assert_eq!(target.version(ALL), 3);
        assert_eq!(target.version("foo"), 2);
        assert_eq!(target.version("bar"), 1);
        assert_eq!(target.load_slice(ALL, 0, 10).unwrap().records, all);
    }

    #[test]
    fn replication_append_checks_all_version() {
        let target = BasicStore::open_in_memory().unwrap();
        let record = Record {
            origin_stream_id: "foo".to_string(),
            origin_stream_index: 0,
            stream_id: ALL.to_string(),
            stream_index: 0,
            id: "1".to_string(),
            record_type: "test".to_string(),
            ..Record::default()
        };
        let err = target.append_all(5, vec![record]).unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[test]
    fn recorded_on_survives_round_trip() {
        let store = BasicStore::open_in_memory().unwrap();
        let at = chrono::Utc::now();
        store
            .append(
                "foo",
                0,
                vec![Record::new("1", "test", b"{}".to_vec()).with_recorded_on(at)],
            )
            .unwrap();
        let read = store.load_slice("foo", 0, 1).unwrap().records[0]
            .recorded_on
            .unwrap();
        assert_eq!(format_recorded_on(read), format_recorded_on(at));
    }
}
