//! # ChunkedStore — Sharded Backend
//!
//! The log is split across fixed-span chunk files, with a global index
//! database tracking chunk status, stream lengths, and which chunk holds
//! which per-stream index range:
//!
//! ```text
//! store directory
//! ├── index.db          chunks(id, status)
//! │                     streams(id, version)            incl. the $all row
//! │                     chunk_streams(chunk_id, stream_id, min_index, max_index)
//! ├── 0000000000.db     events rows with store_index 0 .. chunk_size-1
//! ├── 0000000001.db     events rows with store_index chunk_size .. 2*chunk_size-1
//! └── ...
//! ```
//!
//! The chunk holding `store_index = k` has `id = k / chunk_size`. At most one
//! chunk is `active`; when an append exhausts its capacity the chunk is
//! marked `complete` and the next one becomes active.
//!
//! Readers plan across chunks: per-stream requests resolve the right chunk
//! through `chunk_streams`, global requests compute it from the position, and
//! either kind keeps pulling from consecutive chunks until the page is full
//! or the log runs out.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::pubsub::Publisher;
use crate::record::{partition_by_origin_stream, Record, RecordStream, Records, ALL};
use crate::schema;
use crate::store::{empty_slice, finish_slice, spawn_load, Dsn, Slice, SliceFn, Store, TOPIC_APPEND};
use crate::subscription::Subscription;

// =============================================================================
// Defaults & Schema
// =============================================================================

const DEFAULT_BATCH_SIZE: u64 = 50;
const DEFAULT_CHUNK_SIZE: u64 = 1_000_000;

const CREATE_INDEX_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chunks (
    id     INTEGER NOT NULL,
    status TEXT NOT NULL,
    PRIMARY KEY (id)
);

CREATE TABLE IF NOT EXISTS streams (
    id      TEXT,
    version INTEGER,
    PRIMARY KEY (id)
);

CREATE TABLE IF NOT EXISTS chunk_streams (
    chunk_id  INTEGER,
    stream_id TEXT,
    min_index INTEGER,
    max_index INTEGER,
    PRIMARY KEY (chunk_id, stream_id)
);
"#;

const STATUS_ACTIVE: &str = "active";
const STATUS_COMPLETE: &str = "complete";

// =============================================================================
// ChunkedStore
// =============================================================================

/// The sharded event store backend.
///
/// DSN: `<dir>?batch-size=<n>&chunk-size=<m>` (defaults 50 and 1,000,000).
#[derive(Clone)]
pub struct ChunkedStore {
    inner: Arc<Inner>,
}

struct Inner {
    dir: PathBuf,
    batch_size: u64,
    chunk_size: u64,
    index: Mutex<Connection>,
    /// Serializes appends across chunk files and the index.
    write_lock: Mutex<()>,
    bus: Publisher,
}

/// An open handle on the active chunk during an append.
struct ChunkHandle {
    id: u64,
    conn: Connection,
}

impl ChunkedStore {
    /// Opens (creating if necessary) a chunked store in the DSN's directory.
    pub fn open(dsn: &str) -> Result<Self> {
        let parsed = Dsn::parse(dsn);
        let batch_size = parsed.get_u64("batch-size").unwrap_or(DEFAULT_BATCH_SIZE);
        let chunk_size = parsed.get_u64("chunk-size").unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 {
            return Err(Error::Config("chunk-size must be at least 1".to_string()));
        }

        let dir = PathBuf::from(&parsed.path);
        std::fs::create_dir_all(&dir)?;
        let index = Connection::open(dir.join("index.db"))?;
        schema::apply_pragmas(&index)?;
        index.execute_batch(CREATE_INDEX_SCHEMA)?;

        Ok(Self {
            inner: Arc::new(Inner {
                dir,
                batch_size,
                chunk_size,
                index: Mutex::new(index),
                write_lock: Mutex::new(()),
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
    fn lock_index(&self) -> MutexGuard<'_, Connection> {
        self.index.lock().expect("index connection poisoned")
    }

    fn version(&self, stream_id: &str) -> u64 {
        self.lock_index()
            .query_row(
                "SELECT version FROM streams WHERE id = ?1 LIMIT 1",
                [stream_id],
                |row| row.get::<_, i64>(0),
            )
            .map(|v| v as u64)
            .unwrap_or(0)
    }

    // =========================================================================
    // Read Planner
    // =========================================================================

    fn load_slice(&self, stream_id: &str, skip: u64, limit: u64) -> Result<Slice> {
        if limit == 0 {
            return Ok(empty_slice(stream_id, skip));
        }
        let mut records = Records::new();
        let mut next_skip = skip;
        // Keep stitching chunks until limit + 1 records are collected or the
        // log runs out; a chunk yielding exactly the requested count says
        // nothing about whether the range continues in the next chunk.
        while (records.len() as u64) <= limit {
            let want = limit.saturating_add(1) - records.len() as u64;
            let chunk_id = match self.resolve_chunk(stream_id, next_skip) {
                Some(id) => id,
                None => break,
            };
            let conn = match self.open_registered_chunk(chunk_id)? {
                Some(conn) => conn,
                None => break,
            };
            let page = if stream_id == ALL {
                schema::load_all_page(&conn, next_skip, want)?
            } else {
                schema::load_stream_page(&conn, stream_id, next_skip, want)?
            };
            if page.is_empty() {
                break;
            }
            next_skip += page.len() as u64;
            records.extend(page);
        }
        Ok(finish_slice(stream_id, skip, limit, records))
    }

    /// Which chunk holds the record at `skip`, if any is known to the index.
    fn resolve_chunk(&self, stream_id: &str, skip: u64) -> Option<u64> {
        if stream_id == ALL {
            return Some(skip / self.chunk_size);
        }
        self.lock_index()
            .query_row(
                "SELECT chunk_id FROM chunk_streams
                 WHERE stream_id = ?1 AND ?2 BETWEEN min_index AND max_index LIMIT 1",
                params![stream_id, skip as i64],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .ok()
            .flatten()
            .map(|v| v as u64)
    }

    /// Opens a chunk for reading, but only if the index knows about it, so
    /// probing past the end of the log does not create empty files.
    fn open_registered_chunk(&self, chunk_id: u64) -> Result<Option<Connection>> {
        let registered = self
            .lock_index()
            .query_row(
                "SELECT 1 FROM chunks WHERE id = ?1",
                [chunk_id as i64],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
            .is_some();
        if !registered {
            return Ok(None);
        }
        Ok(Some(Connection::open(self.chunk_path(chunk_id))?))
    }

    fn chunk_path(&self, chunk_id: u64) -> PathBuf {
        self.dir.join(format!("{chunk_id:010}.db"))
    }

    // =========================================================================
    // Append Path
    // =========================================================================

    fn append(&self, stream_id: &str, expected_version: u64, records: Records) -> Result<()> {
        if stream_id == ALL {
            return Err(Error::NotSupported(format!(
                "cannot append to the {ALL} stream; use a replication append"
            )));
        }
        {
            let _writer = self.write_lock.lock().expect("writer lock poisoned");

            let mut stream_version = self.version(stream_id);
            if stream_version != expected_version {
                return Err(Error::Conflict {
                    stream: stream_id.to_string(),
                    expected: expected_version,
                    actual: stream_version,
                });
            }
            let store_version = self.version(ALL);

            let mut rows = Records::with_capacity(records.len());
            for mut record in records {
                record.stream_id = stream_id.to_string();
                record.stream_index = stream_version;
                record.origin_stream_id = stream_id.to_string();
                record.origin_stream_index = stream_version;
                stream_version += 1;
                if record.recorded_on.is_none() {
                    record.recorded_on = Some(Utc::now());
                }
                rows.push(record);
            }
            self.write_rows(&rows, store_version)?;
        }
        self.bus.publish(TOPIC_APPEND, stream_id);
        Ok(())
    }

    fn append_all(&self, expected_version: u64, records: Records) -> Result<()> {
        {
            let _writer = self.write_lock.lock().expect("writer lock poisoned");

            let store_version = self.version(ALL);
            if store_version != expected_version {
                return Err(Error::Conflict {
                    stream: ALL.to_string(),
                    expected: expected_version,
                    actual: store_version,
                });
            }

            // Rewrite to the origin view; chunk rows always store origin
            // coordinates, the $all view is synthesized on read.
            let mut rows = Records::with_capacity(records.len());
            for record in &records {
                let mut row = record.clone();
                row.stream_id = record.origin_stream_id.clone();
                row.stream_index = record.origin_stream_index;
                if row.recorded_on.is_none() {
                    row.recorded_on = Some(Utc::now());
                }
                rows.push(row);
            }
            self.write_rows(&rows, store_version)?;
        }
        for group in partition_by_origin_stream(&records) {
            self.bus.publish(TOPIC_APPEND, &group[0].stream_id);
        }
        Ok(())
    }

    /// Writes assigned rows across chunks, rotating on capacity, updating the
    /// index after each chunk transaction. Caller holds the writer lock.
    fn write_rows(&self, rows: &[Record], mut store_version: u64) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut chunk = self.active_chunk()?;
        let mut rest = rows;
        while !rest.is_empty() {
            let capacity = self.remaining_capacity(&chunk);
            if capacity == 0 {
                tracing::info!(chunk = chunk.id, "chunk full, rotating");
                chunk = self.advance_chunk(chunk.id)?;
                continue;
            }
            let take = rest.len().min(capacity as usize);
            let (batch, tail) = rest.split_at(take);
            rest = tail;

            self.write_batch(&mut chunk, batch)?;
            store_version += batch.len() as u64;
            self.update_index(chunk.id, batch, store_version)?;
        }
        Ok(())
    }

    /// The currently active chunk, creating chunk 0 on first use.
    fn active_chunk(&self) -> Result<ChunkHandle> {
        let id = {
            let index = self.lock_index();
            let active: Option<i64> = index
                .query_row(
                    "SELECT id FROM chunks WHERE status = ?1 ORDER BY id DESC LIMIT 1",
                    [STATUS_ACTIVE],
                    |row| row.get(0),
                )
                .optional()?;
            match active {
                Some(id) => id as u64,
                None => {
                    index.execute(
                        "INSERT INTO chunks (id, status) VALUES (?1, ?2)",
                        params![0i64, STATUS_ACTIVE],
                    )?;
                    0
                }
            }
        };
        self.open_write_chunk(id)
    }

    /// Marks the current chunk complete and activates its successor.
    fn advance_chunk(&self, current: u64) -> Result<ChunkHandle> {
        {
            let mut index = self.lock_index();
            let tx = index.transaction()?;
            tx.execute(
                "UPDATE chunks SET status = ?1 WHERE id = ?2",
                params![STATUS_COMPLETE, current as i64],
            )?;
            tx.execute(
                "INSERT INTO chunks (id, status) VALUES (?1, ?2)",
                params![(current + 1) as i64, STATUS_ACTIVE],
            )?;
            tx.commit()?;
        }
        self.open_write_chunk(current + 1)
    }

    fn open_write_chunk(&self, id: u64) -> Result<ChunkHandle> {
        let conn = Connection::open(self.chunk_path(id))?;
        schema::apply_pragmas(&conn)?;
        schema::init_events_schema(&conn)?;
        Ok(ChunkHandle { id, conn })
    }

    /// Next store index this chunk will assign.
    fn chunk_version(&self, chunk: &ChunkHandle) -> u64 {
        let stored = schema::read_version(&chunk.conn, ALL);
        if stored == 0 {
            chunk.id * self.chunk_size
        } else {
            stored
        }
    }

    fn remaining_capacity(&self, chunk: &ChunkHandle) -> u64 {
        (chunk.id + 1) * self.chunk_size - self.chunk_version(chunk)
    }

    /// One chunk transaction: store indices continue from the chunk's own
    /// high-water mark, which capacity batching keeps aligned with the
    /// store-wide version.
    fn write_batch(&self, chunk: &mut ChunkHandle, batch: &[Record]) -> Result<()> {
        let start = self.chunk_version(chunk);
        let tx = chunk.conn.transaction()?;
        for (offset, record) in batch.iter().enumerate() {
            let recorded_on = record.recorded_on.unwrap_or_else(Utc::now);
            schema::insert_event(
                &tx,
                start + offset as u64,
                &record.stream_id,
                record.stream_index,
                recorded_on,
                record,
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// One index transaction per written batch: per-stream range rows and
    /// stream lengths, then the store-wide length.
    fn update_index(&self, chunk_id: u64, batch: &[Record], store_version: u64) -> Result<()> {
        let mut index = self.lock_index();
        let tx = index.transaction()?;
        for group in partition_by_origin_stream(batch) {
            let stream_id = &group[0].stream_id;
            let batch_min = group.first().map(|r| r.stream_index).unwrap_or(0);
            let batch_max = group.last().map(|r| r.stream_index).unwrap_or(0);

            let existing_min: Option<i64> = tx
                .query_row(
                    "SELECT min_index FROM chunk_streams
                     WHERE chunk_id = ?1 AND stream_id = ?2 LIMIT 1",
                    params![chunk_id as i64, stream_id],
                    |row| row.get(0),
                )
                .optional()?;
            let min_index = existing_min
                .map(|m| (m as u64).min(batch_min))
                .unwrap_or(batch_min);

            tx.execute(
                "INSERT OR REPLACE INTO chunk_streams (chunk_id, stream_id, min_index, max_index)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    chunk_id as i64,
                    stream_id,
                    min_index as i64,
                    batch_max as i64
                ],
            )?;
            tx.execute(
                "INSERT OR REPLACE INTO streams (id, version) VALUES (?1, ?2)",
                params![stream_id, (batch_max + 1) as i64],
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO streams (id, version) VALUES (?1, ?2)",
            params![ALL, store_version as i64],
        )?;
        tx.commit()?;
        Ok(())
    }
}

impl Store for ChunkedStore {
    fn version(&self, stream_id: &str) -> u64 {
        self.inner.version(stream_id)
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
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
