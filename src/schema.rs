//! # SQLite Schema
//!
//! DDL and row plumbing shared by the two backends. The single-file store
//! owns one `events` table; the chunked store stamps the same table into
//! every chunk file and keeps its own index tables on the side.
//!
//! ## The events table
//!
//! ```text
//! events
//! ┌─────────────┬──────────────────────────────────────────────┐
//! │ store_index │ global position, primary key                 │
//! │ stream_id   │ owning stream                                │
//! │ stream_index│ position within the stream (unique together  │
//! │             │ with stream_id)                              │
//! │ recorded_on │ sortable UTC timestamp text                  │
//! │ id, type    │ producer id and codec type name              │
//! │ data,       │ opaque JSON payload bytes                    │
//! │ metadata    │                                              │
//! └─────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Both orderings are served from these rows: per-stream reads filter on
//! `stream_id` and order by `stream_index`; global reads order by
//! `store_index` and synthesize the `$all` view, passing the stored
//! coordinates through as origin fields.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::record::{format_recorded_on, parse_recorded_on, Record, Records, ALL};

// =============================================================================
// DDL
// =============================================================================

pub(crate) const CREATE_EVENTS: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    store_index  INTEGER NOT NULL,
    stream_id    TEXT NOT NULL,
    stream_index INTEGER NOT NULL,
    recorded_on  TEXT NOT NULL,
    id           TEXT NOT NULL,
    type         TEXT NOT NULL,
    data         BLOB,
    metadata     BLOB,
    PRIMARY KEY (store_index)
)
"#;

/// Guards the gap-free-per-stream invariant at the storage level.
pub(crate) const CREATE_EVENTS_STREAM_INDEX: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS idx_events_stream_id_stream_index
ON events (stream_id, stream_index)
"#;

const INSERT_EVENT: &str = r#"
INSERT INTO events (store_index, stream_id, stream_index, recorded_on, id, type, data, metadata)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
"#;

// =============================================================================
// Initialization
// =============================================================================

/// Write-mode pragmas used by every database file this crate opens: WAL for
/// reader/writer concurrency, synchronous off (the client retries on
/// failure), foreign keys on.
pub(crate) fn apply_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL")?;
    conn.execute_batch("PRAGMA synchronous = OFF")?;
    conn.execute_batch("PRAGMA foreign_keys = ON")?;
    Ok(())
}

/// Creates the events table and its unique stream index. Idempotent.
pub(crate) fn init_events_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(CREATE_EVENTS)?;
    conn.execute_batch(CREATE_EVENTS_STREAM_INDEX)?;
    Ok(())
}

// =============================================================================
// Reads
// =============================================================================

/// Current length of a stream as stored in this database; 0 when unknown.
/// `$all` reads the store-wide length.
pub(crate) fn read_version(conn: &Connection, stream_id: &str) -> u64 {
    let version: rusqlite::Result<i64> = if stream_id == ALL {
        conn.query_row(
            "SELECT store_index + 1 FROM events ORDER BY store_index DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
    } else {
        conn.query_row(
            "SELECT stream_index + 1 FROM events WHERE stream_id = ?1
             ORDER BY stream_index DESC LIMIT 1",
            [stream_id],
            |row| row.get(0),
        )
    };
    version.map(|v| v as u64).unwrap_or(0)
}

/// Reads up to `fetch` records of one stream starting at `skip`.
pub(crate) fn load_stream_page(
    conn: &Connection,
    stream_id: &str,
    skip: u64,
    fetch: u64,
) -> rusqlite::Result<Records> {
    let mut stmt = conn.prepare(
        "SELECT stream_id, stream_index, recorded_on, id, type, data, metadata
         FROM events WHERE stream_id = ?1 AND stream_index >= ?2
         ORDER BY stream_index LIMIT ?3",
    )?;
    let rows = stmt.query_map(
        params![stream_id, skip as i64, clamp_fetch(fetch)],
        scan_stream_row,
    )?;
    rows.collect()
}

/// Reads up to `fetch` records of the global view starting at `skip`.
pub(crate) fn load_all_page(conn: &Connection, skip: u64, fetch: u64) -> rusqlite::Result<Records> {
    let mut stmt = conn.prepare(
        "SELECT store_index, stream_id, stream_index, recorded_on, id, type, data, metadata
         FROM events WHERE store_index >= ?1 ORDER BY store_index LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![skip as i64, clamp_fetch(fetch)], scan_all_row)?;
    rows.collect()
}

fn clamp_fetch(fetch: u64) -> i64 {
    fetch.min(i64::MAX as u64) as i64
}

fn scan_stream_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let stream_id: String = row.get(0)?;
    let stream_index: i64 = row.get(1)?;
    let recorded_on: String = row.get(2)?;
    Ok(Record {
        id: row.get(3)?,
        stream_id: stream_id.clone(),
        stream_index: stream_index as u64,
        origin_stream_id: stream_id,
        origin_stream_index: stream_index as u64,
        recorded_on: parse_recorded_on(&recorded_on),
        record_type: row.get(4)?,
        data: row.get::<_, Option<Vec<u8>>>(5)?.unwrap_or_default(),
        metadata: row.get::<_, Option<Vec<u8>>>(6)?.unwrap_or_default(),
    })
}

fn scan_all_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Record> {
    let store_index: i64 = row.get(0)?;
    let origin_stream_id: String = row.get(1)?;
    let origin_stream_index: i64 = row.get(2)?;
    let recorded_on: String = row.get(3)?;
    Ok(Record {
        id: row.get(4)?,
        stream_id: ALL.to_string(),
        stream_index: store_index as u64,
        origin_stream_id,
        origin_stream_index: origin_stream_index as u64,
        recorded_on: parse_recorded_on(&recorded_on),
        record_type: row.get(5)?,
        data: row.get::<_, Option<Vec<u8>>>(6)?.unwrap_or_default(),
        metadata: row.get::<_, Option<Vec<u8>>>(7)?.unwrap_or_default(),
    })
}

// =============================================================================
// Writes
// =============================================================================

/// Inserts one record row with explicitly assigned coordinates.
pub(crate) fn insert_event(
    conn: &Connection,
    store_index: u64,
    stream_id: &str,
    stream_index: u64,
    recorded_on: DateTime<Utc>,
    record: &Record,
) -> rusqlite::Result<()> {
    conn.execute(
        INSERT_EVENT,
        params![
            store_index as i64,
            stream_id,
            stream_index as i64,
            format_recorded_on(recorded_on),
            record.id,
            record.record_type,
            record.data,
            record.metadata,
        ],
    )?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        apply_pragmas(&conn).unwrap();
        init_events_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn schema_is_idempotent() {
        let conn = test_conn();
        init_events_schema(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'events'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
    }

    #[test]
    fn duplicate_stream_index_is_rejected() {
        let conn = test_conn();
        let record = Record::new("1", "test", b"{}".to_vec());
        insert_event(&conn, 0, "foo", 0, Utc::now(), &record).unwrap();
        let err = insert_event(&conn, 1, "foo", 0, Utc::now(), &record);
        assert!(err.is_err());
    }

    #[test]
    fn version_and_pages_round_trip() {
        let conn = test_conn();
        for i in 0..3u64 {
            let record = Record::new(format!("{i}"), "test", b"{}".to_vec());
            insert_event(&conn, i, "foo", i, Utc::now(), &record).unwrap();
        }
        assert_eq!(read_version(&conn, "foo"), 3);
        assert_eq!(read_version(&conn, ALL), 3);
        assert_eq!(read_version(&conn, "missing"), 0);

        let page = load_stream_page(&conn, "foo", 1, 10).unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].stream_index, 1);

        let all = load_all_page(&conn, 0, 2).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].stream_id, ALL);
        assert_eq!(all[0].origin_stream_id, "foo");
    }
}
