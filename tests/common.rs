#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tidelog::{BasicStore, ChunkedStore, Record, RecordStream, Records, Store};

pub fn record(id: &str) -> Record {
    Record::new(id, "test", b"{}".to_vec())
}

pub fn records(ids: &[&str]) -> Records {
    ids.iter().map(|id| record(id)).collect()
}

pub fn memory_store() -> Arc<dyn Store> {
    Arc::new(BasicStore::open_in_memory().expect("open in-memory store"))
}

pub fn chunked_store(chunk_size: u64) -> (tempfile::TempDir, Arc<dyn Store>) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let dsn = format!("{}?chunk-size={chunk_size}", dir.path().display());
    let store = ChunkedStore::open(&dsn).expect("open chunked store");
    (dir, Arc::new(store))
}

/// Record identity without the store-assigned timestamp.
pub fn essence(records: &[Record]) -> Vec<(String, String, u64, String, u64, String)> {
    records
        .iter()
        .map(|r| {
            (
                r.id.clone(),
                r.stream_id.clone(),
                r.stream_index,
                r.origin_stream_id.clone(),
                r.origin_stream_index,
                r.record_type.clone(),
            )
        })
        .collect()
}

/// Receives the next record or panics after a bounded wait.
pub async fn next_within(stream: &mut RecordStream, wait: Duration) -> Record {
    tokio::time::timeout(wait, stream.next())
        .await
        .expect("timed out waiting for a record")
        .expect("stream closed unexpectedly")
}
