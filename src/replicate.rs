//! # Replication
//!
//! Rebuilds a store from a remote `$all` feed. The streamer yields records
//! one by one; appending them individually would pay one transaction per
//! record, so replication groups the incoming stream into batches bounded by
//! count and by a time window, then applies each batch with a replication
//! append that preserves origin coordinates.
//!
//! The optimistic check makes restarts safe: each batch's first record
//! carries the global position it must land on, and a target that has moved
//! past it rejects the batch instead of double-applying.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::record::{RecordStream, Records, ALL};
use crate::store::Store;
use crate::streamer::Streamer;

/// Records per replication append.
const BATCH_MAX: usize = 100;
/// Flush window for a partially filled batch.
const BATCH_WINDOW: Duration = Duration::from_millis(250);

// =============================================================================
// Batching
// =============================================================================

/// Groups a record stream into batches of at most `max` records, flushing
/// early when `window` passes without a new record. The final partial batch
/// is flushed when the input stream closes.
pub fn batched(mut stream: RecordStream, max: usize, window: Duration) -> mpsc::Receiver<Records> {
    let (tx, rx) = mpsc::channel::<Records>(1);
    tokio::spawn(async move {
        let mut batch = Records::new();
        loop {
            match timeout(window, stream.next()).await {
                Ok(Some(record)) => {
                    batch.push(record);
                    if batch.len() >= max && tx.send(std::mem::take(&mut batch)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    if !batch.is_empty() {
                        let _ = tx.send(batch).await;
                    }
                    return;
                }
                Err(_elapsed) => {
                    if !batch.is_empty() && tx.send(std::mem::take(&mut batch)).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
    rx
}

// =============================================================================
// Replication Driver
// =============================================================================

/// Streams a remote `$all` feed into a store, resuming at the target's
/// current global version. With `follow` the call only returns on error or
/// when the source closes the connection for good.
pub async fn run(source_url: &str, store: Arc<dyn Store>, follow: bool) -> Result<()> {
    let from = store.version(ALL);
    tracing::info!(source = %source_url, %from, "starting replication");

    let mut streamer = Streamer::connect(source_url).from_version(from);
    if follow {
        streamer = streamer.follow();
    }
    let mut batches = batched(streamer.records(), BATCH_MAX, BATCH_WINDOW);

    while let Some(batch) = batches.recv().await {
        let first = &batch[0];
        if first.stream_id != ALL {
            return Err(Error::NotSupported(format!(
                "replication requires the {ALL} stream, got '{}'",
                first.stream_id
            )));
        }
        let expected = first.stream_index;
        let count = batch.len();

        let target = store.clone();
        tokio::task::spawn_blocking(move || target.append_all(expected, batch))
            .await
            .map_err(|err| Error::Config(format!("replication append failed: {err}")))??;
        tracing::debug!(count, position = expected, "replicated batch");
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Record;

    fn record(index: u64) -> Record {
        Record {
            id: format!("{index}"),
            stream_id: ALL.to_string(),
            stream_index: index,
            ..Record::default()
        }
    }

    #[tokio::test]
    async fn splits_by_count() {
        let records: Records = (0..5).map(record).collect();
        let mut batches = batched(RecordStream::of(records), 2, Duration::from_secs(5));
        assert_eq!(batches.recv().await.unwrap().len(), 2);
        assert_eq!(batches.recv().await.unwrap().len(), 2);
        assert_eq!(batches.recv().await.unwrap().len(), 1);
        assert!(batches.recv().await.is_none());
    }

    #[tokio::test]
    async fn flushes_on_window() {
        let (tx, stream) = RecordStream::channel(8);
        let mut batches = batched(stream, 100, Duration::from_millis(50));

        tx.send(record(0)).await.unwrap();
        tx.send(record(1)).await.unwrap();
        let early = tokio::time::timeout(Duration::from_secs(5), batches.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(early.len(), 2);

        tx.send(record(2)).await.unwrap();
        drop(tx);
        let rest = batches.recv().await.unwrap();
        assert_eq!(rest[0].stream_index, 2);
        assert!(batches.recv().await.is_none());
    }
}
