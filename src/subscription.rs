//! # Subscriptions
//!
//! A subscription turns a stream position into a live feed: it first pages
//! through everything already stored (catch-up), then follows append
//! notifications and re-enters catch-up whenever its stream grows.
//!
//! ```text
//! records()                       append published
//!    │                                  │
//!    ▼                                  ▼
//! ┌──────────────┐  end of stream  ┌──────────────────────────────┐
//! │   Catch-Up   │ ───────────────►│   Follow                     │
//! │ load_slice   │                 │ wait for "append" / cancel   │
//! │ loop         │◄────────────────│ re-run catch-up from cursor  │
//! └──────────────┘   notification  └──────────────────────────────┘
//! ```
//!
//! The follow listener registers after the first catch-up completes. Any
//! append landing in that window publishes a notification that is either
//! queued (listener already up) or covered by the next notification's
//! catch-up, because catch-up always drives off the explicit cursor and is
//! therefore idempotent.
//!
//! ## Delivery
//!
//! The producer runs on a dedicated thread with a current-thread runtime and
//! forwards records over a bounded channel. Cancellation is observed between
//! forwarded records, so the cursor never skips past an undelivered record;
//! at most one batch is in flight when the channel closes.

use std::sync::Arc;
use std::thread;

use tokio::sync::{mpsc, watch};

use crate::pubsub::Publisher;
use crate::record::{Record, RecordStream, ALL, STREAM_BUFFER};
use crate::store::{SliceFn, TOPIC_APPEND};

// =============================================================================
// Subscription
// =============================================================================

/// A live view of a stream: catch-up from a position, then follow.
///
/// Created via the store's `subscribe_to_stream*` methods. Nothing runs until
/// [`records`](Subscription::records) is called.
pub struct Subscription {
    stream_id: String,
    from: u64,
    batch_size: u64,
    load_slice: SliceFn,
    bus: Publisher,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Subscription {
    pub(crate) fn new(
        stream_id: impl Into<String>,
        from: u64,
        batch_size: u64,
        load_slice: SliceFn,
        bus: Publisher,
    ) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            stream_id: stream_id.into(),
            from,
            batch_size,
            load_slice,
            bus,
            done_tx,
            done_rx,
        }
    }

    /// Starts the subscription and returns its record stream.
    ///
    /// The stream closes after [`cancel`](Subscription::cancel), when the
    /// consumer drops it, or if the backing store becomes unreadable.
    pub fn records(&self) -> RecordStream {
        let (tx, stream) = RecordStream::channel(STREAM_BUFFER);
        let load_slice = self.load_slice.clone();
        let bus = self.bus.clone();
        let stream_id = self.stream_id.clone();
        let from = self.from;
        let batch_size = self.batch_size;
        let done = self.done_rx.clone();

        let spawned = thread::Builder::new()
            .name("tidelog-subscription".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build subscription runtime");
                rt.block_on(run(load_slice, bus, stream_id, from, batch_size, tx, done));
            });
        if let Err(err) = spawned {
            tracing::error!(%err, "failed to spawn subscription thread");
        }
        stream
    }

    /// Starts the subscription and invokes a callback for every record on a
    /// background thread.
    pub fn on(&self, callback: impl Fn(Record) + Send + 'static) {
        let mut records = self.records();
        thread::spawn(move || {
            while let Some(record) = records.blocking_next() {
                callback(record);
            }
        });
    }

    /// Cancels the subscription. The record stream closes within one batch.
    pub fn cancel(&self) {
        let _ = self.done_tx.send(true);
    }
}

// =============================================================================
// Producer
// =============================================================================

enum Phase {
    /// Catch-up round finished; resume from this cursor on the next round.
    Caught(u64),
    /// Producer must exit: cancelled or consumer gone.
    Stop,
}

async fn run(
    load_slice: SliceFn,
    bus: Publisher,
    stream_id: String,
    from: u64,
    batch_size: u64,
    tx: mpsc::Sender<Record>,
    mut done: watch::Receiver<bool>,
) {
    // Catch up with history.
    let mut cursor = match forward(&load_slice, &stream_id, from, batch_size, &tx, &mut done).await
    {
        Phase::Caught(next) => next,
        Phase::Stop => return,
    };

    // Follow: forward matching append notifications into an unbounded queue
    // so the publisher never blocks on this subscriber.
    let (update_tx, mut update_rx) = mpsc::unbounded_channel::<String>();
    let matcher = stream_id.clone();
    let bus_sub = bus.subscribe(
        TOPIC_APPEND,
        Arc::new(move |_topic, payload| {
            if matcher == ALL || matcher == payload {
                let _ = update_tx.send(payload.to_string());
            }
        }),
    );

    loop {
        tokio::select! {
            _ = done.changed() => break,
            notice = update_rx.recv() => {
                if notice.is_none() {
                    break;
                }
                match forward(&load_slice, &stream_id, cursor, batch_size, &tx, &mut done).await {
                    Phase::Caught(next) => cursor = next,
                    Phase::Stop => break,
                }
            }
        }
    }
    bus_sub.cancel();
}

/// One catch-up round: page from `from` until end of stream, forwarding every
/// record. Read errors end the round without advancing the cursor; the next
/// notification retries.
async fn forward(
    load_slice: &SliceFn,
    stream_id: &str,
    from: u64,
    batch_size: u64,
    tx: &mpsc::Sender<Record>,
    done: &mut watch::Receiver<bool>,
) -> Phase {
    let mut next = from;
    loop {
        if *done.borrow() {
            return Phase::Stop;
        }
        let slice = match load_slice(stream_id, next, batch_size) {
            Ok(slice) => slice,
            Err(err) => {
                tracing::debug!(stream = %stream_id, %err, "catch-up read failed");
                return Phase::Caught(next);
            }
        };
        for record in slice.records {
            tokio::select! {
                _ = done.changed() => return Phase::Stop,
                sent = tx.send(record) => {
                    if sent.is_err() {
                        return Phase::Stop;
                    }
                }
            }
        }
        if slice.is_end_of_stream {
            return Phase::Caught(slice.next);
        }
        next = slice.next;
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Records;
    use crate::store::Slice;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    /// In-memory single-stream slice source implementing the pagination
    /// contract, good enough to drive the subscription state machine.
    fn fixture() -> (Arc<Mutex<Records>>, SliceFn, Publisher) {
        let log: Arc<Mutex<Records>> = Arc::new(Mutex::new(Vec::new()));
        let source = log.clone();
        let load_slice: SliceFn = Arc::new(move |stream_id, skip, limit| {
            let log = source.lock().unwrap();
            let mut matching: Records = log
                .iter()
                .filter(|r| r.stream_id == stream_id && r.stream_index >= skip)
                .take(limit as usize + 1)
                .cloned()
                .collect();
            let n = matching.len() as u64;
            let is_end = n <= limit;
            let next = if is_end {
                skip + n
            } else {
                matching.truncate(limit as usize);
                skip + limit
            };
            Ok(Slice {
                stream_id: stream_id.to_string(),
                from: skip,
                next,
                records: matching,
                is_end_of_stream: is_end,
            })
        });
        (log, load_slice, Publisher::new())
    }

    fn push(log: &Arc<Mutex<Records>>, stream_id: &str, index: u64) {
        log.lock().unwrap().push(Record {
            id: format!("{index}"),
            stream_id: stream_id.to_string(),
            stream_index: index,
            origin_stream_id: stream_id.to_string(),
            origin_stream_index: index,
            ..Record::default()
        });
    }

    async fn wait_for_follower(bus: &Publisher) {
        timeout(Duration::from_secs(5), async {
            while bus.subscriber_count(TOPIC_APPEND) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("follow listener never registered");
    }

    #[tokio::test]
    async fn catch_up_then_follow() {
        let (log, load_slice, bus) = fixture();
        push(&log, "foo", 0);
        push(&log, "foo", 1);

        let sub = Subscription::new("foo", 0, 2, load_slice, bus.clone());
        let mut records = sub.records();

        assert_eq!(records.next().await.unwrap().stream_index, 0);
        assert_eq!(records.next().await.unwrap().stream_index, 1);

        wait_for_follower(&bus).await;
        push(&log, "foo", 2);
        bus.publish(TOPIC_APPEND, "foo");

        let live = timeout(Duration::from_secs(5), records.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(live.stream_index, 2);

        sub.cancel();
        let end = timeout(Duration::from_secs(5), records.next()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn ignores_appends_to_other_streams() {
        let (log, load_slice, bus) = fixture();
        let sub = Subscription::new("foo", 0, 10, load_slice, bus.clone());
        let mut records = sub.records();

        wait_for_follower(&bus).await;
        push(&log, "bar", 0);
        bus.publish(TOPIC_APPEND, "bar");
        push(&log, "foo", 0);
        bus.publish(TOPIC_APPEND, "foo");

        let first = timeout(Duration::from_secs(5), records.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.stream_id, "foo");
        sub.cancel();
    }

    #[tokio::test]
    async fn cancel_closes_stream() {
        let (log, load_slice, bus) = fixture();
        push(&log, "foo", 0);
        let sub = Subscription::new("foo", 0, 10, load_slice, bus);
        let mut records = sub.records();
        assert!(records.next().await.is_some());
        sub.cancel();
        let end = timeout(Duration::from_secs(5), records.next()).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn starts_at_requested_position() {
        let (log, load_slice, bus) = fixture();
        for i in 0..5 {
            push(&log, "foo", i);
        }
        let sub = Subscription::new("foo", 3, 2, load_slice, bus);
        let mut records = sub.records();
        assert_eq!(records.next().await.unwrap().stream_index, 3);
        assert_eq!(records.next().await.unwrap().stream_index, 4);
        sub.cancel();
    }
}
