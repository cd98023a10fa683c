//! Live subscription behavior against real stores.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tidelog::{Store, ALL};

const WAIT: Duration = Duration::from_secs(5);

/// Give the subscription thread time to finish its empty catch-up and
/// register the follow listener before appending.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

async fn blocking_append(store: &Arc<dyn Store>, stream_id: &str, version: u64, ids: &[&str]) {
    let store = store.clone();
    let stream_id = stream_id.to_string();
    let records = common::records(ids);
    tokio::task::spawn_blocking(move || store.append(&stream_id, version, records))
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn subscriber_attached_before_append_observes_it() {
    let store = common::memory_store();
    let subscription = store.subscribe_to_stream("foo");
    let mut records = subscription.records();
    settle().await;

    blocking_append(&store, "foo", 0, &["1", "2"]).await;

    assert_eq!(common::next_within(&mut records, WAIT).await.stream_index, 0);
    assert_eq!(common::next_within(&mut records, WAIT).await.stream_index, 1);
    subscription.cancel();
}

#[tokio::test]
async fn catch_up_precedes_live_records() {
    let store = common::memory_store();
    blocking_append(&store, "foo", 0, &["1", "2"]).await;

    let subscription = store.subscribe_to_stream("foo");
    let mut records = subscription.records();
    assert_eq!(common::next_within(&mut records, WAIT).await.id, "1");
    assert_eq!(common::next_within(&mut records, WAIT).await.id, "2");

    settle().await;
    blocking_append(&store, "foo", 2, &["3"]).await;
    assert_eq!(common::next_within(&mut records, WAIT).await.id, "3");
    subscription.cancel();
}

#[tokio::test]
async fn from_current_skips_the_backlog() {
    let store = common::memory_store();
    blocking_append(&store, "foo", 0, &["1"]).await;

    let subscription = store.subscribe_to_stream_from_current("foo");
    let mut records = subscription.records();
    settle().await;

    blocking_append(&store, "foo", 1, &["2"]).await;
    let first = common::next_within(&mut records, WAIT).await;
    assert_eq!(first.id, "2");
    assert_eq!(first.stream_index, 1);
    subscription.cancel();
}

#[tokio::test]
async fn from_position_resumes_mid_stream() {
    let store = common::memory_store();
    blocking_append(&store, "foo", 0, &["1", "2", "3"]).await;

    let subscription = store.subscribe_to_stream_from("foo", 1);
    let mut records = subscription.records();
    assert_eq!(common::next_within(&mut records, WAIT).await.stream_index, 1);
    assert_eq!(common::next_within(&mut records, WAIT).await.stream_index, 2);
    subscription.cancel();
}

#[tokio::test]
async fn all_subscription_sees_every_stream() {
    let store = common::memory_store();
    let subscription = store.subscribe_to_stream(ALL);
    let mut records = subscription.records();
    settle().await;

    blocking_append(&store, "foo", 0, &["1"]).await;
    blocking_append(&store, "bar", 0, &["2"]).await;

    let first = common::next_within(&mut records, WAIT).await;
    assert_eq!((first.stream_id.as_str(), first.stream_index), (ALL, 0));
    assert_eq!(first.origin_stream_id, "foo");

    let second = common::next_within(&mut records, WAIT).await;
    assert_eq!(second.stream_index, 1);
    assert_eq!(second.origin_stream_id, "bar");
    subscription.cancel();
}

#[tokio::test]
async fn stream_subscription_ignores_other_streams() {
    let store = common::memory_store();
    let subscription = store.subscribe_to_stream("foo");
    let mut records = subscription.records();
    settle().await;

    blocking_append(&store, "bar", 0, &["1"]).await;
    blocking_append(&store, "foo", 0, &["2"]).await;

    let first = common::next_within(&mut records, WAIT).await;
    assert_eq!(first.stream_id, "foo");
    assert_eq!(first.id, "2");
    subscription.cancel();
}

#[tokio::test]
async fn cancellation_closes_the_stream() {
    let store = common::memory_store();
    blocking_append(&store, "foo", 0, &["1"]).await;

    let subscription = store.subscribe_to_stream("foo");
    let mut records = subscription.records();
    assert_eq!(common::next_within(&mut records, WAIT).await.id, "1");

    subscription.cancel();
    let end = tokio::time::timeout(WAIT, records.next()).await.unwrap();
    assert!(end.is_none());
}

#[tokio::test]
async fn chunked_store_subscriptions_follow_appends() {
    let (_dir, store) = common::chunked_store(2);
    let subscription = store.subscribe_to_stream("foo");
    let mut records = subscription.records();
    settle().await;

    blocking_append(&store, "foo", 0, &["1", "2", "3"]).await;
    for expected in 0..3 {
        assert_eq!(
            common::next_within(&mut records, WAIT).await.stream_index,
            expected
        );
    }
    subscription.cancel();
}
