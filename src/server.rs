//! # HTTP Server — The Feed Surface
//!
//! Serves stores as hypermedia feeds:
//!
//! - `GET /` — directory item linking to the stream collection.
//! - `GET /streams/` — links to `$all` plus a template for any stream id.
//! - `GET /streams/{id}` — a feeder page; writable streams advertise an
//!   `append` action.
//! - `POST /streams/{id}` — the append action.
//!
//! ## Revalidation and Long-Polling
//!
//! Every page response carries an `ETag` over its body. A client that sends
//! the tag back via `If-None-Match` together with a `Long-Poll: <seconds>`
//! header parks on the page URL: the request returns early with fresh content
//! as soon as an append touches the stream, or with `304 Not Modified` when
//! the timeout passes first.
//!
//! The invalidation source is the store itself: at startup the server
//! subscribes to `$all` from the current version and signals
//! `/streams/{origin}` and `/streams/$all` for every record it sees.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::header::{CONTENT_TYPE, ETAG, HOST, IF_NONE_MATCH};
use axum::http::{HeaderMap, HeaderName, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use url::Url;

use crate::error::{Error, Result};
use crate::feeder::Feeder;
use crate::hypermedia::{self, Action, Item, ItemError, Link, Parameter, REL_SELF};
use crate::record::{RecordStream, Records, ALL};
use crate::store::Store;

const HEADER_LONG_POLL: HeaderName = HeaderName::from_static("long-poll");

// =============================================================================
// Long-Poll Signalling
// =============================================================================

/// Per-URL wakeup channels for parked conditional requests.
///
/// Waiters subscribe *before* rendering their page, so a signal arriving
/// while the page is being built is never lost — the subsequent `changed()`
/// resolves immediately.
#[derive(Default)]
pub struct LongPoll {
    paths: Mutex<HashMap<String, watch::Sender<u64>>>,
}

impl LongPoll {
    /// Subscribes to wakeups for a path.
    fn watch(&self, path: &str) -> watch::Receiver<u64> {
        let mut paths = self.paths.lock().expect("long-poll registry poisoned");
        paths
            .entry(path.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    /// Wakes every request parked on a path.
    pub fn signal(&self, path: &str) {
        let mut paths = self.paths.lock().expect("long-poll registry poisoned");
        if let Some(tx) = paths.get(path) {
            tx.send_modify(|generation| *generation += 1);
        }
        // Entries nobody waits on are recreated on demand.
        paths.retain(|_, tx| tx.receiver_count() > 0);
    }
}

// =============================================================================
// Server
// =============================================================================

struct ServerState {
    store: Arc<dyn Store>,
    long_poll: Arc<LongPoll>,
}

/// Builds the feed router for a store and wires append invalidation.
///
/// Must run inside a tokio runtime; the invalidation listener is spawned
/// here.
pub fn router(store: Arc<dyn Store>) -> Router {
    let long_poll = Arc::new(LongPoll::default());

    let subscription = store.subscribe_to_stream_from_current(ALL);
    let records = subscription.records();
    tokio::spawn(invalidate_on_append(
        subscription,
        records,
        long_poll.clone(),
    ));

    let state = Arc::new(ServerState { store, long_poll });
    Router::new()
        .route("/", get(get_root))
        .route("/streams/", get(get_streams))
        .route("/streams/{id}", get(get_stream).post(post_stream))
        .with_state(state)
}

/// Binds and serves the feed until the listener fails.
pub async fn serve(bind: &str, store: Arc<dyn Store>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "serving event store feed");
    axum::serve(listener, router(store))
        .await
        .map_err(Error::Io)?;
    Ok(())
}

async fn invalidate_on_append(
    subscription: crate::subscription::Subscription,
    mut records: RecordStream,
    long_poll: Arc<LongPoll>,
) {
    // Dropped with this task; keeps the store subscription alive.
    let _subscription = subscription;
    while let Some(record) = records.next().await {
        long_poll.signal(&format!("/streams/{}", record.origin_stream_id));
        long_poll.signal(&format!("/streams/{ALL}"));
    }
}

// =============================================================================
// Handlers
// =============================================================================

async fn get_root(headers: HeaderMap, uri: Uri) -> Response {
    let base = external_url(&headers, &uri);
    let item = Item {
        links: vec![
            Link {
                rel: REL_SELF.to_string(),
                href: base.to_string(),
                ..Link::default()
            },
            Link {
                rel: "streams".to_string(),
                href: resolve(&base, "/streams/"),
                ..Link::default()
            },
        ],
        ..Item::default()
    };
    item_response(StatusCode::OK, &item)
}

async fn get_streams(headers: HeaderMap, uri: Uri) -> Response {
    let base = external_url(&headers, &uri);
    let item = Item {
        links: vec![
            Link {
                rel: REL_SELF.to_string(),
                href: base.to_string(),
                ..Link::default()
            },
            Link {
                rel: ALL.to_string(),
                href: resolve(&base, &format!("/streams/{ALL}")),
                ..Link::default()
            },
            Link {
                rel: "stream".to_string(),
                template: Some(format!("{}{{id}}", resolve(&base, "/streams/"))),
                parameters: vec![Parameter {
                    name: "id".to_string(),
                    parameter_type: "text".to_string(),
                    ..Parameter::default()
                }],
                ..Link::default()
            },
        ],
        ..Item::default()
    };
    item_response(StatusCode::OK, &item)
}

async fn get_stream(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let base = external_url(&headers, &uri);
    // Subscribe before rendering so no append slips between page build and
    // the park below.
    let mut wakeup = state.long_poll.watch(&format!("/streams/{id}"));

    let (body, etag) = match render_page(&state, &id, &base).await {
        Ok(rendered) => rendered,
        Err(response) => return response,
    };

    let revalidation = headers
        .get(IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == etag)
        .unwrap_or(false);
    let long_poll_secs: Option<u64> = headers
        .get(&HEADER_LONG_POLL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());

    if revalidation {
        if let Some(secs) = long_poll_secs {
            let deadline = Instant::now() + Duration::from_secs(secs);
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return not_modified(&etag);
                }
                match timeout(remaining, wakeup.changed()).await {
                    Err(_) | Ok(Err(_)) => return not_modified(&etag),
                    Ok(Ok(())) => {
                        let (fresh_body, fresh_etag) = match render_page(&state, &id, &base).await {
                            Ok(rendered) => rendered,
                            Err(response) => return response,
                        };
                        if fresh_etag != etag {
                            return page_response(fresh_body, &fresh_etag);
                        }
                    }
                }
            }
        }
        return not_modified(&etag);
    }
    page_response(body, &etag)
}

async fn post_stream(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
    Json(command): Json<Command>,
) -> Response {
    if command.action != "append" {
        return error_response(
            "unknown action",
            &format!("unknown action: {}", command.action),
        );
    }
    if id == ALL {
        let message = format!("events can not be appended to {ALL}");
        return error_response(&message, &message);
    }
    let events: Records = match command.arguments.get("events").cloned() {
        Some(value) => match serde_json::from_value(value) {
            Ok(events) => events,
            Err(err) => {
                return error_response("could not deserialize events", &err.to_string());
            }
        },
        None => Vec::new(),
    };

    let store = state.store.clone();
    let stream_id = id.clone();
    let count = events.len();
    let appended = tokio::task::spawn_blocking(move || {
        let version = store.version(&stream_id);
        store.append(&stream_id, version, events)
    })
    .await;

    match appended {
        Ok(Ok(())) => item_response(
            StatusCode::OK,
            &hypermedia::response(format!("appended {count} events to {id}"), Vec::new()),
        ),
        Ok(Err(err)) => error_response(&format!("could not append to {id}"), &err.to_string()),
        Err(join_err) => error_response("append failed", &join_err.to_string()),
    }
}

// =============================================================================
// Page Rendering
// =============================================================================

async fn render_page(
    state: &Arc<ServerState>,
    stream_id: &str,
    base: &Url,
) -> std::result::Result<(Vec<u8>, String), Response> {
    let store = state.store.clone();
    let stream_id = stream_id.to_string();
    let base = base.clone();
    let rendered = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let mut page = Feeder::new(store, stream_id.as_str()).page(&base);
        if stream_id != ALL {
            page.actions.push(append_action(&base));
        }
        Ok(serde_json::to_vec(&page)?)
    })
    .await;

    match rendered {
        Ok(Ok(body)) => {
            let etag = etag_of(&body);
            Ok((body, etag))
        }
        Ok(Err(err)) => Err(error_response("could not build page", &err.to_string())),
        Err(join_err) => Err(error_response("could not build page", &join_err.to_string())),
    }
}

fn append_action(base: &Url) -> Action {
    let mut href = base.clone();
    href.set_query(None);
    Action {
        rel: "append".to_string(),
        href: href.to_string(),
        method: "POST".to_string(),
        parameters: vec![
            Parameter {
                name: "action".to_string(),
                value: Some(Value::String("append".to_string())),
                ..Parameter::default()
            },
            Parameter {
                name: "events".to_string(),
                parameter_type: "application/vnd.event+json".to_string(),
                multiple: true,
                ..Parameter::default()
            },
        ],
    }
}

/// Strong validator over the page body.
fn etag_of(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("\"{:x}\"", hasher.finalize())
}

// =============================================================================
// Request/Response Plumbing
// =============================================================================

/// The append command carried by POST bodies:
/// `{"action": "append", "arguments": {"events": [...]}}`.
#[derive(Debug, Deserialize)]
struct Command {
    #[serde(default)]
    action: String,
    #[serde(default)]
    arguments: serde_json::Map<String, Value>,
}

/// Reconstructs the externally visible request URL from the Host header.
fn external_url(headers: &HeaderMap, uri: &Uri) -> Url {
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Url::parse(&format!("http://{host}{path_and_query}"))
        .unwrap_or_else(|_| Url::parse("http://localhost/").expect("static url"))
}

/// Resolves an absolute path against the request's scheme and host.
fn resolve(base: &Url, path: &str) -> String {
    let mut url = base.clone();
    url.set_query(None);
    url.set_path(path);
    url.to_string()
}

fn item_response(status: StatusCode, item: &Item) -> Response {
    match serde_json::to_vec(item) {
        Ok(body) => (
            status,
            [(CONTENT_TYPE, hypermedia::CONTENT_TYPE.to_string())],
            body,
        )
            .into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

fn page_response(body: Vec<u8>, etag: &str) -> Response {
    (
        StatusCode::OK,
        [
            (CONTENT_TYPE, hypermedia::CONTENT_TYPE.to_string()),
            (ETAG, etag.to_string()),
        ],
        body,
    )
        .into_response()
}

fn not_modified(etag: &str) -> Response {
    (
        StatusCode::NOT_MODIFIED,
        [(ETAG, etag.to_string())],
        Vec::<u8>::new(),
    )
        .into_response()
}

fn error_response(message: &str, detail: &str) -> Response {
    let item = hypermedia::response(
        message,
        vec![ItemError {
            message: detail.to_string(),
            code: None,
        }],
    );
    item_response(StatusCode::BAD_REQUEST, &item)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_is_stable_and_quoted() {
        let a = etag_of(b"page body");
        let b = etag_of(b"page body");
        let c = etag_of(b"other body");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with('"') && a.ends_with('"'));
    }

    #[test]
    fn external_url_uses_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, "feed.example:4711".parse().unwrap());
        let uri: Uri = "/streams/foo?skip=3&limit=2".parse().unwrap();
        let url = external_url(&headers, &uri);
        assert_eq!(
            url.to_string(),
            "http://feed.example:4711/streams/foo?skip=3&limit=2"
        );
        assert_eq!(resolve(&url, "/streams/"), "http://feed.example:4711/streams/");
    }

    #[tokio::test]
    async fn long_poll_signal_wakes_watchers() {
        let long_poll = LongPoll::default();
        let mut rx = long_poll.watch("/streams/foo");
        long_poll.signal("/streams/foo");
        timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("no wakeup")
            .expect("sender dropped");
    }

    #[tokio::test]
    async fn signals_for_other_paths_do_not_wake() {
        let long_poll = LongPoll::default();
        let mut rx = long_poll.watch("/streams/foo");
        long_poll.signal("/streams/bar");
        assert!(timeout(Duration::from_millis(50), rx.changed()).await.is_err());
    }

    #[test]
    fn command_deserializes_with_defaults() {
        let command: Command = serde_json::from_str(r#"{"action":"append"}"#).unwrap();
        assert_eq!(command.action, "append");
        assert!(command.arguments.is_empty());
    }
}
