//! # Streamer — Remote Feed Reader
//!
//! Reconstructs the logical record stream behind a hypermedia feed URL. Two
//! phases, mirroring the subscription engine but over HTTP:
//!
//! 1. **Backfill** — find the right starting page (the `first` link, a
//!    `search` template expansion, or a `previous`-walk), then follow `next`
//!    links, emitting page items in reverse order so they arrive
//!    chronologically.
//! 2. **Follow** — once there is no `next` link, re-request the current page
//!    as a conditional long-poll carrying the last `ETag`. Fresh content is
//!    processed immediately; an unchanged page pauses briefly before the next
//!    poll.
//!
//! Records whose index is below the reader's cursor are skipped, which makes
//! restarts and page-boundary backtracking idempotent. Connection errors
//! pause and retry; cancellation aborts the in-flight request and closes the
//! output stream.

use std::time::Duration;

use reqwest::header::{ACCEPT, IF_NONE_MATCH};
use reqwest::StatusCode;
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::hypermedia::{
    Item, CONTENT_TYPE, REL_FIRST, REL_NEXT, REL_PREVIOUS, REL_SEARCH, REL_SELF, TYPE_EVENT_RECORD,
};
use crate::record::{Record, RecordStream, STREAM_BUFFER};

const HEADER_LONG_POLL: &str = "Long-Poll";
const PARAM_SKIP: &str = "skip";

/// Default long-poll timeout announced to the server.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Pause after an unchanged long-poll round.
const IDLE_PAUSE: Duration = Duration::from_millis(100);
/// Pause before retrying after a connection error.
const RETRY_PAUSE: Duration = Duration::from_millis(500);

// =============================================================================
// Streamer
// =============================================================================

/// A configured remote reader. Build with [`Streamer::connect`], then call
/// [`records`](Streamer::records) to start reading.
pub struct Streamer {
    url: String,
    timeout: Duration,
    follow: bool,
    start_with_current: bool,
    from: u64,
    client: reqwest::Client,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Streamer {
    /// Targets a feed URL with default settings: read from the beginning,
    /// stop at the head, 30 second long-poll timeout.
    pub fn connect(url: impl Into<String>) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            url: url.into(),
            timeout: DEFAULT_TIMEOUT,
            follow: false,
            start_with_current: false,
            from: 0,
            client: reqwest::Client::new(),
            done_tx,
            done_rx,
        }
    }

    /// Keeps following the feed after the backfill reaches the head.
    pub fn follow(mut self) -> Self {
        self.follow = true;
        self
    }

    /// Starts reading at the given stream version.
    pub fn from_version(mut self, version: u64) -> Self {
        self.from = version;
        self
    }

    /// Skips the backlog: reads only records appended after the reader
    /// starts.
    pub fn from_current(mut self) -> Self {
        self.start_with_current = true;
        self
    }

    /// Long-poll timeout announced to the server in follow mode.
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Uses a preconfigured HTTP client.
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Spawns the reader task and returns its record stream.
    ///
    /// Must be called within a tokio runtime. The stream closes when the
    /// backfill completes (without `follow`), on [`close`](Streamer::close),
    /// or when the feed start cannot be located.
    pub fn records(&self) -> RecordStream {
        let (tx, stream) = RecordStream::channel(STREAM_BUFFER);
        let reader = Reader {
            url: self.url.clone(),
            timeout: self.timeout,
            follow: self.follow,
            start_with_current: self.start_with_current,
            from: self.from,
            client: self.client.clone(),
        };
        tokio::spawn(reader.run(tx, self.done_rx.clone()));
        stream
    }

    /// Cancels the reader: aborts any in-flight request and closes the
    /// record stream.
    pub fn close(&self) {
        let _ = self.done_tx.send(true);
    }
}

// =============================================================================
// Reader Task
// =============================================================================

/// A page address, optionally with the ETag of the content already seen
/// there.
struct Entry {
    url: String,
    etag: Option<String>,
}

struct Reader {
    url: String,
    timeout: Duration,
    follow: bool,
    start_with_current: bool,
    from: u64,
    client: reqwest::Client,
}

impl Reader {
    async fn run(self, tx: mpsc::Sender<Record>, mut done: watch::Receiver<bool>) {
        let mut current_version = self.from;
        if self.start_with_current {
            current_version = self.find_current_version().await;
        }

        let mut entry = match self.find_start(current_version, &mut done).await {
            Some(entry) => entry,
            None => return,
        };

        loop {
            if *done.borrow() {
                return;
            }
            let fetched = tokio::select! {
                _ = done.changed() => return,
                fetched = self.fetch(&entry) => fetched,
            };
            let (page, etag) = match fetched {
                Ok(page) => page,
                Err(err) => {
                    tracing::warn!(url = %entry.url, %err, "feed fetch failed, retrying");
                    if pause(&mut done, RETRY_PAUSE).await {
                        return;
                    }
                    continue;
                }
            };
            let unchanged = entry.etag.as_deref() == Some(etag.as_str());

            // Reverse page order is chronological order.
            for item in page.items.iter().rev() {
                if item.item_type != TYPE_EVENT_RECORD {
                    continue;
                }
                let record: Record = match item.decode_data() {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::debug!(%err, "skipping undecodable feed item");
                        continue;
                    }
                };
                if record.stream_index < current_version {
                    // Already delivered; restart or backtrack overlap.
                    continue;
                }
                current_version = record.stream_index + 1;
                tokio::select! {
                    _ = done.changed() => return,
                    sent = tx.send(record) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }

            if let Some(next) = page.find_link(REL_NEXT) {
                entry = Entry {
                    url: next.href.clone(),
                    etag: None,
                };
            } else if self.follow {
                if unchanged && pause(&mut done, IDLE_PAUSE).await {
                    return;
                }
                entry = Entry {
                    url: entry.url,
                    etag: Some(etag),
                };
            } else {
                return;
            }
        }
    }

    /// The version the feed is at right now: newest item index + 1.
    async fn find_current_version(&self) -> u64 {
        match self.get_page(&self.url).await {
            Ok((page, _)) => page
                .items
                .first()
                .and_then(|item| item.decode_data::<Record>().ok())
                .map(|record| record.stream_index + 1)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    /// Locates the page where reading should begin.
    async fn find_start(&self, from: u64, done: &mut watch::Receiver<bool>) -> Option<Entry> {
        let mut url = self.url.clone();
        loop {
            if *done.borrow() {
                return None;
            }
            let (page, _) = match self.get_page(&url).await {
                Ok(page) => page,
                Err(err) => {
                    tracing::warn!(%url, %err, "could not locate feed start");
                    return None;
                }
            };
            if let Some(self_link) = page.find_link(REL_SELF) {
                url = self_link.href.clone();
            }
            if from == 0 {
                if let Some(first) = page.find_link(REL_FIRST) {
                    return Some(Entry {
                        url: first.href.clone(),
                        etag: None,
                    });
                }
            } else {
                if let Some(template) = page
                    .find_link(REL_SEARCH)
                    .and_then(|link| link.template.as_deref())
                {
                    return Some(Entry {
                        url: expand_skip(template, from - 1),
                        etag: None,
                    });
                }
                if contains_index(&page, from - 1) {
                    return Some(Entry { url, etag: None });
                }
            }
            match page.find_link(REL_PREVIOUS) {
                Some(previous) => url = previous.href.clone(),
                // Nowhere further back; start here.
                None => return Some(Entry { url, etag: None }),
            }
        }
    }

    async fn fetch(&self, entry: &Entry) -> Result<(Item, String)> {
        match &entry.etag {
            Some(etag) => self.get_page_conditional(&entry.url, etag).await,
            None => self.get_page(&entry.url).await,
        }
    }

    async fn get_page(&self, url: &str) -> Result<(Item, String)> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, CONTENT_TYPE)
            .send()
            .await?;
        Self::read_page(response).await
    }

    async fn get_page_conditional(&self, url: &str, etag: &str) -> Result<(Item, String)> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, CONTENT_TYPE)
            .header(IF_NONE_MATCH, etag)
            .header(HEADER_LONG_POLL, self.timeout.as_secs().to_string())
            .send()
            .await?;
        Self::read_page(response).await
    }

    async fn read_page(response: reqwest::Response) -> Result<(Item, String)> {
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        match response.status() {
            StatusCode::OK => {
                let page: Item = response.json().await?;
                Ok((page, etag))
            }
            StatusCode::NOT_MODIFIED => Ok((Item::default(), etag)),
            status => Err(Error::Decode(format!("bad status: {status}"))),
        }
    }
}

/// Waits out a pause; true means the reader was cancelled meanwhile.
async fn pause(done: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = done.changed() => true,
        _ = tokio::time::sleep(duration) => *done.borrow(),
    }
}

/// Expands the feed's `{?skip}` search template with a position.
fn expand_skip(template: &str, skip: u64) -> String {
    template.replace(
        &format!("{{?{PARAM_SKIP}}}"),
        &format!("?{PARAM_SKIP}={skip}"),
    )
}

/// Whether any record item on the page sits at the given stream index.
fn contains_index(page: &Item, index: u64) -> bool {
    page.items.iter().any(|item| {
        item.item_type == TYPE_EVENT_RECORD
            && item
                .decode_data::<Record>()
                .map(|record| record.stream_index == index)
                .unwrap_or(false)
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_skip_fills_the_template() {
        assert_eq!(
            expand_skip("http://example.test/streams/foo{?skip}", 41),
            "http://example.test/streams/foo?skip=41"
        );
    }

    #[test]
    fn contains_index_checks_record_items_only() {
        let mut record_item = Item {
            item_type: TYPE_EVENT_RECORD.to_string(),
            ..Item::default()
        };
        let record = Record {
            stream_index: 7,
            ..Record::default()
        };
        record_item.encode_data(&record).unwrap();
        let page = Item {
            items: vec![Item::default(), record_item],
            ..Item::default()
        };
        assert!(contains_index(&page, 7));
        assert!(!contains_index(&page, 8));
    }
}
