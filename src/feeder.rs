//! # Feeder — Paged Hypermedia View of a Stream
//!
//! Turns a stream into deterministic, link-annotated pages. Two choices give
//! feed consumers a good default experience:
//!
//! - With no query parameters a request lands on the *last* page, so plain
//!   polling readers see the newest records immediately.
//! - Within a page, records are emitted newest-first; a client walking items
//!   in reverse therefore reads chronologically, which is exactly what the
//!   remote reader does.
//!
//! Every page links `self`, `first`, `last`, a `search` template for direct
//! positioning, plus `previous`/`next` where they exist. Page identity is
//! fully determined by `(skip, limit)`, so pages are cacheable and ETags are
//! stable.

use std::sync::Arc;

use url::Url;

use crate::hypermedia::{
    Item, Link, Parameter, REL_FIRST, REL_LAST, REL_NEXT, REL_PREVIOUS, REL_SEARCH, REL_SELF,
    TYPE_EVENT_RECORD, TYPE_EVENT_RECORDS,
};
use crate::store::Store;

// =============================================================================
// Constants
// =============================================================================

const PARAM_SKIP: &str = "skip";
const PARAM_LIMIT: &str = "limit";
const MIN_PAGE_SIZE: u64 = 1;

/// Page size used when the request does not carry a `limit` parameter.
pub const DEFAULT_PAGE_SIZE: u64 = 50;

// =============================================================================
// Feeder
// =============================================================================

/// Pages one stream of a store into hypermedia items.
pub struct Feeder {
    store: Arc<dyn Store>,
    stream_id: String,
    page_size: u64,
}

impl Feeder {
    pub fn new(store: Arc<dyn Store>, stream_id: impl Into<String>) -> Self {
        Self {
            store,
            stream_id: stream_id.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Builds the page addressed by a request URL with optional `skip` and
    /// `limit` query parameters.
    pub fn page(&self, url: &Url) -> Item {
        let version = self.store.version(&self.stream_id);

        let mut limit = self.page_size;
        if let Some(raw) = query_param(url, PARAM_LIMIT) {
            limit = raw.parse().unwrap_or(0).max(MIN_PAGE_SIZE);
        }

        // Default to the newest page.
        let mut skip = match number_of_pages(version, limit) {
            0 => 0,
            pages => (pages - 1) * limit,
        };
        if let Some(raw) = query_param(url, PARAM_SKIP) {
            skip = raw.parse().unwrap_or(0);
        }

        let mut page = Item {
            item_type: TYPE_EVENT_RECORDS.to_string(),
            links: vec![
                Link {
                    rel: REL_SELF.to_string(),
                    href: page_url(url, skip, limit),
                    ..Link::default()
                },
                Link {
                    rel: REL_SEARCH.to_string(),
                    template: Some(search_template(url)),
                    parameters: vec![Parameter {
                        name: PARAM_SKIP.to_string(),
                        parameter_type: "int".to_string(),
                        ..Parameter::default()
                    }],
                    ..Link::default()
                },
                Link {
                    rel: REL_LAST.to_string(),
                    href: stream_url(url),
                    ..Link::default()
                },
                Link {
                    rel: REL_FIRST.to_string(),
                    href: page_url(url, 0, limit),
                    ..Link::default()
                },
            ],
            ..Item::default()
        };

        let slice = match self.store.load_slice(&self.stream_id, skip, limit) {
            Ok(slice) => slice,
            Err(err) => {
                tracing::warn!(stream = %self.stream_id, %err, "feed page read failed");
                return page;
            }
        };

        // Newest first within the page.
        for record in &slice.records {
            let mut item = Item {
                item_type: TYPE_EVENT_RECORD.to_string(),
                ..Item::default()
            };
            if item.encode_data(record).is_ok() {
                page.items.insert(0, item);
            }
        }

        if skip > 0 {
            page.links.push(Link {
                rel: REL_PREVIOUS.to_string(),
                href: page_url(url, skip.saturating_sub(limit), limit),
                ..Link::default()
            });
        }
        if !page.items.is_empty() {
            page.links.push(Link {
                rel: REL_NEXT.to_string(),
                href: page_url(url, slice.next, limit),
                ..Link::default()
            });
        }
        page
    }
}

// =============================================================================
// URL Helpers
// =============================================================================

fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn page_url(base: &Url, skip: u64, limit: u64) -> String {
    let mut url = base.clone();
    url.set_query(Some(&format!("{PARAM_SKIP}={skip}&{PARAM_LIMIT}={limit}")));
    url.to_string()
}

/// The bare stream URL, whose defaulting lands on the newest page.
fn stream_url(base: &Url) -> String {
    let mut url = base.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

fn search_template(base: &Url) -> String {
    format!("{}{{?{PARAM_SKIP}}}", stream_url(base))
}

fn number_of_pages(version: u64, limit: u64) -> u64 {
    version / limit + u64::from(version % limit > 0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::BasicStore;
    use crate::record::{Record, Records};

    fn seeded_store(count: u64) -> Arc<dyn Store> {
        let store = BasicStore::open_in_memory().unwrap();
        let records: Records = (0..count)
            .map(|i| Record::new(format!("{i}"), "test", b"{}".to_vec()))
            .collect();
        store.append("foo", 0, records).unwrap();
        Arc::new(store)
    }

    fn base_url() -> Url {
        Url::parse("http://example.test/streams/foo").unwrap()
    }

    fn data_index(item: &Item) -> u64 {
        let record: Record = item.decode_data().unwrap();
        record.stream_index
    }

    #[test]
    fn number_of_pages_rounds_up() {
        assert_eq!(number_of_pages(0, 50), 0);
        assert_eq!(number_of_pages(50, 50), 1);
        assert_eq!(number_of_pages(51, 50), 2);
    }

    #[test]
    fn empty_stream_has_no_items_and_no_next() {
        let feeder = Feeder::new(seeded_store(0), "foo");
        let page = feeder.page(&base_url());
        assert!(page.items.is_empty());
        assert!(page.find_link(REL_NEXT).is_none());
        assert!(page.find_link(REL_PREVIOUS).is_none());
        assert_eq!(
            page.find_link(REL_SELF).unwrap().href,
            "http://example.test/streams/foo?skip=0&limit=50"
        );
        assert_eq!(
            page.find_link(REL_SEARCH).unwrap().template.as_deref(),
            Some("http://example.test/streams/foo{?skip}")
        );
    }

    #[test]
    fn default_request_lands_on_newest_page() {
        let mut feeder = Feeder::new(seeded_store(5), "foo");
        feeder.page_size = 2;
        let page = feeder.page(&base_url());
        // version 5, limit 2 -> 3 pages -> skip 4
        assert_eq!(page.items.len(), 1);
        assert_eq!(data_index(&page.items[0]), 4);
        assert_eq!(
            page.find_link(REL_SELF).unwrap().href,
            "http://example.test/streams/foo?skip=4&limit=2"
        );
        assert_eq!(
            page.find_link(REL_PREVIOUS).unwrap().href,
            "http://example.test/streams/foo?skip=2&limit=2"
        );
    }

    #[test]
    fn explicit_page_is_newest_first_with_next_link() {
        let feeder = Feeder::new(seeded_store(5), "foo");
        let url = Url::parse("http://example.test/streams/foo?skip=0&limit=2").unwrap();
        let page = feeder.page(&url);
        assert_eq!(page.items.len(), 2);
        assert_eq!(data_index(&page.items[0]), 1);
        assert_eq!(data_index(&page.items[1]), 0);
        assert!(page.find_link(REL_PREVIOUS).is_none());
        assert_eq!(
            page.find_link(REL_NEXT).unwrap().href,
            "http://example.test/streams/foo?skip=2&limit=2"
        );
        assert_eq!(
            page.find_link(REL_FIRST).unwrap().href,
            "http://example.test/streams/foo?skip=0&limit=2"
        );
        assert_eq!(
            page.find_link(REL_LAST).unwrap().href,
            "http://example.test/streams/foo"
        );
    }

    #[test]
    fn limit_is_clamped_to_minimum() {
        let feeder = Feeder::new(seeded_store(3), "foo");
        let url = Url::parse("http://example.test/streams/foo?skip=0&limit=0").unwrap();
        let page = feeder.page(&url);
        assert_eq!(page.items.len(), 1);
    }

    #[test]
    fn next_links_reconstruct_the_stream_in_order() {
        let feeder = Feeder::new(seeded_store(7), "foo");
        let mut url = Url::parse("http://example.test/streams/foo?skip=0&limit=3").unwrap();
        let mut seen = Vec::new();
        loop {
            let page = feeder.page(&url);
            if page.items.is_empty() {
                break;
            }
            // reverse page order is chronological
            for item in page.items.iter().rev() {
                seen.push(data_index(item));
            }
            match page.find_link(REL_NEXT) {
                Some(link) => url = Url::parse(&link.href).unwrap(),
                None => break,
            }
        }
        assert_eq!(seen, (0..7).collect::<Vec<u64>>());
    }
}
