//! # Hypermedia Items
//!
//! The minimal hyper-item document model shared by the feed server and the
//! remote reader: an item tree with typed links, actions, and an opaque
//! `data` payload. Pages of the event feed are items of type
//! `event-records` whose children are `event-record` items carrying one
//! record each; navigation happens exclusively through link rels, so client
//! and server only agree on this shape and on nothing about URL structure.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

// =============================================================================
// Constants
// =============================================================================

/// Content type of hyper-item documents.
pub const CONTENT_TYPE: &str = "application/vnd.hyper-item+json";

pub const REL_SELF: &str = "self";
pub const REL_FIRST: &str = "first";
pub const REL_LAST: &str = "last";
pub const REL_NEXT: &str = "next";
pub const REL_PREVIOUS: &str = "previous";
pub const REL_SEARCH: &str = "search";

/// Item type of a feed page.
pub const TYPE_EVENT_RECORDS: &str = "event-records";
/// Item type of a single record within a page.
pub const TYPE_EVENT_RECORD: &str = "event-record";
/// Item type of a command response.
pub const TYPE_RESPONSE: &str = "response";

// =============================================================================
// Document Model
// =============================================================================

/// A hyper-item: typed content plus the links and actions leading away from
/// it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Item {
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub item_type: String,

    /// Opaque payload; for `event-record` items this is the record itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<Property>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<Item>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Link>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ItemError>,
}

/// A named value shown on an item, e.g. a response message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: Value,
}

/// A typed link. Either `href` points somewhere directly or `template`
/// carries a URI template the client expands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub href: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
}

/// An invokable action advertised on an item.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Action {
    pub rel: String,
    pub href: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<Parameter>,
}

/// Describes one parameter of a templated link or an action.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub parameter_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub multiple: bool,
}

/// An error reported on a response item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Item {
    /// Finds the first link with the given rel.
    pub fn find_link(&self, rel: &str) -> Option<&Link> {
        self.links.iter().find(|link| link.rel == rel)
    }

    /// Serializes a value into the item's `data` payload.
    ///
    /// Goes through JSON text rather than `serde_json::to_value` so that
    /// types embedding raw JSON (records) serialize faithfully.
    pub fn encode_data<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.data = Some(serde_json::from_str(&text)?);
        Ok(())
    }

    /// Deserializes the item's `data` payload.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self
            .data
            .as_ref()
            .ok_or_else(|| Error::Decode("item has no data".to_string()))?;
        Ok(serde_json::from_str(&serde_json::to_string(data)?)?)
    }
}

/// Builds a response item with a message and optional error details.
pub fn response(message: impl Into<String>, errors: Vec<ItemError>) -> Item {
    Item {
        item_type: TYPE_RESPONSE.to_string(),
        properties: vec![Property {
            name: "message".to_string(),
            value: Value::String(message.into()),
        }],
        errors,
        ..Item::default()
    }
}

// =============================================================================
// Tests
// =============================================================================
