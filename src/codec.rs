//! # Codec — Typed Events In, Records Out
//!
//! The store deals in opaque [`Record`]s; applications deal in typed events.
//! The codec bridges the two with a registry keyed both ways:
//!
//! ```text
//! encode: &OrderPlaced ──(TypeId)──► serialize ──► Record { type: "order-placed", data }
//! decode: Record ──("order-placed")──► deserialize ──► Box<OrderPlaced>
//! ```
//!
//! ## Record Ids
//!
//! Every record needs a non-empty id. By default the codec generates a UUID
//! v4; an application that keeps natural ids on its events can install an
//! extraction function instead, falling back to the generated id when the
//! extractor declines.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::record::Record;

// =============================================================================
// Codec
// =============================================================================

type EncodeFn = Arc<dyn Fn(&dyn Any) -> Result<Vec<u8>> + Send + Sync>;
type DecodeFn = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>> + Send + Sync>;

/// Extracts a record id from an event; `None` falls back to a generated id.
pub type IdExtractor = Arc<dyn Fn(&dyn Any) -> Option<String> + Send + Sync>;

/// A registry translating between typed events and records.
#[derive(Default, Clone)]
pub struct Codec {
    encoders: HashMap<TypeId, (String, EncodeFn)>,
    decoders: HashMap<String, DecodeFn>,
    id_extractor: Option<IdExtractor>,
}

impl Codec {
    /// Creates an empty codec.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an event type under a symbolic name.
    pub fn register<T>(&mut self, name: &str)
    where
        T: Serialize + DeserializeOwned + Any + Send,
    {
        let encode: EncodeFn = Arc::new(|event: &dyn Any| {
            let event = event
                .downcast_ref::<T>()
                .ok_or_else(|| Error::Decode("event type mismatch".to_string()))?;
            Ok(serde_json::to_vec(event)?)
        });
        let decode: DecodeFn = Arc::new(|data: &[u8]| {
            let event: T = serde_json::from_slice(data)?;
            Ok(Box::new(event) as Box<dyn Any + Send>)
        });
        self.encoders
            .insert(TypeId::of::<T>(), (name.to_string(), encode));
        self.decoders.insert(name.to_string(), decode);
    }

    /// Installs an id extraction function consulted before generating ids.
    pub fn with_id_extractor(mut self, extractor: IdExtractor) -> Self {
        self.id_extractor = Some(extractor);
        self
    }

    /// Encodes a registered event into an unstored record.
    ///
    /// The record carries the registered type name, the JSON payload, a
    /// recorded-on timestamp, and an id (extracted or generated).
    pub fn encode<T>(&self, event: &T) -> Result<Record>
    where
        T: Any,
    {
        let (name, encode) = self
            .encoders
            .get(&TypeId::of::<T>())
            .ok_or_else(|| Error::Decode("event type is not registered".to_string()))?;
        let data = encode(event)?;
        let id = self
            .id_extractor
            .as_ref()
            .and_then(|extract| extract(event))
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Ok(Record {
            id,
            record_type: name.clone(),
            data,
            recorded_on: Some(chrono::Utc::now()),
            ..Record::default()
        })
    }

    /// Decodes a record back into its registered event type.
    pub fn decode(&self, record: &Record) -> Result<Box<dyn Any + Send>> {
        let decode = self.decoders.get(&record.record_type).ok_or_else(|| {
            Error::Decode(format!(
                "no decoder registered for type '{}'",
                record.record_type
            ))
        })?;
        decode(&record.data)
    }

    /// Decodes a record directly into a concrete type.
    pub fn decode_as<T>(&self, record: &Record) -> Result<T>
    where
        T: Any,
    {
        self.decode(record)?
            .downcast::<T>()
            .map(|event| *event)
            .map_err(|_| {
                Error::Decode(format!(
                    "record type '{}' does not decode to the requested type",
                    record.record_type
                ))
            })
    }
}

// =============================================================================
// Tests
// =============================================================================
