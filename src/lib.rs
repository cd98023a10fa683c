//! # tidelog — Append-Only Event Store
//!
//! tidelog is a log-structured event store built on SQLite. Records belong to
//! named streams, every record also lands in the globally ordered `$all`
//! view, writers are serialized with optimistic concurrency per stream, and
//! readers get lazy range reads plus catch-up-then-follow live
//! subscriptions. A hypermedia HTTP feed with ETag long-polling makes stores
//! replicable over plain HTTP.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     HTTP Surface                                │
//! │        server (feed pages, long-poll)   streamer (remote read)  │
//! └───────────────┬─────────────────────────────────┬───────────────┘
//!                 │                                 │
//!                 ▼                                 ▼
//! ┌─────────────────────────────────┐   ┌───────────────────────────┐
//! │           Store API             │   │   feeder / hypermedia     │
//! │  version · load · append ·      │   │   (paged link views)      │
//! │  subscribe                      │   └───────────────────────────┘
//! └───────┬─────────────────┬───────┘
//!         │                 │
//!         ▼                 ▼
//! ┌───────────────┐ ┌───────────────────────────────┐
//! │  BasicStore   │ │  ChunkedStore                 │
//! │  one SQLite   │ │  index.db + NNNNNNNNNN.db     │
//! │  file         │ │  fixed-span shards            │
//! └───────────────┘ └───────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. Within every stream, record indices form the gap-free range
//!    `[0, version)`.
//! 2. The store-wide position is gap-free and totally orders all records by
//!    append time.
//! 3. Origin coordinates never change, whichever view a record is read
//!    through.
//! 4. An append is accepted only when the caller's expected version matches;
//!    a rejected append changes nothing.
//! 5. Committed records are never mutated or deleted.
//!
//! ## Module Organization
//!
//! - [`record`]: the record model, record streams, partitioning
//! - [`error`]: the crate-wide error enum
//! - [`store`]: the backend-independent store contract
//! - [`basic`] / [`chunked`]: the two storage backends
//! - [`subscription`]: catch-up + follow live views
//! - [`pubsub`]: the process-local append notification bus
//! - [`codec`]: typed events ↔ records
//! - [`hypermedia`] / [`feeder`]: paged link-annotated feed views
//! - [`server`] / [`streamer`]: HTTP feed surface and remote reader
//! - [`replicate`]: feed-to-store replication

pub mod basic;
pub mod chunked;
pub mod codec;
pub mod error;
pub mod feeder;
pub mod hypermedia;
pub mod pubsub;
pub mod record;
pub mod replicate;
mod schema;
pub mod server;
pub mod store;
pub mod streamer;
pub mod subscription;

pub use basic::BasicStore;
pub use chunked::ChunkedStore;
pub use codec::Codec;
pub use error::{Error, Result};
pub use feeder::Feeder;
pub use record::{partition_by_origin_stream, Record, RecordStream, Records, ALL};
pub use store::{open, Slice, Store, TOPIC_APPEND};
pub use streamer::Streamer;
pub use subscription::Subscription;
