//! Tapeflow backend library.
//!
//! Real-time order-flow ingestion and distribution: per-venue ingestors,
//! a Redis-backed hot state store, derived analytics streams, and the
//! WebSocket gateway that multiplexes them to clients.

pub mod analytics;
pub mod broker;
pub mod config;
pub mod error;
pub mod exchanges;
pub mod gateway;
pub mod hotstore;
pub mod ingest;
pub mod models;
pub mod supervisor;

pub use broker::Broker;
pub use config::Config;
pub use error::{FeedError, FeedResult};
