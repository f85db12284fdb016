//! Store adapter abstraction for MirrorSync.
//!
//! This module provides a trait-based interface over the two record stores
//! being kept in sync, concrete adapters for SQLite, Elasticsearch and
//! memory, and a registry for building adapters from configuration.
//!
//! # Design Principles
//! - Store isolation: no store-specific logic in the sync core
//! - Async operations: all I/O operations are async
//! - Complete windows: adapters exhaust pagination before returning
//! - Unified error semantics: fetch and write failures carry a transient flag

pub mod adapter;
pub mod elastic;
pub mod memory;
pub mod registry;
pub mod sqlite;

pub use adapter::StoreAdapter;
pub use elastic::{ElasticConfig, ElasticStore};
pub use memory::MemoryStore;
pub use registry::{create_default_registry, AdapterFactory, AdapterRegistry};
pub use sqlite::SqliteStore;
