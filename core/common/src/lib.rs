//! Common utilities and types shared across MirrorSync modules.
//!
//! This module provides the record model both stores agree on: identities,
//! field values, the schema mapping, and the change/change-set values a
//! sync pass compares.

pub mod change;
pub mod error;
pub mod schema;
pub mod types;

pub use change::{Change, ChangeSet};
pub use error::{Error, Result};
pub use schema::SchemaMapping;
pub use types::{FieldValue, Fields, RecordId};
