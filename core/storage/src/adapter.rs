//! Store adapter trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mirrorsync_common::{Change, ChangeSet, Result, SchemaMapping};

/// Boundary between the sync core and one concrete record store.
///
/// The core only ever asks a store for "everything changed after this
/// instant" and tells it to write a record. Implementations own their
/// connection handling, timeouts and pagination.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Get the adapter name used in logs and errors (e.g., "sqlite", "elasticsearch").
    fn name(&self) -> &str;

    /// Schema this adapter reads and writes.
    fn schema(&self) -> &SchemaMapping;

    /// Fetch every record whose modification time is strictly after `cutoff`.
    ///
    /// # Postconditions
    /// - The result is complete; paginated backends are exhausted
    /// - Ordering carries no meaning
    ///
    /// # Errors
    /// - `Error::Fetch`, flagged transient when a later attempt may succeed
    async fn fetch_changes_since(&self, cutoff: DateTime<Utc>) -> Result<ChangeSet>;

    /// Create or overwrite a record with this exact version.
    ///
    /// # Postconditions
    /// - The stored record carries `change`'s timestamp and every mirrored field
    /// - Repeating the call with the same change leaves the same state
    ///
    /// # Errors
    /// - `Error::Write`, flagged transient when a later attempt may succeed
    async fn upsert(&self, change: &Change) -> Result<()>;
}
