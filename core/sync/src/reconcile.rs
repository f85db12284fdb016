//! Two-directional reconciliation of one sync pass.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use mirrorsync_common::{ChangeSet, Error, Result};
use mirrorsync_storage::StoreAdapter;

use crate::conflict::decide;

/// Which way a record travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    PrimaryToSecondary,
    SecondaryToPrimary,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::PrimaryToSecondary => write!(f, "primary->secondary"),
            Direction::SecondaryToPrimary => write!(f, "secondary->primary"),
        }
    }
}

/// Outcome of a completed sync pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    /// Records the primary store returned for the window.
    pub primary_changes: usize,
    /// Records the secondary store returned for the window.
    pub secondary_changes: usize,
    pub written_to_primary: usize,
    pub written_to_secondary: usize,
    /// Candidates the other side already held at the same or a newer version.
    pub skipped: usize,
    pub duration: Duration,
}

impl SyncReport {
    /// Total writes in both directions.
    pub fn writes(&self) -> usize {
        self.written_to_primary + self.written_to_secondary
    }
}

#[derive(Default)]
struct WriteTally {
    skipped: usize,
    attempted: usize,
    failed: usize,
    first_error: Option<Error>,
}

/// Run one sync pass between two stores.
///
/// Both stores are asked for everything changed after `cutoff`. Each record
/// from the primary window is written to the secondary when the secondary
/// window lacks it or holds an older version, and the same in the other
/// direction. A record is only ever written into the side it is missing
/// from or stale in.
///
/// # Errors
/// - Any fetch error, returned before a single write is issued
/// - `PartialPass` when writes failed; every other comparison still ran
///
/// Nothing survives the pass. A failed write is picked up again only if the
/// record is still inside the window of a later pass.
pub async fn sync<P, S>(primary: &P, secondary: &S, cutoff: DateTime<Utc>) -> Result<SyncReport>
where
    P: StoreAdapter + ?Sized,
    S: StoreAdapter + ?Sized,
{
    let start = Instant::now();
    debug!(
        primary = primary.name(),
        secondary = secondary.name(),
        cutoff = %cutoff,
        "Starting sync pass"
    );

    let (changes_primary, changes_secondary) = futures::try_join!(
        primary.fetch_changes_since(cutoff),
        secondary.fetch_changes_since(cutoff)
    )
    .map_err(|e| {
        error!("Sync pass abandoned, fetch failed: {}", e);
        e
    })?;

    let mut tally = WriteTally::default();

    let written_to_secondary = write_missing_or_stale(
        secondary,
        &changes_primary,
        &changes_secondary,
        Direction::PrimaryToSecondary,
        &mut tally,
    )
    .await;

    let written_to_primary = write_missing_or_stale(
        primary,
        &changes_secondary,
        &changes_primary,
        Direction::SecondaryToPrimary,
        &mut tally,
    )
    .await;

    let report = SyncReport {
        primary_changes: changes_primary.len(),
        secondary_changes: changes_secondary.len(),
        written_to_primary,
        written_to_secondary,
        skipped: tally.skipped,
        duration: start.elapsed(),
    };

    if let Some(first) = tally.first_error {
        warn!(
            "Sync pass finished with {} of {} writes failed",
            tally.failed, tally.attempted
        );
        return Err(Error::PartialPass {
            failed: tally.failed,
            attempted: tally.attempted,
            first: Box::new(first),
        });
    }

    info!(
        "Sync pass completed in {:?}: {} fetched from primary, {} from secondary, {} written to primary, {} to secondary, {} skipped",
        report.duration,
        report.primary_changes,
        report.secondary_changes,
        report.written_to_primary,
        report.written_to_secondary,
        report.skipped
    );

    Ok(report)
}

/// Write every candidate the target's own window lacks or holds older.
/// Returns the number of successful writes in this direction.
async fn write_missing_or_stale<T: StoreAdapter + ?Sized>(
    target: &T,
    candidates: &ChangeSet,
    target_window: &ChangeSet,
    direction: Direction,
    tally: &mut WriteTally,
) -> usize {
    let mut written = 0;

    for candidate in candidates {
        let existing = target_window.find(candidate);
        let decision = decide(candidate, existing);

        debug!(
            id = %candidate.id(),
            %direction,
            ?decision,
            "Compared record"
        );

        if !decision.should_write() {
            tally.skipped += 1;
            continue;
        }

        tally.attempted += 1;
        match target.upsert(candidate).await {
            Ok(()) => written += 1,
            Err(e) => {
                error!("Failed to write {} ({}): {}", candidate.id(), direction, e);
                tally.failed += 1;
                tally.first_error.get_or_insert(e);
            }
        }
    }

    written
}

/// Sync pass bound to a fixed pair of stores.
pub struct Reconciler {
    primary: Arc<dyn StoreAdapter>,
    secondary: Arc<dyn StoreAdapter>,
}

impl Reconciler {
    /// Pair two stores.
    ///
    /// # Errors
    /// - `Config` if either schema is invalid
    /// - `SchemaMismatch` if the stores disagree on identity, timestamp or
    ///   mirrored fields
    pub fn new(primary: Arc<dyn StoreAdapter>, secondary: Arc<dyn StoreAdapter>) -> Result<Self> {
        primary.schema().validate()?;
        secondary.schema().validate()?;
        primary.schema().ensure_matches(secondary.schema())?;

        Ok(Self { primary, secondary })
    }

    /// Run one pass for the given cutoff.
    pub async fn run(&self, cutoff: DateTime<Utc>) -> Result<SyncReport> {
        sync(self.primary.as_ref(), self.secondary.as_ref(), cutoff).await
    }

    /// The primary store.
    pub fn primary(&self) -> &Arc<dyn StoreAdapter> {
        &self.primary
    }

    /// The secondary store.
    pub fn secondary(&self) -> &Arc<dyn StoreAdapter> {
        &self.secondary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use mirrorsync_common::{Change, FieldValue, RecordId, SchemaMapping};
    use mirrorsync_storage::{MemoryStore, SqliteStore};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 5, 8, 23, minute, 0).unwrap()
    }

    fn record(id: &str, minute: u32) -> Change {
        Change::new(RecordId::new(id).unwrap(), at(minute))
    }

    fn stores() -> (MemoryStore, MemoryStore) {
        let schema = SchemaMapping::new("id", "insertion", ["title"]);
        (
            MemoryStore::new("primary", schema.clone()),
            MemoryStore::new("secondary", schema),
        )
    }

    /// Memory store that can be told to fail fetches or writes of given ids.
    struct FlakyStore {
        inner: MemoryStore,
        fail_fetch: bool,
        failing_ids: HashSet<String>,
        upsert_calls: AtomicUsize,
    }

    impl FlakyStore {
        fn new(inner: MemoryStore) -> Self {
            Self {
                inner,
                fail_fetch: false,
                failing_ids: HashSet::new(),
                upsert_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StoreAdapter for FlakyStore {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn schema(&self) -> &SchemaMapping {
            self.inner.schema()
        }

        async fn fetch_changes_since(&self, cutoff: DateTime<Utc>) -> Result<ChangeSet> {
            if self.fail_fetch {
                return Err(Error::fetch_transient(self.name(), "connection refused"));
            }
            self.inner.fetch_changes_since(cutoff).await
        }

        async fn upsert(&self, change: &Change) -> Result<()> {
            self.upsert_calls.fetch_add(1, Ordering::SeqCst);
            if self.failing_ids.contains(change.id().as_str()) {
                return Err(Error::write_transient(self.name(), change.id().as_str(), "timeout"));
            }
            self.inner.upsert(change).await
        }
    }

    #[tokio::test]
    async fn test_missing_record_is_copied_to_secondary() {
        let (primary, secondary) = stores();
        primary.seed(record("1", 9)).unwrap();

        let report = sync(&primary, &secondary, at(0)).await.unwrap();

        let writes = secondary.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].id().as_str(), "1");
        assert_eq!(writes[0].modified_at(), at(9));
        assert!(primary.writes().is_empty());
        assert_eq!(report.written_to_secondary, 1);
        assert_eq!(report.written_to_primary, 0);
    }

    #[tokio::test]
    async fn test_newer_secondary_overwrites_primary() {
        let (primary, secondary) = stores();
        primary.seed(record("1", 9)).unwrap();
        secondary.seed(record("1", 10)).unwrap();

        let report = sync(&primary, &secondary, at(0)).await.unwrap();

        let writes = primary.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].modified_at(), at(10));
        assert!(secondary.writes().is_empty());
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_newer_primary_overwrites_secondary() {
        let (primary, secondary) = stores();
        primary.seed(record("1", 12).with_field("title", "new")).unwrap();
        secondary.seed(record("1", 10).with_field("title", "old")).unwrap();

        sync(&primary, &secondary, at(0)).await.unwrap();

        let stored = secondary.get(&RecordId::new("1").unwrap()).unwrap();
        assert_eq!(stored.modified_at(), at(12));
        assert_eq!(stored.field("title"), Some(&FieldValue::from("new")));
        assert!(primary.writes().is_empty());
    }

    #[tokio::test]
    async fn test_tie_writes_nothing() {
        let (primary, secondary) = stores();
        primary.seed(record("1", 9).with_field("title", "a")).unwrap();
        secondary.seed(record("1", 9).with_field("title", "b")).unwrap();

        let report = sync(&primary, &secondary, at(0)).await.unwrap();

        assert_eq!(report.writes(), 0);
        assert_eq!(report.skipped, 2);
        assert!(primary.writes().is_empty());
        assert!(secondary.writes().is_empty());
    }

    #[tokio::test]
    async fn test_submillisecond_timestamp_copied_once() {
        let (primary, _) = stores();
        let secondary = SqliteStore::open_in_memory(
            "records",
            SchemaMapping::new("id", "insertion", ["title"]),
        )
        .unwrap();
        let precise = at(9) + chrono::TimeDelta::microseconds(123_456);
        primary
            .seed(Change::new(RecordId::new("1").unwrap(), precise).with_field("title", "a"))
            .unwrap();

        let first = sync(&primary, &secondary, at(0)).await.unwrap();
        let second = sync(&primary, &secondary, at(0)).await.unwrap();
        let third = sync(&primary, &secondary, at(0)).await.unwrap();

        assert_eq!(first.written_to_secondary, 1);
        assert_eq!(second.writes(), 0);
        assert_eq!(third.writes(), 0);
        assert!(primary.writes().is_empty());
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        let (primary, secondary) = stores();
        primary.seed(record("1", 9)).unwrap();
        primary.seed(record("2", 11)).unwrap();
        secondary.seed(record("2", 10)).unwrap();
        secondary.seed(record("3", 12)).unwrap();

        let first = sync(&primary, &secondary, at(0)).await.unwrap();
        assert_eq!(first.written_to_secondary, 2);
        assert_eq!(first.written_to_primary, 1);

        primary.clear_writes();
        secondary.clear_writes();
        let second = sync(&primary, &secondary, at(0)).await.unwrap();

        assert_eq!(second.writes(), 0);
        assert!(primary.writes().is_empty());
        assert!(secondary.writes().is_empty());
    }

    #[tokio::test]
    async fn test_records_outside_window_untouched() {
        let (primary, secondary) = stores();
        primary.seed(record("1", 5)).unwrap();
        secondary.seed(record("1", 5)).unwrap();
        // Only on one side, but older than the cutoff.
        primary.seed(record("2", 4)).unwrap();

        let report = sync(&primary, &secondary, at(6)).await.unwrap();

        assert_eq!(report.primary_changes, 0);
        assert_eq!(report.secondary_changes, 0);
        assert!(primary.writes().is_empty());
        assert!(secondary.writes().is_empty());
    }

    #[tokio::test]
    async fn test_record_at_cutoff_is_excluded() {
        let (primary, secondary) = stores();
        primary.seed(record("1", 6)).unwrap();

        let report = sync(&primary, &secondary, at(6)).await.unwrap();
        assert_eq!(report.writes(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_writes_nothing() {
        let (primary, secondary) = stores();
        primary.seed(record("1", 9)).unwrap();
        let mut secondary = FlakyStore::new(secondary);
        secondary.fail_fetch = true;

        let result = sync(&primary, &secondary, at(0)).await;

        assert!(matches!(result, Err(Error::Fetch { .. })));
        assert_eq!(secondary.upsert_calls.load(Ordering::SeqCst), 0);
        assert!(primary.writes().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_completes_pass() {
        let (primary, secondary) = stores();
        primary.seed(record("1", 9)).unwrap();
        primary.seed(record("2", 9)).unwrap();
        primary.seed(record("3", 9)).unwrap();
        secondary.seed(record("4", 10)).unwrap();

        let mut secondary = FlakyStore::new(secondary);
        secondary.failing_ids.insert("2".to_string());

        let result = sync(&primary, &secondary, at(0)).await;

        match result {
            Err(Error::PartialPass {
                failed,
                attempted,
                first,
            }) => {
                assert_eq!(failed, 1);
                assert_eq!(attempted, 4);
                assert!(first.is_transient());
            }
            other => panic!("expected partial pass, got {:?}", other),
        }

        assert_eq!(secondary.upsert_calls.load(Ordering::SeqCst), 3);
        assert!(secondary.inner.get(&RecordId::new("1").unwrap()).is_some());
        assert!(secondary.inner.get(&RecordId::new("2").unwrap()).is_none());
        assert!(secondary.inner.get(&RecordId::new("3").unwrap()).is_some());
        // The other direction still ran.
        assert_eq!(primary.writes().len(), 1);
    }

    #[test]
    fn test_reconciler_rejects_schema_mismatch() {
        let primary = Arc::new(MemoryStore::new(
            "primary",
            SchemaMapping::new("id", "insertion", ["title", "body"]),
        ));
        let secondary = Arc::new(MemoryStore::new(
            "secondary",
            SchemaMapping::new("id", "insertion", ["title"]),
        ));

        let result = Reconciler::new(primary, secondary);
        assert!(matches!(result, Err(Error::SchemaMismatch(_))));
    }

    #[test]
    fn test_reconciler_rejects_invalid_secondary_schema() {
        let primary = Arc::new(MemoryStore::new(
            "primary",
            SchemaMapping::new("id", "insertion", ["title"]),
        ));
        let secondary = Arc::new(MemoryStore::new(
            "secondary",
            SchemaMapping::new("id", "insertion", ["title", "title"]),
        ));

        let result = Reconciler::new(primary, secondary);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_reconciler_runs_pass() {
        let primary = Arc::new(MemoryStore::new("primary", SchemaMapping::default()));
        let secondary = Arc::new(MemoryStore::new("secondary", SchemaMapping::default()));
        primary.seed(record("1", 9)).unwrap();

        let reconciler = Reconciler::new(primary.clone(), secondary.clone()).unwrap();
        let report = reconciler.run(at(0)).await.unwrap();

        assert_eq!(report.primary_changes, 1);
        assert_eq!(report.written_to_secondary, 1);
        assert_eq!(report.writes(), 1);
        assert_eq!(secondary.writes().len(), 1);
        assert!(primary.writes().is_empty());
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(Direction::PrimaryToSecondary.to_string(), "primary->secondary");
        assert_eq!(Direction::SecondaryToPrimary.to_string(), "secondary->primary");
    }
}
