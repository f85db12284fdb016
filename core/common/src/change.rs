//! Versioned records and the per-fetch collections they travel in.

use chrono::{DateTime, SubsecRound, Utc};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::types::{FieldValue, Fields, RecordId};

/// One version of a record as read from a store.
///
/// Modification times are kept at millisecond precision, the finest both
/// stores can hold, so a copied record compares equal to its source.
///
/// Two changes are equal when they name the same record, whatever their
/// timestamps or field values. Which version wins is decided by
/// [`Change::is_newer_than`], not by equality.
#[derive(Debug, Clone)]
pub struct Change {
    id: RecordId,
    modified_at: DateTime<Utc>,
    fields: Fields,
}

impl Change {
    /// Create a change with no mirrored fields.
    pub fn new(id: RecordId, modified_at: DateTime<Utc>) -> Self {
        Self {
            id,
            modified_at: modified_at.trunc_subsecs(3),
            fields: Fields::new(),
        }
    }

    /// Create a change carrying the given field values.
    pub fn with_fields(id: RecordId, modified_at: DateTime<Utc>, fields: Fields) -> Self {
        Self {
            id,
            modified_at: modified_at.trunc_subsecs(3),
            fields,
        }
    }

    /// Attach a field value while building the change.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Identity of the record.
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    /// When the store last wrote this record.
    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    /// All mirrored field values.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Value of a single field, if present.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Strictly newer than `other`. Equal timestamps are not newer.
    pub fn is_newer_than(&self, other: &Change) -> bool {
        self.modified_at > other.modified_at
    }
}

impl PartialEq for Change {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Change {}

impl Hash for Change {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// The changes one store returned for one sync pass.
///
/// Built once per fetch and read-only afterwards. Lookups go through an
/// identity index. If a store hands back the same identity twice, the entry
/// seen last replaces the earlier one in place.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    changes: Vec<Change>,
    index: HashMap<RecordId, usize>,
}

impl ChangeSet {
    /// Create an empty change set.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, change: Change) {
        match self.index.get(change.id()) {
            Some(&pos) => self.changes[pos] = change,
            None => {
                self.index.insert(change.id().clone(), self.changes.len());
                self.changes.push(change);
            }
        }
    }

    /// Find the entry describing the same record as `candidate`.
    pub fn find(&self, candidate: &Change) -> Option<&Change> {
        self.get(candidate.id())
    }

    /// Find the entry for an identity.
    pub fn get(&self, id: &RecordId) -> Option<&Change> {
        self.index.get(id).map(|&pos| &self.changes[pos])
    }

    /// Number of distinct records.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Iterate in first-seen order.
    pub fn iter(&self) -> std::slice::Iter<'_, Change> {
        self.changes.iter()
    }
}

impl FromIterator<Change> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = Change>>(iter: I) -> Self {
        let mut set = ChangeSet::new();
        for change in iter {
            set.push(change);
        }
        set
    }
}

impl From<Vec<Change>> for ChangeSet {
    fn from(changes: Vec<Change>) -> Self {
        changes.into_iter().collect()
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = &'a Change;
    type IntoIter = std::slice::Iter<'a, Change>;

    fn into_iter(self) -> Self::IntoIter {
        self.changes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 5, 8, 23, minute, 0).unwrap()
    }

    fn change(id: &str, minute: u32) -> Change {
        Change::new(RecordId::new(id).unwrap(), at(minute))
    }

    #[test]
    fn test_modified_at_truncated_to_millis() {
        let precise = at(9) + chrono::TimeDelta::microseconds(123_456);

        let plain = Change::new(RecordId::new("1").unwrap(), precise);
        let with_fields = Change::with_fields(RecordId::new("1").unwrap(), precise, Fields::new());

        let expected = at(9) + chrono::TimeDelta::milliseconds(123);
        assert_eq!(plain.modified_at(), expected);
        assert_eq!(with_fields.modified_at(), expected);
        assert!(!plain.is_newer_than(&with_fields));
    }

    #[test]
    fn test_field_access() {
        let change = change("1", 9)
            .with_field("title", "Hello World")
            .with_field("body", "Lorem");

        assert_eq!(
            change.field("title"),
            Some(&FieldValue::Text("Hello World".to_string()))
        );
        assert_eq!(change.field("body"), Some(&FieldValue::Text("Lorem".to_string())));
        assert_eq!(change.field("missing"), None);
    }

    #[test]
    fn test_fresh_fields_per_instance() {
        let first = change("1", 9).with_field("title", "a");
        let second = change("2", 9);
        assert_eq!(first.fields().len(), 1);
        assert!(second.fields().is_empty());
    }

    #[test]
    fn test_equality_is_identity_only() {
        let older = change("1", 9).with_field("title", "old");
        let newer = change("1", 10).with_field("title", "new");
        assert_eq!(older, newer);
        assert_ne!(change("1", 9), change("2", 9));
    }

    #[test]
    fn test_is_newer_than_is_strict() {
        assert!(change("1", 10).is_newer_than(&change("1", 9)));
        assert!(!change("1", 9).is_newer_than(&change("1", 10)));
        assert!(!change("1", 9).is_newer_than(&change("1", 9)));
    }

    #[test]
    fn test_find_by_identity() {
        let set: ChangeSet = vec![change("1", 9), change("2", 10)].into();
        let probe = change("2", 30);

        let found = set.find(&probe).unwrap();
        assert_eq!(found.modified_at(), at(10));
        assert!(set.find(&change("3", 9)).is_none());
    }

    #[test]
    fn test_duplicate_identity_last_seen_wins() {
        let set: ChangeSet = vec![change("1", 9), change("2", 5), change("1", 12)].into();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get(&RecordId::new("1").unwrap()).unwrap().modified_at(), at(12));

        let order: Vec<&str> = set.iter().map(|c| c.id().as_str()).collect();
        assert_eq!(order, vec!["1", "2"]);
    }

    #[test]
    fn test_empty_set() {
        let set = ChangeSet::new();
        assert!(set.is_empty());
        assert!(set.find(&change("1", 9)).is_none());
    }

    proptest! {
        #[test]
        fn prop_every_member_is_found(ids in proptest::collection::vec(0u16..50, 0..40)) {
            let set: ChangeSet = ids
                .iter()
                .enumerate()
                .map(|(minute, id)| change(&id.to_string(), (minute % 60) as u32))
                .collect();

            let distinct: std::collections::HashSet<_> = ids.iter().collect();
            prop_assert_eq!(set.len(), distinct.len());

            for id in &ids {
                let probe = change(&id.to_string(), 0);
                let found = set.find(&probe);
                prop_assert!(found.is_some());
                prop_assert_eq!(found.unwrap().id().as_str(), id.to_string());
            }
        }
    }
}
