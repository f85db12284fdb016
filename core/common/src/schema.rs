//! Record schema shared by both stores.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{Error, Result};

/// How a store lays out a record: which field carries the identity, which
/// carries the modification timestamp, and which other fields are mirrored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaMapping {
    #[serde(default = "default_identity_field")]
    pub identity_field: String,
    #[serde(default = "default_timestamp_field")]
    pub timestamp_field: String,
    #[serde(default)]
    pub mirrored_fields: Vec<String>,
}

fn default_identity_field() -> String {
    "id".to_string()
}

fn default_timestamp_field() -> String {
    "insertion".to_string()
}

impl Default for SchemaMapping {
    fn default() -> Self {
        Self {
            identity_field: default_identity_field(),
            timestamp_field: default_timestamp_field(),
            mirrored_fields: Vec::new(),
        }
    }
}

impl SchemaMapping {
    /// Create a mapping with the given identity/timestamp fields and mirrored fields.
    pub fn new(
        identity_field: impl Into<String>,
        timestamp_field: impl Into<String>,
        mirrored_fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            identity_field: identity_field.into(),
            timestamp_field: timestamp_field.into(),
            mirrored_fields: mirrored_fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Check that the mapping is usable.
    ///
    /// Field names must be plain identifiers, so adapters may splice them
    /// into queries. Mirrored fields may not repeat or shadow the identity
    /// or timestamp field.
    ///
    /// # Errors
    /// - `Config` describing the first offending field
    pub fn validate(&self) -> Result<()> {
        check_identifier(&self.identity_field)?;
        check_identifier(&self.timestamp_field)?;

        if self.identity_field == self.timestamp_field {
            return Err(Error::Config(
                "Identity and timestamp fields must differ".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for field in &self.mirrored_fields {
            check_identifier(field)?;
            if field == &self.identity_field || field == &self.timestamp_field {
                return Err(Error::Config(format!(
                    "Mirrored field '{}' shadows the identity or timestamp field",
                    field
                )));
            }
            if !seen.insert(field.as_str()) {
                return Err(Error::Config(format!(
                    "Mirrored field '{}' listed twice",
                    field
                )));
            }
        }

        Ok(())
    }

    /// Ensure another store agrees on this schema.
    ///
    /// Mirrored fields are compared as a set; order does not matter.
    ///
    /// # Errors
    /// - `SchemaMismatch` naming the first difference
    pub fn ensure_matches(&self, other: &SchemaMapping) -> Result<()> {
        if self.identity_field != other.identity_field {
            return Err(Error::SchemaMismatch(format!(
                "identity field '{}' vs '{}'",
                self.identity_field, other.identity_field
            )));
        }
        if self.timestamp_field != other.timestamp_field {
            return Err(Error::SchemaMismatch(format!(
                "timestamp field '{}' vs '{}'",
                self.timestamp_field, other.timestamp_field
            )));
        }

        let ours: BTreeSet<&str> = self.mirrored_fields.iter().map(String::as_str).collect();
        let theirs: BTreeSet<&str> = other.mirrored_fields.iter().map(String::as_str).collect();
        if ours != theirs {
            let only_ours: Vec<&str> = ours.difference(&theirs).copied().collect();
            let only_theirs: Vec<&str> = theirs.difference(&ours).copied().collect();
            return Err(Error::SchemaMismatch(format!(
                "mirrored fields differ (only in first: {:?}, only in second: {:?})",
                only_ours, only_theirs
            )));
        }

        Ok(())
    }

    /// All column names a store holds for a record, identity and timestamp first.
    pub fn all_fields(&self) -> Vec<&str> {
        let mut fields = vec![self.identity_field.as_str(), self.timestamp_field.as_str()];
        fields.extend(self.mirrored_fields.iter().map(String::as_str));
        fields
    }
}

/// Whether `name` is a plain identifier (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn check_identifier(name: &str) -> Result<()> {
    if is_identifier(name) {
        Ok(())
    } else {
        Err(Error::Config(format!("Invalid field name: '{}'", name)))
    }
}
