//! Adapter registry for building stores from configuration.

use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::adapter::StoreAdapter;
use crate::elastic::{ElasticConfig, ElasticStore};
use crate::memory::MemoryStore;
use crate::sqlite::SqliteStore;
use mirrorsync_common::{Error, Result, SchemaMapping};

/// Factory function type for creating adapters.
pub type AdapterFactory =
    Box<dyn Fn(SchemaMapping, Value) -> Result<Arc<dyn StoreAdapter>> + Send + Sync>;

/// Registry for store adapter factories.
///
/// Resolves an adapter kind named in configuration (e.g. "sqlite") plus its
/// options into a ready-to-use adapter.
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register an adapter factory.
    ///
    /// # Errors
    /// - Returns error if the kind is already registered
    pub fn register(&mut self, kind: impl Into<String>, factory: AdapterFactory) -> Result<()> {
        let kind = kind.into();
        if self.factories.contains_key(&kind) {
            return Err(Error::AlreadyExists(format!(
                "Adapter '{}' is already registered",
                kind
            )));
        }
        self.factories.insert(kind, factory);
        Ok(())
    }

    /// Build an adapter of the given kind.
    ///
    /// # Errors
    /// - `Config` if the kind is unknown or the options are invalid
    pub fn resolve(
        &self,
        kind: &str,
        schema: SchemaMapping,
        options: Value,
    ) -> Result<Arc<dyn StoreAdapter>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| Error::Config(format!("Unknown adapter kind '{}'", kind)))?;
        factory(schema, options)
    }

    /// Get list of registered adapter kinds.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Check if an adapter kind is registered.
    pub fn has_kind(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SqliteOptions {
    path: PathBuf,
    #[serde(default = "default_table")]
    table: String,
}

fn default_table() -> String {
    "records".to_string()
}

#[derive(Debug, Default, Deserialize)]
struct MemoryOptions {
    #[serde(default)]
    name: Option<String>,
}

fn parse_options<T: serde::de::DeserializeOwned>(kind: &str, options: Value) -> Result<T> {
    // A missing options block reads as an empty object.
    let options = if options.is_null() {
        Value::Object(Default::default())
    } else {
        options
    };
    serde_json::from_value(options)
        .map_err(|e| Error::Config(format!("Invalid {} options: {}", kind, e)))
}

/// Create a registry with the built-in adapters: `memory`, `sqlite` and `elasticsearch`.
pub fn create_default_registry() -> Result<AdapterRegistry> {
    let mut registry = AdapterRegistry::new();

    registry.register(
        "memory",
        Box::new(|schema, options| {
            let options: MemoryOptions = parse_options("memory", options)?;
            schema.validate()?;
            let name = options.name.unwrap_or_else(|| "memory".to_string());
            Ok(Arc::new(MemoryStore::new(name, schema)))
        }),
    )?;

    registry.register(
        "sqlite",
        Box::new(|schema, options| {
            let options: SqliteOptions = parse_options("sqlite", options)?;
            Ok(Arc::new(SqliteStore::open(
                &options.path,
                options.table,
                schema,
            )?))
        }),
    )?;

    registry.register(
        "elasticsearch",
        Box::new(|schema, options| {
            let config: ElasticConfig = parse_options("elasticsearch", options)?;
            Ok(Arc::new(ElasticStore::new(config, schema)?))
        }),
    )?;

    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(
                "test",
                Box::new(|schema, _| Ok(Arc::new(MemoryStore::new("test", schema)))),
            )
            .unwrap();

        let adapter = registry
            .resolve("test", SchemaMapping::default(), Value::Null)
            .unwrap();
        assert_eq!(adapter.name(), "test");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = AdapterRegistry::new();
        registry
            .register("test", Box::new(|s, _| Ok(Arc::new(MemoryStore::new("a", s)))))
            .unwrap();

        let result =
            registry.register("test", Box::new(|s, _| Ok(Arc::new(MemoryStore::new("b", s)))));
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = AdapterRegistry::new();
        let result = registry.resolve("cassandra", SchemaMapping::default(), Value::Null);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_default_registry_kinds() {
        let registry = create_default_registry().unwrap();
        assert_eq!(registry.kinds(), vec!["elasticsearch", "memory", "sqlite"]);
        assert!(registry.has_kind("sqlite"));
    }

    #[test]
    fn test_default_registry_builds_memory_and_elastic() {
        let registry = create_default_registry().unwrap();
        let schema = SchemaMapping::new("id", "insertion", ["title"]);

        let memory = registry
            .resolve("memory", schema.clone(), json!({ "name": "scratch" }))
            .unwrap();
        assert_eq!(memory.name(), "scratch");

        let elastic = registry
            .resolve(
                "elasticsearch",
                schema,
                json!({ "url": "http://localhost:9200", "index": "records" }),
            )
            .unwrap();
        assert_eq!(elastic.name(), "elasticsearch:records");
    }

    #[test]
    fn test_default_registry_builds_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = create_default_registry().unwrap();

        let adapter = registry
            .resolve(
                "sqlite",
                SchemaMapping::default(),
                json!({ "path": dir.path().join("records.db") }),
            )
            .unwrap();
        assert_eq!(adapter.name(), "sqlite:records");
    }

    #[test]
    fn test_invalid_options_are_config_errors() {
        let registry = create_default_registry().unwrap();
        let result = registry.resolve("sqlite", SchemaMapping::default(), json!({ "table": "x" }));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
