//! Sync configuration file.

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use mirrorsync_common::{Error, Result, SchemaMapping};
use mirrorsync_storage::{AdapterRegistry, StoreAdapter};

use crate::backoff::BackoffConfig;
use crate::driver::DriverConfig;
use crate::reconcile::Reconciler;

/// Which adapter backs a store, and its adapter-specific options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Adapter kind registered in the [`AdapterRegistry`].
    pub kind: String,
    #[serde(default)]
    pub options: Value,
}

impl StoreConfig {
    /// Create a store entry with no options.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            options: Value::Null,
        }
    }

    /// Set adapter options.
    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }
}

/// Top-level configuration of a mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Record layout shared by both stores.
    #[serde(flatten)]
    pub schema: SchemaMapping,
    /// Seconds between scheduled passes.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// How far back the first pass looks, in seconds.
    #[serde(default = "default_initial_lookback_seconds")]
    pub initial_lookback_seconds: u64,
    /// Overlap subtracted from every cutoff, in milliseconds.
    #[serde(default)]
    pub skew_allowance_millis: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_consecutive_failures: Option<u32>,
    #[serde(default)]
    pub backoff: BackoffConfig,
    pub primary: StoreConfig,
    pub secondary: StoreConfig,
}

fn default_poll_interval_seconds() -> u64 {
    1
}

fn default_initial_lookback_seconds() -> u64 {
    60
}

impl SyncConfig {
    /// Create a configuration with default timing.
    pub fn new(schema: SchemaMapping, primary: StoreConfig, secondary: StoreConfig) -> Self {
        Self {
            schema,
            poll_interval_seconds: default_poll_interval_seconds(),
            initial_lookback_seconds: default_initial_lookback_seconds(),
            skew_allowance_millis: 0,
            max_consecutive_failures: None,
            backoff: BackoffConfig::default(),
            primary,
            secondary,
        }
    }

    /// Read and validate a configuration file.
    ///
    /// # Errors
    /// - `Io` if the file cannot be read
    /// - `Config` if it is not valid JSON or fails validation
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {}", path.display());

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        info!(
            "Loaded configuration: {} -> {}",
            config.primary.kind, config.secondary.kind
        );
        Ok(config)
    }

    /// Parse and validate configuration JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Check timing values and the schema.
    pub fn validate(&self) -> Result<()> {
        self.schema.validate()?;

        if self.poll_interval_seconds == 0 {
            return Err(Error::Config(
                "pollIntervalSeconds must be greater than zero".to_string(),
            ));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(Error::Config(
                "backoff.multiplier must be at least 1".to_string(),
            ));
        }
        if self.max_consecutive_failures == Some(0) {
            return Err(Error::Config(
                "maxConsecutiveFailures must be greater than zero".to_string(),
            ));
        }
        for (role, store) in [("primary", &self.primary), ("secondary", &self.secondary)] {
            if store.kind.trim().is_empty() {
                return Err(Error::Config(format!("{} store kind is empty", role)));
            }
        }

        self.initial_lookback()?;
        self.skew_allowance()?;
        Ok(())
    }

    /// Look-back window of the first pass.
    pub fn initial_lookback(&self) -> Result<TimeDelta> {
        i64::try_from(self.initial_lookback_seconds)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| Error::Config("initialLookbackSeconds is out of range".to_string()))
    }

    /// Overlap subtracted from every cutoff.
    pub fn skew_allowance(&self) -> Result<TimeDelta> {
        i64::try_from(self.skew_allowance_millis)
            .ok()
            .and_then(TimeDelta::try_milliseconds)
            .ok_or_else(|| Error::Config("skewAllowanceMillis is out of range".to_string()))
    }

    /// Driver settings derived from this configuration.
    pub fn driver_config(&self) -> Result<DriverConfig> {
        Ok(DriverConfig {
            poll_interval: Duration::from_secs(self.poll_interval_seconds),
            backoff: self.backoff.clone(),
            initial_lookback: self.initial_lookback()?,
            skew_allowance: self.skew_allowance()?,
            max_consecutive_failures: self.max_consecutive_failures,
        })
    }

    /// Build both adapters through the registry.
    pub fn build_stores(
        &self,
        registry: &AdapterRegistry,
    ) -> Result<(Arc<dyn StoreAdapter>, Arc<dyn StoreAdapter>)> {
        let primary = registry.resolve(
            &self.primary.kind,
            self.schema.clone(),
            self.primary.options.clone(),
        )?;
        let secondary = registry.resolve(
            &self.secondary.kind,
            self.schema.clone(),
            self.secondary.options.clone(),
        )?;
        Ok((primary, secondary))
    }

    /// Build both adapters and pair them.
    pub fn build_reconciler(&self, registry: &AdapterRegistry) -> Result<Reconciler> {
        let (primary, secondary) = self.build_stores(registry)?;
        info!("Mirroring {} <-> {}", primary.name(), secondary.name());
        Reconciler::new(primary, secondary)
    }
}
