//! Store configuration.

use crate::error::{Result, StoreError};
use crate::schema::Schema;
use crate::types::PayloadEncoding;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long snapshots live and how many superseded versions are kept.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Expiration applied to snapshots created without an explicit one.
    #[serde(with = "opt_duration_ms", rename = "retention_period_ms")]
    pub retention_period: Option<Duration>,

    /// Whether expiration sweeps remove expired snapshots.
    pub cleanup_on_expiration: bool,

    /// Superseded versions kept per snapshot (None = all).
    pub max_versions: Option<usize>,
}

/// Blueprint for a snapshot store.
///
/// A store keeps its own copy; the same config can be used as a template for
/// any number of stores.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotStoreConfig {
    /// Key the store is registered under.
    pub store_id: String,

    /// Explicit category label for the store.
    pub category: Option<String>,

    pub schema: Schema,

    pub retention_policy: RetentionPolicy,

    /// Write every committed version through to the persistence backend.
    pub auto_save: bool,

    /// Period of background sync and expiration sweeps (None = manual).
    #[serde(with = "opt_duration_ms", rename = "sync_interval_ms")]
    pub sync_interval: Option<Duration>,

    /// Maximum number of live snapshots.
    pub snapshot_limit: Option<usize>,

    /// Encoding of persisted payload blobs.
    pub encoding: PayloadEncoding,

    /// Buffer size of channel subscribers.
    /// Default: 1000
    pub notification_buffer: usize,
}

impl Default for SnapshotStoreConfig {
    fn default() -> Self {
        Self {
            store_id: "default".to_string(),
            category: None,
            schema: Schema::default(),
            retention_policy: RetentionPolicy::default(),
            auto_save: false,
            sync_interval: None,
            snapshot_limit: None,
            encoding: PayloadEncoding::Json,
            notification_buffer: 1000,
        }
    }
}

impl SnapshotStoreConfig {
    pub fn new(store_id: impl Into<String>) -> Self {
        Self {
            store_id: store_id.into(),
            ..Default::default()
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_retention(mut self, policy: RetentionPolicy) -> Self {
        self.retention_policy = policy;
        self
    }

    pub fn with_auto_save(mut self, auto_save: bool) -> Self {
        self.auto_save = auto_save;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    pub fn with_snapshot_limit(mut self, limit: usize) -> Self {
        self.snapshot_limit = Some(limit);
        self
    }

    pub fn with_encoding(mut self, encoding: PayloadEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Parse a config from JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.store_id.trim().is_empty() {
            return Err(StoreError::InvalidConfig("store_id must not be empty".into()));
        }
        if matches!(self.category.as_deref(), Some(c) if c.trim().is_empty()) {
            return Err(StoreError::InvalidConfig("category must not be blank".into()));
        }
        if self.snapshot_limit == Some(0) {
            return Err(StoreError::InvalidConfig("snapshot_limit must be positive".into()));
        }
        if self.sync_interval == Some(Duration::ZERO) {
            return Err(StoreError::InvalidConfig("sync_interval must be positive".into()));
        }
        if self.retention_policy.retention_period == Some(Duration::ZERO) {
            return Err(StoreError::InvalidConfig(
                "retention_period must be positive".into(),
            ));
        }
        if self.notification_buffer == 0 {
            return Err(StoreError::InvalidConfig(
                "notification_buffer must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Optional durations as whole milliseconds.
mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldSchema, FieldType};

    #[test]
    fn test_default_is_valid() {
        assert!(SnapshotStoreConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_json() {
        let config = SnapshotStoreConfig::from_json(
            r#"{
                "store_id": "orders",
                "category": "orders",
                "schema": {"total": {"type": "number", "required": true}},
                "retention_policy": {"retention_period_ms": 60000, "cleanup_on_expiration": true},
                "auto_save": true,
                "sync_interval_ms": 250,
                "encoding": "message_pack"
            }"#,
        )
        .unwrap();

        assert_eq!(config.store_id, "orders");
        assert_eq!(
            config.schema.fields.get("total"),
            Some(&FieldSchema::required(FieldType::Number))
        );
        assert_eq!(
            config.retention_policy.retention_period,
            Some(Duration::from_secs(60))
        );
        assert!(config.retention_policy.cleanup_on_expiration);
        assert_eq!(config.sync_interval, Some(Duration::from_millis(250)));
        assert_eq!(config.encoding, PayloadEncoding::MessagePack);
        assert_eq!(config.notification_buffer, 1000);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            SnapshotStoreConfig::new("  ").validate(),
            Err(StoreError::InvalidConfig(_))
        ));
        assert!(SnapshotStoreConfig::new("s").with_snapshot_limit(0).validate().is_err());
        assert!(SnapshotStoreConfig::new("s")
            .with_sync_interval(Duration::ZERO)
            .validate()
            .is_err());
        assert!(SnapshotStoreConfig::from_json("{\"store_id\": 3}").is_err());
    }

    #[test]
    fn test_json_roundtrip_keeps_template() {
        let config = SnapshotStoreConfig::new("audit")
            .with_category("audit")
            .with_sync_interval(Duration::from_secs(5));
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(SnapshotStoreConfig::from_json(&json).unwrap(), config);
    }
}
