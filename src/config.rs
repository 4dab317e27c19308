//! Database and collection options.

use std::env;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::event_buffer::DEFAULT_BUFFER_SIZE;

/// Options for one database instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseOptions {
    /// Database name; storage instances are keyed by it.
    pub name: String,

    /// Reconcile live queries from change events instead of requerying.
    #[serde(default = "default_event_reduce")]
    pub event_reduce: bool,

    /// Extra write validations (primary key, revision height).
    #[serde(default = "default_dev_mode")]
    pub dev_mode: bool,

    /// Number of change events each collection keeps for live queries.
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// Capacity of the storage change-stream channel.
    #[serde(default = "default_change_stream_capacity")]
    pub change_stream_capacity: usize,

    #[serde(default)]
    pub multi_instance: bool,
}

fn default_event_reduce() -> bool {
    true
}

fn default_dev_mode() -> bool {
    cfg!(debug_assertions)
}

fn default_event_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_change_stream_capacity() -> usize {
    4096
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self::new("oxirx")
    }
}

impl DatabaseOptions {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            event_reduce: default_event_reduce(),
            dev_mode: default_dev_mode(),
            event_buffer_size: default_event_buffer_size(),
            change_stream_capacity: default_change_stream_capacity(),
            multi_instance: false,
        }
    }

    /// Parse options from a JSON object; missing fields take their defaults.
    pub fn from_json(value: &Value) -> Result<Self> {
        let options: Self = serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidOptions(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Override fields from `OXIRX_*` environment variables where set.
    pub fn with_env(mut self) -> Self {
        if let Some(v) = env_flag("OXIRX_EVENT_REDUCE") {
            self.event_reduce = v;
        }
        if let Some(v) = env_flag("OXIRX_DEV_MODE") {
            self.dev_mode = v;
        }
        if let Some(n) = env::var("OXIRX_EVENT_BUFFER_SIZE").ok().and_then(|s| s.parse().ok()) {
            self.event_buffer_size = n;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidOptions("database name must not be empty".into()));
        }
        if self.change_stream_capacity == 0 {
            return Err(Error::InvalidOptions("change_stream_capacity must be positive".into()));
        }
        Ok(())
    }
}

fn env_flag(key: &str) -> Option<bool> {
    match env::var(key).ok()?.trim() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Options for one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionOptions {
    /// Dot path of the primary key field.
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
}

fn default_primary_key() -> String {
    "id".to_string()
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            primary_key: default_primary_key(),
        }
    }
}

impl CollectionOptions {
    pub fn with_primary_key(primary_key: &str) -> Self {
        Self {
            primary_key: primary_key.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_fills_defaults() {
        let options = DatabaseOptions::from_json(&json!({"name": "app", "event_reduce": false})).unwrap();
        assert_eq!(options.name, "app");
        assert!(!options.event_reduce);
        assert_eq!(options.event_buffer_size, 100);
        assert_eq!(options.change_stream_capacity, 4096);
        assert!(!options.multi_instance);
    }

    #[test]
    fn rejects_bad_options() {
        assert!(matches!(
            DatabaseOptions::from_json(&json!({"event_reduce": true})),
            Err(Error::InvalidOptions(_))
        ));
        assert!(DatabaseOptions::from_json(&json!({"name": ""})).is_err());
        assert!(DatabaseOptions::from_json(&json!({"name": "a", "change_stream_capacity": 0})).is_err());
    }

    #[test]
    fn collection_defaults() {
        let options: CollectionOptions = serde_json::from_value(json!({})).unwrap();
        assert_eq!(options, CollectionOptions::default());
        assert_eq!(CollectionOptions::with_primary_key("key").primary_key, "key");
    }
}
