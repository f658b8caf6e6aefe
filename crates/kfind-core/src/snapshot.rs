use crate::model::{ConnectionDescriptor, ServerIdentity};
use crate::ContractError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Composite key of a persisted snapshot: one slot per cache key and server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheSlot {
    pub cache_key: String,
    pub server: ServerIdentity,
}

impl CacheSlot {
    pub fn new(cache_key: impl Into<String>, server: ServerIdentity) -> Self {
        Self {
            cache_key: cache_key.into(),
            server,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub extension_version: String,
    #[serde(default)]
    pub connections: Vec<ConnectionDescriptor>,
}

impl CacheSnapshot {
    pub fn new(extension_version: impl Into<String>, connections: Vec<ConnectionDescriptor>) -> Self {
        Self {
            extension_version: extension_version.into(),
            connections,
        }
    }

    /// Version mismatch is informational; entries still go through validation.
    pub fn matches_version(&self, version: &str) -> bool {
        self.extension_version == version
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.connections
            .iter()
            .map(|conn| conn.id().to_string())
            .collect()
    }

    pub fn to_json(&self) -> Result<String, ContractError> {
        serde_json::to_string(self).map_err(|err| ContractError::Serialization(err.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, ContractError> {
        serde_json::from_str(raw).map_err(|err| ContractError::Serialization(err.to_string()))
    }
}
