//! Tracked entity record.
//!
//! An entity is created when first observed. Its `cluster_id` is assigned by
//! an external clusterer and is immutable once set; re-clustering is a batch
//! operation outside this crate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata key listing needs the entity has declared directly.
pub const DECLARED_NEEDS_KEY: &str = "declared_needs";

/// A row from the `entities` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            cluster_id: None,
            metadata: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_cluster(mut self, cluster_id: &str) -> Self {
        self.cluster_id = Some(cluster_id.to_string());
        self
    }

    /// Assign the cluster once. A second assignment to a different cluster is refused.
    pub fn assign_cluster(&mut self, cluster_id: &str) -> Result<(), String> {
        match self.cluster_id.as_deref() {
            None => {
                self.cluster_id = Some(cluster_id.to_string());
                Ok(())
            }
            Some(existing) if existing == cluster_id => Ok(()),
            Some(existing) => Err(format!(
                "entity {} already assigned to cluster {}",
                self.id, existing
            )),
        }
    }

    /// Metadata value as a string, if present and textual.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Needs declared in metadata, either as a JSON array or a comma-separated string.
    pub fn declared_needs(&self) -> Vec<String> {
        let Some(value) = self.metadata.get(DECLARED_NEEDS_KEY) else {
            return Vec::new();
        };
        let raw: Vec<String> = match value {
            serde_json::Value::Array(items) => items
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            serde_json::Value::String(s) => s.split(',').map(|p| p.to_string()).collect(),
            _ => Vec::new(),
        };
        let mut needs: Vec<String> = Vec::new();
        for need in raw {
            let trimmed = need.trim();
            if !trimmed.is_empty() && !needs.iter().any(|n| n.eq_ignore_ascii_case(trimmed)) {
                needs.push(trimmed.to_string());
            }
        }
        needs
    }
}
