//! Batch checkpoint file.
//!
//! A JSON object mapping `entity_id -> {state, usage_count, success_count,
//! confidence_adjustment, last_processed_hypothesis_id}`, rewritten after each
//! entity completes. Writes go to a temp file which is then renamed over the
//! primary; the previous valid primary is kept as `<path>.good` so a corrupt
//! or half-written primary falls back to the last known-good snapshot.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::DiscoveryError;
use crate::types::{BindingState, RuntimeBinding};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub state: BindingState,
    pub usage_count: u64,
    pub success_count: u64,
    pub confidence_adjustment: f64,
    #[serde(default)]
    pub last_processed_hypothesis_id: Option<String>,
}

impl CheckpointEntry {
    pub fn from_binding(binding: &RuntimeBinding) -> Self {
        Self {
            state: binding.state,
            usage_count: binding.usage_count,
            success_count: binding.success_count,
            confidence_adjustment: binding.confidence_adjustment,
            last_processed_hypothesis_id: binding.last_processed_hypothesis_id.clone(),
        }
    }

    fn validate(&self) -> Result<(), String> {
        if self.success_count > self.usage_count {
            return Err(format!(
                "success_count {} exceeds usage_count {}",
                self.success_count, self.usage_count
            ));
        }
        if !self.confidence_adjustment.is_finite() || self.confidence_adjustment < 0.0 {
            return Err(format!(
                "confidence_adjustment {} must be finite and >= 0",
                self.confidence_adjustment
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint {
    pub entries: BTreeMap<String, CheckpointEntry>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, binding: &RuntimeBinding) {
        self.entries
            .insert(binding.entity_id.clone(), CheckpointEntry::from_binding(binding));
    }

    pub fn contains(&self, entity_id: &str) -> bool {
        self.entries.contains_key(entity_id)
    }

    pub fn get(&self, entity_id: &str) -> Option<&CheckpointEntry> {
        self.entries.get(entity_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn validate(&self) -> Result<(), String> {
        for (entity_id, entry) in &self.entries {
            if entity_id.trim().is_empty() {
                return Err("entry with empty entity id".to_string());
            }
            entry
                .validate()
                .map_err(|reason| format!("entry {}: {}", entity_id, reason))?;
        }
        Ok(())
    }
}

/// Where a loaded checkpoint came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    Primary,
    LastKnownGood,
    Empty,
}

#[derive(Debug, Clone)]
pub struct LoadedCheckpoint {
    pub checkpoint: Checkpoint,
    pub source: CheckpointSource,
}

pub fn last_known_good_path(path: &Path) -> PathBuf {
    with_suffix(path, "good")
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Read and validate a checkpoint. `Ok(None)` when the file does not exist.
fn read_checked(path: &Path) -> Result<Option<Checkpoint>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path).map_err(|e| format!("read failed: {}", e))?;
    let checkpoint: Checkpoint =
        serde_json::from_str(&content).map_err(|e| format!("parse failed: {}", e))?;
    checkpoint.validate()?;
    Ok(Some(checkpoint))
}

/// Atomically replace the checkpoint at `path`.
pub fn save(path: &Path, checkpoint: &Checkpoint) -> Result<(), DiscoveryError> {
    checkpoint
        .validate()
        .map_err(|reason| DiscoveryError::CheckpointCorrupt {
            path: path.to_path_buf(),
            reason,
        })?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = with_suffix(path, "tmp");
    let payload = serde_json::to_string_pretty(checkpoint)
        .map_err(|e| DiscoveryError::Io(format!("Failed to serialize checkpoint: {}", e)))?;
    fs::write(&temp_path, payload)?;

    // Only a primary that still validates becomes the fallback.
    if matches!(read_checked(path), Ok(Some(_))) {
        fs::rename(path, last_known_good_path(path))?;
    }
    fs::rename(&temp_path, path)?;
    log::debug!(
        "Checkpoint: saved {} entries to {}",
        checkpoint.len(),
        path.display()
    );
    Ok(())
}

/// Remove the checkpoint and its fallback once a batch has fully completed.
pub fn clear(path: &Path) -> Result<(), DiscoveryError> {
    for file in [path.to_path_buf(), last_known_good_path(path)] {
        if file.exists() {
            fs::remove_file(&file)?;
        }
    }
    Ok(())
}

/// Load the checkpoint, falling back to last known-good when the primary is
/// missing or corrupt. Fails only when neither copy is usable and at least
/// one of them exists.
pub fn load(path: &Path) -> Result<LoadedCheckpoint, DiscoveryError> {
    let good_path = last_known_good_path(path);
    let primary_failure = match read_checked(path) {
        Ok(Some(checkpoint)) => {
            return Ok(LoadedCheckpoint {
                checkpoint,
                source: CheckpointSource::Primary,
            })
        }
        Ok(None) => None,
        Err(reason) => {
            log::warn!(
                "Checkpoint: primary {} is corrupt ({}), trying {}",
                path.display(),
                reason,
                good_path.display()
            );
            Some(reason)
        }
    };

    match read_checked(&good_path) {
        Ok(Some(checkpoint)) => {
            log::warn!(
                "Checkpoint: resuming from last known-good {} ({} entries)",
                good_path.display(),
                checkpoint.len()
            );
            Ok(LoadedCheckpoint {
                checkpoint,
                source: CheckpointSource::LastKnownGood,
            })
        }
        Ok(None) => match primary_failure {
            None => Ok(LoadedCheckpoint {
                checkpoint: Checkpoint::new(),
                source: CheckpointSource::Empty,
            }),
            Some(reason) => Err(DiscoveryError::CheckpointCorrupt {
                path: path.to_path_buf(),
                reason,
            }),
        },
        Err(reason) => Err(DiscoveryError::CheckpointCorrupt {
            path: good_path,
            reason,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(id: &str, state: BindingState, usage: u64, success: u64, adj: f64) -> RuntimeBinding {
        let mut b = RuntimeBinding::new(id, None);
        b.state = state;
        b.usage_count = usage;
        b.success_count = success;
        b.confidence_adjustment = adj;
        b.last_processed_hypothesis_id = Some(format!("hyp-{id}"));
        b
    }

    fn sample() -> Checkpoint {
        let mut checkpoint = Checkpoint::new();
        checkpoint.record(&binding("acme", BindingState::Promoted, 5, 4, 0.15));
        checkpoint.record(&binding("beta", BindingState::Exploring, 1, 0, 0.0));
        checkpoint
    }

    #[test]
    fn test_roundtrip_reproduces_states() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");
        let checkpoint = sample();
        save(&path, &checkpoint).expect("save");

        let loaded = load(&path).expect("load");
        assert_eq!(loaded.source, CheckpointSource::Primary);
        assert_eq!(loaded.checkpoint, checkpoint);
        assert_eq!(loaded.checkpoint.get("acme").map(|e| e.state), Some(BindingState::Promoted));
    }

    #[test]
    fn test_file_is_flat_entity_map() {
        let json = serde_json::to_value(sample()).expect("serialize");
        assert_eq!(json["acme"]["state"], "PROMOTED");
        assert_eq!(json["acme"]["usage_count"], 5);
        assert_eq!(json["beta"]["last_processed_hypothesis_id"], "hyp-beta");
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = load(&dir.path().join("none.json")).expect("load");
        assert_eq!(loaded.source, CheckpointSource::Empty);
        assert!(loaded.checkpoint.is_empty());
    }

    #[test]
    fn test_corrupt_primary_falls_back_to_last_known_good() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");

        let mut first = Checkpoint::new();
        first.record(&binding("acme", BindingState::Exploring, 2, 1, 0.05));
        save(&path, &first).expect("save first");
        save(&path, &sample()).expect("save second");
        assert!(last_known_good_path(&path).exists());

        fs::write(&path, "{\"acme\": {\"state\": \"PROMOTED\"").expect("truncate");
        let loaded = load(&path).expect("load");
        assert_eq!(loaded.source, CheckpointSource::LastKnownGood);
        assert_eq!(loaded.checkpoint, first);
    }

    #[test]
    fn test_schema_violation_is_corrupt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");
        fs::write(
            &path,
            r#"{"acme": {"state": "PROMOTED", "usage_count": 1, "success_count": 3, "confidence_adjustment": 0.1}}"#,
        )
        .expect("write");
        let err = load(&path).unwrap_err();
        assert!(matches!(err, DiscoveryError::CheckpointCorrupt { .. }));

        fs::write(
            &path,
            r#"{"acme": {"state": "PAUSED", "usage_count": 1, "success_count": 0, "confidence_adjustment": 0.1}}"#,
        )
        .expect("write");
        assert!(load(&path).is_err(), "unknown state is rejected");
    }

    #[test]
    fn test_clear_removes_both_copies() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");
        save(&path, &sample()).expect("save");
        save(&path, &sample()).expect("save again");
        clear(&path).expect("clear");
        assert!(!path.exists());
        assert!(!last_known_good_path(&path).exists());
        assert_eq!(load(&path).expect("load").source, CheckpointSource::Empty);
    }

    #[test]
    fn test_save_refuses_invalid_checkpoint() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("checkpoint.json");
        let mut checkpoint = Checkpoint::new();
        checkpoint.record(&binding("acme", BindingState::Exploring, 1, 0, -0.1));
        assert!(save(&path, &checkpoint).is_err());
        assert!(!path.exists());
    }
}
