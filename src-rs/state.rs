use crate::canvas::{Color, ObservedWall, Position};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

/// Observed wall plus the highest slot folded into it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistentState {
    pub last_slot: u64,
    pub wall: ObservedWall,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateRecord {
    #[serde(rename = "lastSlot", default)]
    last_slot: u64,
    #[serde(default)]
    image: BTreeMap<String, String>,
}

impl From<&PersistentState> for StateRecord {
    fn from(state: &PersistentState) -> Self {
        Self {
            last_slot: state.last_slot,
            image: state
                .wall
                .iter()
                .map(|(pos, color)| (pos.state_key(), color.to_string()))
                .collect(),
        }
    }
}

impl From<StateRecord> for PersistentState {
    fn from(record: StateRecord) -> Self {
        let wall = record
            .image
            .into_iter()
            .filter_map(|(key, value)| {
                let entry = Position::from_state_key(&key).zip(Color::parse(&value));
                if entry.is_none() {
                    warn!(key = %key, value = %value, "dropping malformed wall entry from state");
                }
                entry
            })
            .collect();
        Self {
            last_slot: record.last_slot,
            wall,
        }
    }
}

pub trait StateStore {
    fn load(&self) -> Result<PersistentState>;
    fn save(&mut self, state: &PersistentState) -> Result<()>;
}

/// State kept as a single JSON document on disk. Saves go to a sibling
/// `.tmp` file that is renamed over the old one, so the file on disk is
/// always a complete record.
#[derive(Debug, Clone)]
pub struct JsonStateFile {
    path: PathBuf,
}

impl JsonStateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[cfg(test)]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateStore for JsonStateFile {
    fn load(&self) -> Result<PersistentState> {
        if !self.path.exists() {
            return Ok(PersistentState::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read state: {}", self.path.display()))?;
        let record: StateRecord = serde_json::from_str(&raw)
            .with_context(|| format!("invalid state JSON: {}", self.path.display()))?;
        Ok(record.into())
    }

    fn save(&mut self, state: &PersistentState) -> Result<()> {
        let raw = serde_json::to_string(&StateRecord::from(state))?;
        let tmp = self.tmp_path();
        fs::write(&tmp, raw)
            .with_context(|| format!("failed to write state: {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace state: {}", self.path.display()))?;
        Ok(())
    }
}
