//! User labels attached to addresses, transactions and outputs.
//!
//! The engine only reads labels. [`InMemoryLabelStore`] loads BIP-329 style
//! JSON lines (`{"type": "addr", "ref": "...", "label": "..."}`); record
//! types other than `addr`, `tx` and `output` are skipped.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::RwLock;

use async_trait::async_trait;
use bitcoin::{OutPoint, Txid};
use serde::Deserialize;

use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LabelKey {
    /// Encoded address
    Address(String),
    Transaction(Txid),
    Output(OutPoint),
}

pub type LabelMap = HashMap<LabelKey, Vec<String>>;

/// Read-only label source queried once per sync.
#[async_trait]
pub trait LabelStore: Send + Sync {
    /// Labels for the requested keys. Keys without labels may be absent.
    async fn lookup(&self, keys: &[LabelKey]) -> LabelMap;
}

/// Store without any labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLabels;

#[async_trait]
impl LabelStore for NoLabels {
    async fn lookup(&self, _keys: &[LabelKey]) -> LabelMap {
        LabelMap::new()
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLabelStore {
    labels: RwLock<LabelMap>,
}

#[derive(Deserialize)]
struct LabelRecord {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "ref")]
    reference: String,
    label: String,
}

impl InMemoryLabelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: LabelKey, label: impl Into<String>) {
        let label = label.into();
        let mut labels = self.labels.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let entry = labels.entry(key).or_default();
        if !entry.contains(&label) {
            entry.push(label);
        }
    }

    pub fn len(&self) -> usize {
        self.labels.read().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse JSON lines. Blank lines are ignored, malformed ones are errors.
    pub fn from_json_lines(input: &str) -> Result<Self, SyncError> {
        let store = Self::new();
        for (number, line) in input.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let record: LabelRecord = serde_json::from_str(line).map_err(|e| {
                SyncError::Config(format!("label line {}: {}", number + 1, e))
            })?;
            let key = match record.kind.as_str() {
                "addr" => LabelKey::Address(record.reference),
                "tx" => LabelKey::Transaction(Txid::from_str(&record.reference).map_err(|e| {
                    SyncError::Config(format!("label line {}: {}", number + 1, e))
                })?),
                "output" => {
                    LabelKey::Output(OutPoint::from_str(&record.reference).map_err(|e| {
                        SyncError::Config(format!("label line {}: {}", number + 1, e))
                    })?)
                }
                _ => continue,
            };
            store.add(key, record.label);
        }
        Ok(store)
    }

    pub fn load(path: &Path) -> Result<Self, SyncError> {
        let input = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_json_lines(&input)
    }
}

#[async_trait]
impl LabelStore for InMemoryLabelStore {
    async fn lookup(&self, keys: &[LabelKey]) -> LabelMap {
        let labels = self.labels.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        keys.iter()
            .filter_map(|key| labels.get(key).map(|found| (key.clone(), found.clone())))
            .collect()
    }
}
