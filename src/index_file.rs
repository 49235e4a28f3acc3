//! The primary file: index settings plus the ordered item list.

use crate::error::{Result, StoreError};
use crate::fs::atomic;
use crate::retry::RetryPolicy;
use crate::types::{IndexSettings, StoreItem};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Primary file name in the store directory.
pub const INDEX_FILE: &str = "index.json";

/// Serialized form of `index.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexFile {
    #[serde(flatten)]
    pub settings: IndexSettings,
    #[serde(default)]
    pub items: Vec<StoreItem>,
}

impl IndexFile {
    pub fn new(settings: IndexSettings) -> Self {
        Self {
            settings,
            items: Vec::new(),
        }
    }

    /// Load `dir/index.json`. Returns `None` when the file does not exist and
    /// `Corruption` when it exists but cannot be parsed.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(INDEX_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = atomic::read(&path, 3)?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corruption(format!("{}: {}", path.display(), e)))
    }

    /// Atomically replace `dir/index.json`.
    pub fn save(&self, dir: &Path, policy: &RetryPolicy) -> Result<()> {
        atomic::write_json(&dir.join(INDEX_FILE), self, policy)
    }
}
