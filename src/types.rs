//! Core types for the vector store.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current on-disk format version of the primary file.
pub const FORMAT_VERSION: u32 = 1;

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    /// Time elapsed since this timestamp (zero if it lies in the future).
    pub fn elapsed(self) -> Duration {
        let now = Self::now().0;
        Duration::from_micros(now.saturating_sub(self.0).max(0) as u64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A metadata value: scalars, booleans, or arrays of those.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<MetadataValue>),
}

impl From<bool> for MetadataValue {
    fn from(v: bool) -> Self {
        MetadataValue::Bool(v)
    }
}

impl From<f64> for MetadataValue {
    fn from(v: f64) -> Self {
        MetadataValue::Number(v)
    }
}

impl From<i64> for MetadataValue {
    fn from(v: i64) -> Self {
        MetadataValue::Number(v as f64)
    }
}

impl From<&str> for MetadataValue {
    fn from(v: &str) -> Self {
        MetadataValue::String(v.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(v: String) -> Self {
        MetadataValue::String(v)
    }
}

/// String-keyed item metadata. Ordered so serialized forms are stable.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A stored record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoreItem {
    /// Unique identifier.
    pub id: String,

    /// Fixed-length vector (length is constant per store).
    pub vector: Vec<f32>,

    /// Precomputed Euclidean norm of `vector`.
    pub norm: f32,

    /// Inline metadata. Empty when `metadata_file` is set.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: Metadata,

    /// File name (relative to the store directory) holding externalized metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_file: Option<String>,
}

/// Input for inserting or upserting an item.
#[derive(Clone, Debug, Default)]
pub struct NewItem {
    /// Caller-supplied id; generated when absent.
    pub id: Option<String>,
    pub vector: Vec<f32>,
    pub metadata: Metadata,
}

impl NewItem {
    /// Create an input with a generated id.
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            id: None,
            vector,
            metadata: Metadata::new(),
        }
    }

    /// Set an explicit id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Add one metadata field.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Distance metric recorded in the primary file. Scoring lives outside the core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
    DotProduct,
}

/// Where item metadata is kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MetadataStorage {
    #[default]
    Inline,
    External,
}

/// Index-level settings persisted in the primary file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexSettings {
    pub version: u32,
    #[serde(default)]
    pub metric: DistanceMetric,
    /// Vector length; established by the first insert when not configured.
    #[serde(default)]
    pub dimension: Option<usize>,
    #[serde(default)]
    pub metadata_storage: MetadataStorage,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            version: FORMAT_VERSION,
            metric: DistanceMetric::default(),
            dimension: None,
            metadata_storage: MetadataStorage::default(),
        }
    }
}

impl IndexSettings {
    /// Settings with a fixed dimension.
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension: Some(dimension),
            ..Default::default()
        }
    }
}

/// Euclidean norm of a vector.
pub fn vector_norm(vector: &[f32]) -> f32 {
    vector.iter().map(|v| v * v).sum::<f32>().sqrt()
}

/// Insertion-ordered item collection keyed by id.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ItemMap {
    items: Vec<StoreItem>,
    positions: HashMap<String, usize>,
}

impl ItemMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an ordered list. Later duplicates replace earlier ones.
    pub fn from_items(items: Vec<StoreItem>) -> Self {
        let mut map = Self::new();
        for item in items {
            map.put(item);
        }
        map
    }

    pub fn get(&self, id: &str) -> Option<&StoreItem> {
        self.positions.get(id).map(|&pos| &self.items[pos])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    /// Insert or replace in place, returning the previous value.
    pub fn put(&mut self, item: StoreItem) -> Option<StoreItem> {
        match self.positions.get(&item.id) {
            Some(&pos) => Some(std::mem::replace(&mut self.items[pos], item)),
            None => {
                self.positions.insert(item.id.clone(), self.items.len());
                self.items.push(item);
                None
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<StoreItem> {
        let pos = self.positions.remove(id)?;
        let removed = self.items.remove(pos);
        for item in &self.items[pos..] {
            if let Some(p) = self.positions.get_mut(&item.id) {
                *p -= 1;
            }
        }
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StoreItem> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[StoreItem] {
        &self.items
    }

    pub fn into_items(self) -> Vec<StoreItem> {
        self.items
    }
}
