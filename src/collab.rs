//! Contracts for the components the store calls out to: input validation,
//! path sanitization and the vector search index.

use crate::error::{Result, StoreError};
use crate::types::{IndexSettings, NewItem, StoreItem};
use std::path::Path;

/// Checks an item before its mutation is queued.
pub trait ItemValidator: Send + Sync {
    fn validate(&self, item: &NewItem, settings: &IndexSettings) -> Result<()>;
}

/// Default validator: vector shape and metadata keys.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShapeValidator;

impl ItemValidator for ShapeValidator {
    fn validate(&self, item: &NewItem, settings: &IndexSettings) -> Result<()> {
        if let Some(id) = &item.id {
            if id.trim().is_empty() {
                return Err(StoreError::Validation("item id must not be empty".into()));
            }
        }
        if item.vector.is_empty() {
            return Err(StoreError::Validation("vector must not be empty".into()));
        }
        if let Some(pos) = item.vector.iter().position(|v| !v.is_finite()) {
            return Err(StoreError::Validation(format!(
                "vector component {} is not finite",
                pos
            )));
        }
        if let Some(expected) = settings.dimension {
            if item.vector.len() != expected {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    got: item.vector.len(),
                });
            }
        }
        if item.metadata.keys().any(|k| k.is_empty()) {
            return Err(StoreError::Validation("metadata keys must not be empty".into()));
        }
        Ok(())
    }
}

/// Turns caller-supplied identifiers into safe file name components.
pub trait PathSanitizer: Send + Sync {
    fn sanitize(&self, component: &str) -> Result<String>;
}

/// Keeps `[A-Za-z0-9_-]`, replaces everything else with `_`, and caps the
/// length. Rejects components that would be empty or dot-only.
#[derive(Clone, Copy, Debug)]
pub struct DefaultSanitizer {
    pub max_len: usize,
}

impl Default for DefaultSanitizer {
    fn default() -> Self {
        Self { max_len: 64 }
    }
}

impl PathSanitizer for DefaultSanitizer {
    fn sanitize(&self, component: &str) -> Result<String> {
        let cleaned: String = component
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .take(self.max_len)
            .collect();
        if cleaned.is_empty() || cleaned.chars().all(|c| c == '_') {
            return Err(StoreError::InvalidPath(component.to_string()));
        }
        Ok(cleaned)
    }
}

/// Approximate nearest-neighbour index kept in step with the item map.
///
/// The store calls the mutation methods after a commit swaps in the new
/// item map, and `save` once per commit.
pub trait VectorIndex: Send {
    fn add(&mut self, id: &str, vector: &[f32]) -> Result<()>;
    fn update(&mut self, id: &str, vector: &[f32]) -> Result<()>;
    fn remove(&mut self, id: &str) -> Result<()>;
    /// Ids and scores of the `k` nearest items.
    fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>>;
    fn save(&self, dir: &Path) -> Result<()>;
    fn load(&mut self, dir: &Path) -> Result<()>;
    /// Rebuild from scratch, e.g. after recovery or compaction.
    fn rebuild(&mut self, items: &[StoreItem]) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_validator() {
        let v = ShapeValidator;
        let settings = IndexSettings::with_dimension(3);

        assert!(v.validate(&NewItem::new(vec![1.0, 0.0, 0.0]), &settings).is_ok());
        assert!(matches!(
            v.validate(&NewItem::new(vec![1.0, 0.0]), &settings),
            Err(StoreError::DimensionMismatch { expected: 3, got: 2 })
        ));
        assert!(matches!(
            v.validate(&NewItem::new(vec![f32::NAN, 0.0, 0.0]), &settings),
            Err(StoreError::Validation(_))
        ));
        assert!(matches!(
            v.validate(&NewItem::new(vec![1.0, 0.0, 0.0]).with_id("  "), &settings),
            Err(StoreError::Validation(_))
        ));
        // Without a configured dimension any length passes.
        assert!(v.validate(&NewItem::new(vec![1.0]), &IndexSettings::default()).is_ok());
    }

    #[test]
    fn test_default_sanitizer() {
        let s = DefaultSanitizer::default();
        assert_eq!(s.sanitize("doc-42").unwrap(), "doc-42");
        assert_eq!(s.sanitize("../etc/passwd").unwrap(), "___etc_passwd");
        assert!(s.sanitize("..").is_err());
        assert!(s.sanitize("").is_err());
        assert_eq!(s.sanitize(&"a".repeat(100)).unwrap().len(), 64);
    }
}
