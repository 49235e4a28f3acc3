//! Content checksums and the `checksums.json` manifest.

use crate::error::{Result, StoreError};
use crate::fs::atomic;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use tracing::debug;

/// Manifest file name in the store directory.
pub const CHECKSUM_FILE: &str = "checksums.json";

/// Per-artifact checksums, keyed by file name relative to the store directory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumManifest {
    pub algorithm: String,
    pub files: BTreeMap<String, String>,
}

/// Hex SHA-256 of bytes.
pub fn checksum_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hex SHA-256 of a file's content.
pub fn calculate_file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of a value's canonical JSON form.
///
/// Object keys are sorted, so structurally equal values hash the same
/// regardless of field order.
pub fn calculate_object_checksum<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let canonical = serde_json::to_value(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let bytes = serde_json::to_vec(&canonical).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(checksum_bytes(&bytes))
}

/// Load the manifest, if present.
pub fn read_manifest(dir: &Path) -> Result<Option<ChecksumManifest>> {
    let path = dir.join(CHECKSUM_FILE);
    if !path.exists() {
        return Ok(None);
    }
    atomic::read_json(&path).map(Some)
}

/// Recompute checksums for `files` (names relative to `dir`) and atomically
/// replace the manifest. Files that no longer exist are left out.
pub fn update_checksums<I, S>(dir: &Path, files: I) -> Result<ChecksumManifest>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut manifest = ChecksumManifest {
        algorithm: "sha256".to_string(),
        files: BTreeMap::new(),
    };
    for name in files {
        let name = name.as_ref();
        let path = dir.join(name);
        if !path.is_file() {
            continue;
        }
        manifest
            .files
            .insert(name.to_string(), calculate_file_checksum(&path)?);
    }
    atomic::write_json(&dir.join(CHECKSUM_FILE), &manifest, &RetryPolicy::default())?;
    debug!(files = manifest.files.len(), "updated checksum manifest");
    Ok(manifest)
}

/// Delete the manifest if present.
pub fn remove_manifest(dir: &Path) -> Result<()> {
    match fs::remove_file(dir.join(CHECKSUM_FILE)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_file_checksum_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.json");
        fs::write(&path, b"hello").unwrap();
        assert_eq!(calculate_file_checksum(&path).unwrap(), checksum_bytes(b"hello"));

        let empty = dir.path().join("empty");
        fs::write(&empty, b"").unwrap();
        assert_eq!(calculate_file_checksum(&empty).unwrap(), checksum_bytes(b""));

        // Larger than one copy buffer.
        let large: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let big = dir.path().join("big");
        fs::write(&big, &large).unwrap();
        assert_eq!(calculate_file_checksum(&big).unwrap(), checksum_bytes(&large));
    }

    #[test]
    fn test_object_checksum_ignores_key_order() {
        let a: serde_json::Value = serde_json::from_str(r#"{"b":1,"a":{"y":[1,2],"x":true}}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"a":{"x":true,"y":[1,2]},"b":1}"#).unwrap();
        assert_eq!(
            calculate_object_checksum(&a).unwrap(),
            calculate_object_checksum(&b).unwrap()
        );
        assert_ne!(
            calculate_object_checksum(&a).unwrap(),
            calculate_object_checksum(&json!({"b": 2})).unwrap()
        );
    }

    #[test]
    fn test_manifest_skips_missing_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("index.json"), b"{}").unwrap();

        let manifest = update_checksums(dir.path(), ["index.json", "gone.meta.json"]).unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(read_manifest(dir.path()).unwrap(), Some(manifest));
    }

    proptest! {
        #[test]
        fn prop_object_checksum_is_order_independent(entries in prop::collection::btree_map("[a-z]{1,6}", any::<i32>(), 0..12)) {
            let forward: serde_json::Map<String, serde_json::Value> =
                entries.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
            let reversed: serde_json::Map<String, serde_json::Value> =
                entries.iter().rev().map(|(k, v)| (k.clone(), json!(v))).collect();
            prop_assert_eq!(
                calculate_object_checksum(&forward).unwrap(),
                calculate_object_checksum(&reversed).unwrap()
            );
        }
    }
}
