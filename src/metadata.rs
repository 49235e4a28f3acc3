//! Externalized item metadata.
//!
//! In external storage mode each item's metadata lives in its own file,
//! `<sanitized-id>.<content-hash>.meta.json`, and the item only records the
//! file name. Files are immutable once written: new content gets a new
//! name, so a reader never sees a half-replaced metadata file and the old
//! name simply becomes an orphan for compaction or repair to collect.

use crate::collab::PathSanitizer;
use crate::error::{Result, StoreError};
use crate::fs::atomic;
use crate::integrity::checksum::calculate_object_checksum;
use crate::retry::RetryPolicy;
use crate::types::{Metadata, StoreItem};
use globset::{Glob, GlobMatcher};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Glob matching every external metadata file.
pub const METADATA_GLOB: &str = "*.meta.json";

const METADATA_EXT: &str = ".meta.json";

/// Reads and writes external metadata files with an LRU read cache.
pub struct MetadataFiles {
    dir: PathBuf,
    sanitizer: Arc<dyn PathSanitizer>,
    cache: Mutex<LruCache<String, Arc<Metadata>>>,
    policy: RetryPolicy,
}

impl MetadataFiles {
    pub fn new(dir: impl AsRef<Path>, sanitizer: Arc<dyn PathSanitizer>, cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            dir: dir.as_ref().to_path_buf(),
            sanitizer,
            cache: Mutex::new(LruCache::new(cache_size)),
            policy: RetryPolicy::default(),
        }
    }

    /// File name for an item's metadata.
    pub fn file_name(&self, id: &str, metadata: &Metadata) -> Result<String> {
        let stem = self.sanitizer.sanitize(id)?;
        let hash = calculate_object_checksum(metadata)?;
        Ok(format!("{}.{}{}", stem, &hash[..16], METADATA_EXT))
    }

    /// Move `item.metadata` out to its own file and record the file name.
    pub fn externalize(&self, item: &mut StoreItem) -> Result<()> {
        if item.metadata.is_empty() {
            item.metadata_file = None;
            return Ok(());
        }
        let metadata = std::mem::take(&mut item.metadata);
        let name = self.file_name(&item.id, &metadata)?;
        let path = self.dir.join(&name);
        if !path.exists() {
            atomic::write_json(&path, &metadata, &self.policy)?;
        }
        self.cache.lock().put(name.clone(), Arc::new(metadata));
        item.metadata_file = Some(name);
        Ok(())
    }

    /// An item's metadata, reading its external file when needed.
    pub fn resolve(&self, item: &StoreItem) -> Result<Metadata> {
        let Some(name) = &item.metadata_file else {
            return Ok(item.metadata.clone());
        };
        if let Some(cached) = self.cache.lock().get(name) {
            return Ok(Metadata::clone(cached));
        }
        let path = self.dir.join(name);
        if !path.exists() {
            return Err(StoreError::Corruption(format!(
                "metadata file {} for item {} is missing",
                name, item.id
            )));
        }
        let metadata: Metadata = atomic::read_json(&path)?;
        self.cache.lock().put(name.clone(), Arc::new(metadata.clone()));
        Ok(metadata)
    }

    /// An item with metadata resolved inline and no file reference.
    pub fn materialize(&self, item: &StoreItem) -> Result<StoreItem> {
        let mut out = item.clone();
        out.metadata = self.resolve(item)?;
        out.metadata_file = None;
        Ok(out)
    }
}

/// Names of every metadata file in `dir`.
pub fn list_metadata_files(dir: &Path) -> Result<Vec<String>> {
    let matcher = metadata_matcher()?;
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if matcher.is_match(&name) && !atomic::is_temp_file(&name) {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

/// Metadata files in `dir` not referenced by any of `items`.
pub fn find_orphans<'a, I>(dir: &Path, items: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = &'a StoreItem>,
{
    let live: HashSet<&str> = items
        .into_iter()
        .filter_map(|item| item.metadata_file.as_deref())
        .collect();
    Ok(list_metadata_files(dir)?
        .into_iter()
        .filter(|name| !live.contains(name.as_str()))
        .collect())
}

/// Delete orphaned metadata files. Returns the removed paths.
pub fn remove_orphans<'a, I>(dir: &Path, items: I) -> Result<Vec<PathBuf>>
where
    I: IntoIterator<Item = &'a StoreItem>,
{
    let mut removed = Vec::new();
    for name in find_orphans(dir, items)? {
        let path = dir.join(&name);
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove orphaned metadata file"),
        }
    }
    if !removed.is_empty() {
        debug!(count = removed.len(), "removed orphaned metadata files");
    }
    Ok(removed)
}

fn metadata_matcher() -> Result<GlobMatcher> {
    Ok(Glob::new(METADATA_GLOB)?.compile_matcher())
}
