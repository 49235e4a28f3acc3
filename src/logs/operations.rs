//! Append-only operations log.
//!
//! One JSON line per mutation. Insert and upsert entries carry the full item
//! snapshot, so replaying the log and keeping the last non-delete entry per id
//! reconstructs the item set exactly.

use crate::error::{Result, StoreError};
use crate::fs::atomic;
use crate::logs::segments::{self, Segment, SegmentNaming};
use crate::retry::RetryPolicy;
use crate::types::{ItemMap, StoreItem, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// File name of the active operations log segment.
pub const OPERATIONS_LOG: &str = "operations.log";

const SEALED: SegmentNaming = SegmentNaming {
    prefix: "operations.log.",
    suffix: "",
};

/// A logged mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "lowercase")]
pub enum LogOperation {
    Insert { item: StoreItem },
    Upsert { item: StoreItem },
    Delete { id: String },
}

impl LogOperation {
    pub fn id(&self) -> &str {
        match self {
            LogOperation::Insert { item } | LogOperation::Upsert { item } => &item.id,
            LogOperation::Delete { id } => id,
        }
    }
}

/// One line of the operations log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationsLogEntry {
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub operation: LogOperation,
}

impl OperationsLogEntry {
    pub fn insert(item: StoreItem) -> Self {
        Self::now(LogOperation::Insert { item })
    }

    pub fn upsert(item: StoreItem) -> Self {
        Self::now(LogOperation::Upsert { item })
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self::now(LogOperation::Delete { id: id.into() })
    }

    fn now(operation: LogOperation) -> Self {
        Self {
            timestamp: Timestamp::now(),
            operation,
        }
    }

    pub fn id(&self) -> &str {
        self.operation.id()
    }
}

/// Operations log configuration.
#[derive(Clone, Copy, Debug)]
pub struct OperationsLogConfig {
    /// Active segment size that triggers rotation.
    pub max_bytes: u64,
    /// Sealed segments kept after rotation.
    pub max_files: usize,
    /// Compress sealed segments with zstd.
    pub compress: bool,
}

impl Default for OperationsLogConfig {
    fn default() -> Self {
        Self {
            max_bytes: 8 * 1024 * 1024,
            max_files: 5,
            compress: false,
        }
    }
}

/// Result of collapsing the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogCompaction {
    pub original_entries: usize,
    pub compacted_entries: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub bytes_reclaimed: u64,
}

/// Size and shape of the log on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogStats {
    pub entries: usize,
    pub skipped_lines: usize,
    pub active_bytes: u64,
    pub sealed_segments: usize,
    pub sealed_bytes: u64,
}

impl LogStats {
    pub fn total_bytes(&self) -> u64 {
        self.active_bytes + self.sealed_bytes
    }
}

/// Result of merging several logs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeSummary {
    pub path: PathBuf,
    pub entries: usize,
}

/// The operations log of one store directory.
pub struct OperationsLog {
    dir: PathBuf,
    path: PathBuf,
    config: OperationsLogConfig,
    policy: RetryPolicy,
    /// Append handle, reopened lazily after rewrites and rotation.
    writer: Mutex<Option<File>>,
}

impl OperationsLog {
    /// Open (creating if needed) the log in `dir`.
    pub fn open(dir: impl AsRef<Path>, config: OperationsLogConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let path = dir.join(OPERATIONS_LOG);
        segments::trim_torn_tail(&path)?;
        Ok(Self {
            dir,
            path,
            config,
            policy: RetryPolicy::default(),
            writer: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably append one entry after all prior entries.
    pub fn append(&self, entry: &OperationsLogEntry) -> Result<()> {
        let mut line = serde_json::to_vec(entry).map_err(|e| StoreError::Serialization(e.to_string()))?;
        line.push(b'\n');

        let mut writer = self.writer.lock();
        let file = match writer.take() {
            Some(file) => file,
            None => OpenOptions::new().create(true).append(true).open(&self.path)?,
        };
        let file = writer.insert(file);
        file.write_all(&line)?;
        file.sync_data()?;

        if file.metadata()?.len() >= self.config.max_bytes {
            *writer = None;
            self.rotate_locked()?;
        }
        Ok(())
    }

    /// Append several entries in order.
    pub fn append_all<'a, I>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a OperationsLogEntry>,
    {
        for entry in entries {
            self.append(entry)?;
        }
        Ok(())
    }

    /// All entries, sealed segments first, in append order.
    pub fn read_entries(&self) -> Result<Vec<OperationsLogEntry>> {
        Ok(self.read_all()?.0)
    }

    /// Collapse to at most one entry per id and persist the result in place.
    pub fn compact(&self) -> Result<LogCompaction> {
        let _writer = self.lock_for_rewrite();
        let bytes_before = self.stats_unlocked()?.total_bytes();
        let (entries, _) = self.read_all()?;
        let original_entries = entries.len();
        let compacted = collapse(entries);
        let compacted_entries = compacted.len();

        self.rewrite_unlocked(&compacted)?;
        let bytes_after = self.stats_unlocked()?.total_bytes();

        let result = LogCompaction {
            original_entries,
            compacted_entries,
            bytes_before,
            bytes_after,
            bytes_reclaimed: bytes_before.saturating_sub(bytes_after),
        };
        info!(
            original = original_entries,
            compacted = compacted_entries,
            reclaimed = result.bytes_reclaimed,
            "compacted operations log"
        );
        Ok(result)
    }

    /// Replace the whole log (all segments) with `entries`.
    pub fn rewrite(&self, entries: &[OperationsLogEntry]) -> Result<()> {
        let _writer = self.lock_for_rewrite();
        self.rewrite_unlocked(entries)
    }

    /// Drop every entry.
    pub fn clear(&self) -> Result<()> {
        self.rewrite(&[])
    }

    /// Seal the active segment now.
    pub fn rotate(&self) -> Result<Option<PathBuf>> {
        let _writer = self.lock_for_rewrite();
        self.rotate_locked()
    }

    pub fn stats(&self) -> Result<LogStats> {
        let _writer = self.writer.lock();
        self.stats_unlocked()
    }

    /// Sealed segments, oldest first.
    pub fn sealed_segments(&self) -> Result<Vec<Segment>> {
        SEALED.list(&self.dir)
    }

    /// Merge logs into `output_dir/operations.log`, ordered by timestamp.
    /// Entries with equal timestamps keep their input order.
    pub fn merge(logs: &[PathBuf], output_dir: &Path) -> Result<MergeSummary> {
        let mut merged = Vec::new();
        for log in logs {
            let bytes = segments::read_segment(log)?;
            let (entries, _) = segments::parse_lines::<OperationsLogEntry>(&bytes, log);
            merged.extend(entries);
        }
        merged.sort_by_key(|e| e.timestamp);

        fs::create_dir_all(output_dir)?;
        let path = output_dir.join(OPERATIONS_LOG);
        atomic::write(&path, &encode(&merged)?, &RetryPolicy::default())?;
        debug!(inputs = logs.len(), entries = merged.len(), output = %path.display(), "merged operations logs");
        Ok(MergeSummary {
            path,
            entries: merged.len(),
        })
    }

    fn lock_for_rewrite(&self) -> parking_lot::MutexGuard<'_, Option<File>> {
        let mut writer = self.writer.lock();
        *writer = None;
        writer
    }

    fn read_all(&self) -> Result<(Vec<OperationsLogEntry>, usize)> {
        scan_log(&self.dir)
    }

    /// Sealed segments go first, oldest first, so an interrupted rewrite
    /// leaves a suffix of the old log rather than a stale prefix.
    fn rewrite_unlocked(&self, entries: &[OperationsLogEntry]) -> Result<()> {
        let sealed = SEALED.list(&self.dir)?;
        for segment in &sealed {
            fs::remove_file(&segment.path)?;
        }
        if !sealed.is_empty() {
            atomic::sync_dir(&self.dir)?;
        }
        atomic::write(&self.path, &encode(entries)?, &self.policy)
    }

    fn rotate_locked(&self) -> Result<Option<PathBuf>> {
        let size = match fs::metadata(&self.path) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if size == 0 {
            return Ok(None);
        }

        let sealed = SEALED.list(&self.dir)?;
        let seq = sealed.last().map_or(1, |s| s.seq + 1);
        let mut target = self.dir.join(SEALED.name(seq, false));
        fs::rename(&self.path, &target)?;
        atomic::sync_dir(&self.dir)?;
        if self.config.compress {
            target = segments::compress_segment(&target, &self.policy)?;
        }
        info!(segment = %target.display(), bytes = size, "rotated operations log");

        let sealed = SEALED.list(&self.dir)?;
        let removed = segments::enforce_retention(&sealed, self.config.max_files, |_| true)?;
        if !removed.is_empty() {
            debug!(count = removed.len(), "removed old operations log segments");
        }
        Ok(Some(target))
    }

    fn stats_unlocked(&self) -> Result<LogStats> {
        log_stats(&self.dir)
    }
}

/// Read every segment of the log in `dir` without modifying anything.
/// Returns the entries in append order and the number of malformed lines.
pub fn scan_log(dir: &Path) -> Result<(Vec<OperationsLogEntry>, usize)> {
    let mut entries = Vec::new();
    let mut skipped = 0;
    for segment in SEALED.list(dir)? {
        let bytes = segments::read_segment(&segment.path)?;
        let (mut parsed, bad) = segments::parse_lines(&bytes, &segment.path);
        entries.append(&mut parsed);
        skipped += bad;
    }
    let active = dir.join(OPERATIONS_LOG);
    match fs::read(&active) {
        Ok(bytes) => {
            let (mut parsed, bad) = segments::parse_lines(&bytes, &active);
            entries.append(&mut parsed);
            skipped += bad;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok((entries, skipped))
}

/// Size and entry counts of the log in `dir`, read without modifying anything.
pub fn log_stats(dir: &Path) -> Result<LogStats> {
    let (entries, skipped_lines) = scan_log(dir)?;
    let sealed = SEALED.list(dir)?;
    let active_bytes = match fs::metadata(dir.join(OPERATIONS_LOG)) {
        Ok(m) => m.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
        Err(e) => return Err(e.into()),
    };
    Ok(LogStats {
        entries: entries.len(),
        skipped_lines,
        active_bytes,
        sealed_segments: sealed.len(),
        sealed_bytes: sealed.iter().map(|s| s.size).sum(),
    })
}

/// Keep, per id, only the last entry, dropping ids whose last entry is a
/// delete. Survivors keep their relative order.
pub fn collapse(entries: Vec<OperationsLogEntry>) -> Vec<OperationsLogEntry> {
    let mut last: HashMap<String, usize> = HashMap::new();
    for (pos, entry) in entries.iter().enumerate() {
        last.insert(entry.id().to_string(), pos);
    }
    entries
        .into_iter()
        .enumerate()
        .filter(|(pos, entry)| {
            last.get(entry.id()) == Some(pos) && !matches!(entry.operation, LogOperation::Delete { .. })
        })
        .map(|(_, entry)| entry)
        .collect()
}

/// Apply entries in order to an item map.
pub fn apply_entries<'a, I>(items: &mut ItemMap, entries: I)
where
    I: IntoIterator<Item = &'a OperationsLogEntry>,
{
    for entry in entries {
        match &entry.operation {
            LogOperation::Insert { item } | LogOperation::Upsert { item } => {
                items.put(item.clone());
            }
            LogOperation::Delete { id } => {
                items.remove(id);
            }
        }
    }
}

fn encode(entries: &[OperationsLogEntry]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut out, entry).map_err(|e| StoreError::Serialization(e.to_string()))?;
        out.push(b'\n');
    }
    Ok(out)
}
