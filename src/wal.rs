//! Write-Ahead Log for crash recovery.
//!
//! Every mutation of an update session is appended here before it touches
//! the in-memory item map. Entries live in `wal/wal.<seq>.log` segments as
//! JSON lines; the highest sequence is the active segment. A checkpoint
//! marker records the last entry already folded into the primary file, so
//! recovery only has to replay what follows it.

use crate::error::{Result, StoreError};
use crate::fs::atomic;
use crate::logs::segments::{self, Segment, SegmentNaming};
use crate::retry::RetryPolicy;
use crate::types::Timestamp;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Subdirectory of the store holding WAL segments and the checkpoint.
pub const WAL_DIR: &str = "wal";

/// Checkpoint marker file name inside [`WAL_DIR`].
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

const SEGMENTS: SegmentNaming = SegmentNaming {
    prefix: "wal.",
    suffix: ".log",
};

/// WAL configuration.
#[derive(Clone, Copy, Debug)]
pub struct WalConfig {
    pub enabled: bool,
    /// Store a CRC32 of each payload and verify it on read.
    pub checksums: bool,
    /// Active segment size that triggers rotation.
    pub max_segment_bytes: u64,
    /// Sealed segments kept by rotation. Un-checkpointed segments are
    /// never deleted, so this is a soft bound.
    pub max_files: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            checksums: true,
            max_segment_bytes: 4 * 1024 * 1024,
            max_files: 8,
        }
    }
}

/// Kind of mutation an entry records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WalOperation {
    Insert,
    Upsert,
    Delete,
}

/// One WAL record. `payload` is opaque to the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub id: u64,
    pub timestamp: Timestamp,
    pub operation: WalOperation,
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl WalEntry {
    /// Whether the stored checksum (if any) matches the payload.
    pub fn verify(&self) -> bool {
        match &self.checksum {
            Some(stored) => *stored == payload_checksum(&self.payload),
            None => true,
        }
    }
}

/// Marker of how much of the WAL is reflected in the primary file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Highest entry id folded into the primary file.
    pub last_entry_id: u64,
    /// Active segment when the checkpoint was taken.
    pub segment: u64,
    pub timestamp: Timestamp,
    pub checksum: String,
}

impl Checkpoint {
    fn new(last_entry_id: u64, segment: u64) -> Self {
        let timestamp = Timestamp::now();
        Self {
            last_entry_id,
            segment,
            timestamp,
            checksum: checkpoint_checksum(last_entry_id, segment, timestamp),
        }
    }

    pub fn verify(&self) -> bool {
        self.checksum == checkpoint_checksum(self.last_entry_id, self.segment, self.timestamp)
    }
}

/// WAL size and recovery state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WalStats {
    pub segments: usize,
    pub total_bytes: u64,
    pub entries: usize,
    /// Lines skipped as unparseable or failing checksum verification.
    pub invalid_entries: usize,
    pub last_entry_id: u64,
    pub checkpoint: Option<u64>,
    /// Valid entries after the checkpoint.
    pub pending: usize,
}

struct Writer {
    file: Option<File>,
    segment: u64,
    size: u64,
    next_id: u64,
}

/// Segmented, checksummed redo log.
pub struct WriteAheadLog {
    dir: PathBuf,
    config: WalConfig,
    policy: RetryPolicy,
    writer: Mutex<Writer>,
}

impl WriteAheadLog {
    /// Open the WAL under `store_dir/wal`, creating the directory if needed.
    pub fn open(store_dir: impl AsRef<Path>, config: WalConfig) -> Result<Self> {
        let dir = store_dir.as_ref().join(WAL_DIR);
        fs::create_dir_all(&dir)?;

        let existing = SEGMENTS.list(&dir)?;
        let segment = existing.last().map_or(1, |s| s.seq);
        let active = dir.join(SEGMENTS.name(segment, false));
        segments::trim_torn_tail(&active)?;

        let mut last_id = 0;
        for seg in &existing {
            let (entries, _) = read_segment_entries(seg)?;
            if let Some(max) = entries.iter().map(|e| e.id).max() {
                last_id = last_id.max(max);
            }
        }
        let size = match fs::metadata(&active) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let wal = Self {
            dir,
            config,
            policy: RetryPolicy::default(),
            writer: Mutex::new(Writer {
                file: None,
                segment,
                size,
                next_id: last_id + 1,
            }),
        };
        if let Some(cp) = wal.read_checkpoint()? {
            // Entry ids must stay ahead of the checkpoint even when the
            // segments holding them were cleaned up.
            let mut writer = wal.writer.lock();
            writer.next_id = writer.next_id.max(cp.last_entry_id + 1);
        }
        debug!(dir = %wal.dir.display(), segment, last_id, "opened write-ahead log");
        Ok(wal)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &WalConfig {
        &self.config
    }

    /// Durably append an entry and return its id.
    pub fn write_entry(&self, operation: WalOperation, payload: String) -> Result<u64> {
        let mut writer = self.writer.lock();
        let entry = WalEntry {
            id: writer.next_id,
            timestamp: Timestamp::now(),
            operation,
            checksum: self.config.checksums.then(|| payload_checksum(&payload)),
            payload,
        };
        let mut line = serde_json::to_vec(&entry).map_err(|e| StoreError::Serialization(e.to_string()))?;
        line.push(b'\n');

        let file = match writer.file.take() {
            Some(file) => file,
            None => OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(SEGMENTS.name(writer.segment, false)))?,
        };
        let file = writer.file.insert(file);
        file.write_all(&line)?;
        file.sync_data()?;

        writer.size += line.len() as u64;
        writer.next_id += 1;
        if writer.size >= self.config.max_segment_bytes {
            self.rotate_locked(&mut writer)?;
        }
        Ok(entry.id)
    }

    /// Valid entries of every retained segment, in log order.
    pub fn read_entries(&self) -> Result<Vec<WalEntry>> {
        let _writer = self.writer.lock();
        Ok(self.read_all()?.0)
    }

    /// Valid entries after the checkpoint, in log order.
    pub fn entries_since_checkpoint(&self) -> Result<Vec<WalEntry>> {
        let after = self.read_checkpoint()?.map_or(0, |cp| cp.last_entry_id);
        Ok(self
            .read_entries()?
            .into_iter()
            .filter(|e| e.id > after)
            .collect())
    }

    /// Invoke `visit` once per valid entry in log order. Returns the count.
    pub fn replay<F>(&self, visit: F) -> Result<usize>
    where
        F: FnMut(&WalEntry) -> Result<()>,
    {
        visit_all(&self.read_entries()?, visit)
    }

    /// Like [`replay`](Self::replay), restricted to entries after the checkpoint.
    pub fn replay_since_checkpoint<F>(&self, visit: F) -> Result<usize>
    where
        F: FnMut(&WalEntry) -> Result<()>,
    {
        visit_all(&self.entries_since_checkpoint()?, visit)
    }

    /// Record that every entry written so far is reflected in the primary file.
    pub fn checkpoint(&self) -> Result<Checkpoint> {
        let mut writer = self.writer.lock();
        let cp = Checkpoint::new(writer.next_id - 1, writer.segment);
        atomic::write_json(&self.dir.join(CHECKPOINT_FILE), &cp, &self.policy)?;
        debug!(last_entry_id = cp.last_entry_id, segment = cp.segment, "wal checkpoint");

        let removed = self.retain_locked(&mut writer, self.config.max_files, cp.last_entry_id)?;
        if removed > 0 {
            debug!(removed, "removed checkpointed wal segments");
        }
        Ok(cp)
    }

    /// The checkpoint marker, or `None` when absent or failing verification.
    pub fn read_checkpoint(&self) -> Result<Option<Checkpoint>> {
        load_checkpoint(&self.dir)
    }

    /// Delete sealed segments beyond the most recent `keep`. The active
    /// segment and segments holding un-checkpointed entries are kept.
    /// Returns the number of segments removed.
    pub fn cleanup(&self, keep: usize) -> Result<usize> {
        let checkpointed = self.read_checkpoint()?.map_or(0, |cp| cp.last_entry_id);
        let mut writer = self.writer.lock();
        let removed = self.retain_locked(&mut writer, keep, checkpointed)?;
        info!(removed, keep, "wal cleanup");
        Ok(removed)
    }

    /// Seal the active segment and start a new one.
    pub fn rotate(&self) -> Result<u64> {
        let mut writer = self.writer.lock();
        self.rotate_locked(&mut writer)?;
        Ok(writer.segment)
    }

    pub fn stats(&self) -> Result<WalStats> {
        let writer = self.writer.lock();
        let mut stats = collect_stats(&self.dir, self.config.checksums)?;
        stats.last_entry_id = writer.next_id - 1;
        Ok(stats)
    }

    fn read_all(&self) -> Result<(Vec<WalEntry>, usize)> {
        scan_segments(&self.dir, self.config.checksums)
    }

    fn rotate_locked(&self, writer: &mut Writer) -> Result<()> {
        if writer.size == 0 {
            return Ok(());
        }
        let sealed = writer.segment;
        writer.segment += 1;
        writer.size = 0;
        writer.file = Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(SEGMENTS.name(writer.segment, false)))?,
        );
        atomic::sync_dir(&self.dir)?;
        info!(sealed, active = writer.segment, "rotated wal segment");

        let checkpointed = self.read_checkpoint()?.map_or(0, |cp| cp.last_entry_id);
        self.retain_locked(writer, self.config.max_files, checkpointed)?;
        Ok(())
    }

    fn retain_locked(&self, writer: &mut Writer, keep: usize, checkpointed: u64) -> Result<usize> {
        let sealed: Vec<Segment> = SEGMENTS
            .list(&self.dir)?
            .into_iter()
            .filter(|s| s.seq < writer.segment)
            .collect();
        let removed = segments::enforce_retention(&sealed, keep, |segment| {
            match read_segment_entries(segment) {
                Ok((entries, _)) => entries.iter().all(|e| e.id <= checkpointed),
                Err(e) => {
                    warn!(path = %segment.path.display(), error = %e, "cannot read wal segment, keeping it");
                    false
                }
            }
        })?;
        Ok(removed.len())
    }
}

/// Valid entries after the checkpoint of the WAL under `store_dir`, read
/// without modifying anything.
pub fn pending_entries(store_dir: &Path, verify: bool) -> Result<Vec<WalEntry>> {
    let dir = store_dir.join(WAL_DIR);
    let after = load_checkpoint(&dir)?.map_or(0, |cp| cp.last_entry_id);
    let (entries, _) = scan_segments(&dir, verify)?;
    Ok(entries.into_iter().filter(|e| e.id > after).collect())
}

/// Statistics of the WAL under `store_dir`, read without modifying anything.
pub fn inspect(store_dir: &Path, verify: bool) -> Result<WalStats> {
    collect_stats(&store_dir.join(WAL_DIR), verify)
}

fn load_checkpoint(dir: &Path) -> Result<Option<Checkpoint>> {
    let path = dir.join(CHECKPOINT_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice::<Checkpoint>(&bytes) {
        Ok(cp) if cp.verify() => Ok(Some(cp)),
        Ok(_) => {
            warn!(path = %path.display(), "checkpoint checksum mismatch, ignoring marker");
            Ok(None)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable checkpoint, ignoring marker");
            Ok(None)
        }
    }
}

fn collect_stats(dir: &Path, verify: bool) -> Result<WalStats> {
    let checkpoint = load_checkpoint(dir)?.map(|cp| cp.last_entry_id);
    let (entries, invalid_entries) = scan_segments(dir, verify)?;
    let segments = SEGMENTS.list(dir)?;
    let last_entry_id = entries
        .iter()
        .map(|e| e.id)
        .max()
        .unwrap_or(0)
        .max(checkpoint.unwrap_or(0));
    Ok(WalStats {
        segments: segments.len(),
        total_bytes: segments.iter().map(|s| s.size).sum(),
        invalid_entries,
        last_entry_id,
        checkpoint,
        pending: entries
            .iter()
            .filter(|e| e.id > checkpoint.unwrap_or(0))
            .count(),
        entries: entries.len(),
    })
}

/// Read the WAL under `store_dir` without modifying anything. Returns the
/// valid entries in log order and the number of skipped lines.
pub fn scan_wal(store_dir: &Path, verify: bool) -> Result<(Vec<WalEntry>, usize)> {
    scan_segments(&store_dir.join(WAL_DIR), verify)
}

fn scan_segments(dir: &Path, verify: bool) -> Result<(Vec<WalEntry>, usize)> {
    let mut entries = Vec::new();
    let mut invalid = 0;
    for segment in SEGMENTS.list(dir)? {
        let (parsed, skipped) = read_segment_entries(&segment)?;
        invalid += skipped;
        for entry in parsed {
            if verify && !entry.verify() {
                invalid += 1;
                warn!(id = entry.id, segment = segment.seq, "wal entry failed checksum, skipping");
                continue;
            }
            entries.push(entry);
        }
    }
    Ok((entries, invalid))
}

fn read_segment_entries(segment: &Segment) -> Result<(Vec<WalEntry>, usize)> {
    let bytes = segments::read_segment(&segment.path)?;
    Ok(segments::parse_lines(&bytes, &segment.path))
}

fn visit_all<F>(entries: &[WalEntry], mut visit: F) -> Result<usize>
where
    F: FnMut(&WalEntry) -> Result<()>,
{
    for entry in entries {
        visit(entry)?;
    }
    Ok(entries.len())
}

fn payload_checksum(payload: &str) -> String {
    format!("{:08x}", crc32fast::hash(payload.as_bytes()))
}

fn checkpoint_checksum(last_entry_id: u64, segment: u64, timestamp: Timestamp) -> String {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&last_entry_id.to_le_bytes());
    hasher.update(&segment.to_le_bytes());
    hasher.update(&timestamp.0.to_le_bytes());
    format!("{:08x}", hasher.finalize())
}
