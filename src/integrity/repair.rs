//! Best-effort repair of a store directory.
//!
//! Repair only ever removes auxiliary bytes: orphaned metadata files,
//! leftover temp files, malformed log lines and log entries whose effect is
//! already in the primary file. Live item data is never touched.

use super::checksum::{read_manifest, update_checksums};
use crate::error::{Result, StoreError};
use crate::fs::{atomic, try_acquire_write_lock, LockOptions};
use crate::index_file::{IndexFile, INDEX_FILE};
use crate::logs::{scan_log, LogOperation, OperationsLog, OperationsLogConfig, OperationsLogEntry};
use crate::metadata::find_orphans;
use crate::types::{ItemMap, StoreItem};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::info;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RepairMode {
    /// Report what would be done without changing anything.
    #[default]
    DryRun,
    Apply,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RepairOptions {
    pub mode: RepairMode,
    /// Lock settings used in apply mode.
    pub lock: LockOptions,
}

impl RepairOptions {
    pub fn apply() -> Self {
        Self {
            mode: RepairMode::Apply,
            ..Default::default()
        }
    }
}

/// One corrective action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepairAction {
    RemoveOrphanedMetadata { file: String },
    RemoveTempFile { file: String },
    DropMalformedLogLines { count: usize },
    DropReflectedLogEntries { count: usize },
    RefreshChecksums { files: usize },
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepairAction::RemoveOrphanedMetadata { file } => write!(f, "remove orphaned metadata file {}", file),
            RepairAction::RemoveTempFile { file } => write!(f, "remove leftover temp file {}", file),
            RepairAction::DropMalformedLogLines { count } => {
                write!(f, "drop {} malformed operations log line(s)", count)
            }
            RepairAction::DropReflectedLogEntries { count } => {
                write!(f, "drop {} operations log entr(ies) already in {}", count, INDEX_FILE)
            }
            RepairAction::RefreshChecksums { files } => write!(f, "refresh checksums for {} file(s)", files),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub mode: RepairMode,
    pub actions: Vec<RepairAction>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.actions.is_empty()
    }

    /// Orphaned metadata files removed (or to be removed).
    pub fn orphans_removed(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| matches!(a, RepairAction::RemoveOrphanedMetadata { .. }))
            .count()
    }
}

/// Repair the store in `dir`.
///
/// In apply mode the write lock is taken without waiting; a store with an
/// active writer fails with `Locked`. An unparseable primary file cannot be
/// repaired here and is returned as `Corruption`.
pub fn repair_index(dir: &Path, options: RepairOptions) -> Result<RepairReport> {
    let apply = options.mode == RepairMode::Apply;
    let _lock = if apply {
        Some(try_acquire_write_lock(dir, &options.lock)?.ok_or(StoreError::Locked)?)
    } else {
        None
    };

    let index = IndexFile::load(dir)?.ok_or(StoreError::NotInitialized)?;
    let mut report = RepairReport {
        mode: options.mode,
        actions: Vec::new(),
    };

    // Orphans are judged against the state the store would have after
    // folding the log, so files referenced only by logged items survive.
    let (log_entries, malformed) = scan_log(dir)?;
    let mut folded = ItemMap::from_items(index.items.clone());
    crate::logs::apply_entries(&mut folded, &log_entries);
    let referenced: Vec<&StoreItem> = index.items.iter().chain(folded.iter()).collect();

    for file in find_orphans(dir, referenced)? {
        if apply {
            fs::remove_file(dir.join(&file))?;
        }
        report.actions.push(RepairAction::RemoveOrphanedMetadata { file });
    }

    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if atomic::is_temp_file(&name) {
            if apply {
                fs::remove_file(dir.join(&name))?;
            }
            report.actions.push(RepairAction::RemoveTempFile { file: name });
        }
    }

    let kept = drop_reflected(&index.items, &log_entries);
    let reflected = log_entries.len() - kept.len();
    if malformed > 0 {
        report.actions.push(RepairAction::DropMalformedLogLines { count: malformed });
    }
    if reflected > 0 {
        report.actions.push(RepairAction::DropReflectedLogEntries { count: reflected });
    }
    if apply && (malformed > 0 || reflected > 0) {
        OperationsLog::open(dir, OperationsLogConfig::default())?.rewrite(&kept)?;
    }

    if let Some(manifest) = read_manifest(dir).unwrap_or(None) {
        let mut files: Vec<String> = vec![INDEX_FILE.to_string()];
        files.extend(index.items.iter().filter_map(|i| i.metadata_file.clone()));
        let stale = files.len() != manifest.files.len()
            || files.iter().any(|name| {
                let current = super::checksum::calculate_file_checksum(&dir.join(name)).ok();
                current.as_deref() != manifest.files.get(name).map(String::as_str)
            });
        if stale {
            if apply {
                update_checksums(dir, &files)?;
            }
            report.actions.push(RepairAction::RefreshChecksums { files: files.len() });
        }
    }

    for action in &report.actions {
        if apply {
            info!(%action, "repair");
        } else {
            info!(%action, "repair (dry run)");
        }
    }
    if report.actions.is_empty() {
        info!(dir = %dir.display(), "nothing to repair");
    }
    Ok(report)
}

/// Log entries minus those for ids whose final logged state already equals
/// the primary file's state. Folding the result onto the primary file gives
/// the same items as folding the full log.
fn drop_reflected(primary: &[StoreItem], entries: &[OperationsLogEntry]) -> Vec<OperationsLogEntry> {
    let primary: HashMap<&str, &StoreItem> = primary.iter().map(|i| (i.id.as_str(), i)).collect();
    let mut reflected: HashMap<String, bool> = HashMap::new();
    for last in collapse_with_deletes(entries) {
        let same = match &last.operation {
            LogOperation::Insert { item } | LogOperation::Upsert { item } => {
                primary.get(item.id.as_str()).map_or(false, |p| *p == item)
            }
            LogOperation::Delete { id } => !primary.contains_key(id.as_str()),
        };
        reflected.insert(last.id().to_string(), same);
    }
    entries
        .iter()
        .filter(|e| !reflected.get(e.id()).copied().unwrap_or(false))
        .cloned()
        .collect()
}

/// The last entry per id, deletes included.
fn collapse_with_deletes(entries: &[OperationsLogEntry]) -> Vec<&OperationsLogEntry> {
    let mut last: HashMap<&str, usize> = HashMap::new();
    for (pos, entry) in entries.iter().enumerate() {
        last.insert(entry.id(), pos);
    }
    let mut positions: Vec<usize> = last.into_values().collect();
    positions.sort_unstable();
    positions.into_iter().map(|pos| &entries[pos]).collect()
}
