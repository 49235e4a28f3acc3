//! Main Store struct tying all components together.

use crate::collab::{DefaultSanitizer, ItemValidator, PathSanitizer, ShapeValidator, VectorIndex};
use crate::error::{Result, StoreError};
use crate::fs::atomic;
use crate::fs::lock::{acquire_with, try_acquire_with};
use crate::fs::{FileLeaseBackend, LeaseBackend, LockOptions};
use crate::index_file::{IndexFile, INDEX_FILE};
use crate::integrity::{
    self, ChecksumManifest, IntegrityReport, RepairOptions, RepairReport, VerifyOptions,
};
use crate::logs::{
    apply_entries, log_stats, LogCompaction, LogOperation, LogStats, OperationsLog, OperationsLogConfig,
    OperationsLogEntry,
};
use crate::metadata::{self, MetadataFiles};
use crate::queue::{OperationQueue, QueueConfig, QueueEvent, QueueStats};
use crate::retry::RetryPolicy;
use crate::session::{self, Mutation, Outcome, SessionState, UpdateSession};
use crate::types::{IndexSettings, ItemMap, NewItem, StoreItem};
use crate::wal::{self, WalConfig, WalEntry, WalStats, WriteAheadLog};
use crossbeam_channel::Receiver;
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Glob matching backups of the primary file.
const INDEX_BACKUP_GLOB: &str = "index.json.backup-*";

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Store directory.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Settings for a newly created store. An existing store keeps the
    /// settings recorded in its primary file.
    pub settings: IndexSettings,

    pub wal: WalConfig,
    pub operations_log: OperationsLogConfig,
    pub queue: QueueConfig,
    pub lock: LockOptions,

    /// Entries in the external metadata read cache.
    pub metadata_cache_size: usize,

    /// Primary file backups older than this are removed by compaction.
    pub backup_max_age: Duration,

    /// Keep `checksums.json` current on every commit. When off, a commit
    /// removes any manifest left by [`Store::update_checksums`].
    pub track_checksums: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./store"),
            create_if_missing: true,
            settings: IndexSettings::default(),
            wal: WalConfig::default(),
            operations_log: OperationsLogConfig::default(),
            queue: QueueConfig::default(),
            lock: LockOptions::default(),
            metadata_cache_size: 1000,
            backup_max_age: Duration::from_secs(24 * 60 * 60),
            track_checksums: false,
        }
    }
}

/// Components the store calls out to.
pub struct Collaborators {
    pub validator: Arc<dyn ItemValidator>,
    pub sanitizer: Arc<dyn PathSanitizer>,
    pub vector_index: Option<Box<dyn VectorIndex>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            validator: Arc::new(ShapeValidator),
            sanitizer: Arc::new(DefaultSanitizer::default()),
            vector_index: None,
        }
    }
}

/// Store statistics.
#[derive(Clone, Debug)]
pub struct StoreStats {
    pub items: usize,
    pub settings: IndexSettings,
    pub session_active: bool,
    /// `None` when the WAL is disabled.
    pub wal: Option<WalStats>,
    pub operations_log: LogStats,
    pub queue: QueueStats,
}

/// Result of [`Store::compact`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub items: usize,
    /// WAL entries recovered before compacting.
    pub recovered: usize,
    /// Operations log entries folded into the primary file.
    pub log_entries: usize,
    pub log_bytes_reclaimed: u64,
    pub orphans_removed: usize,
    pub backups_removed: usize,
}

/// Result of [`Store::snapshot`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub items: usize,
    pub metadata_files: usize,
}

/// The committed view readers observe. Replaced as a whole on commit.
#[derive(Debug, Default)]
pub(crate) struct Committed {
    pub(crate) settings: IndexSettings,
    pub(crate) items: ItemMap,
}

impl Committed {
    fn from_index(index: &IndexFile) -> Self {
        Self {
            settings: index.settings.clone(),
            items: ItemMap::from_items(index.items.clone()),
        }
    }
}

/// Durable state read while holding the write lock.
pub(crate) struct Loaded {
    pub(crate) index: IndexFile,
    pub(crate) wal: Option<WriteAheadLog>,
    pub(crate) oplog: OperationsLog,
    pub(crate) recovered: usize,
}

/// State shared between the store handle and queue handlers.
pub(crate) struct Shared {
    pub(crate) config: StoreConfig,
    pub(crate) lease: Arc<dyn LeaseBackend>,
    pub(crate) committed: RwLock<Arc<Committed>>,
    pub(crate) session: Mutex<Option<SessionState>>,
    pub(crate) metadata: MetadataFiles,
    pub(crate) validator: Arc<dyn ItemValidator>,
    pub(crate) vector_index: Mutex<Option<Box<dyn VectorIndex>>>,
    pub(crate) next_token: AtomicU64,
    /// Held by a `begin_update` that is still waiting for the lease.
    pub(crate) starting: AtomicBool,
    pub(crate) policy: RetryPolicy,
}

impl Shared {
    pub(crate) fn dir(&self) -> &Path {
        &self.config.path
    }

    pub(crate) fn committed(&self) -> Arc<Committed> {
        Arc::clone(&self.committed.read())
    }

    /// A session is open or being opened in this store.
    pub(crate) fn session_busy(&self) -> bool {
        self.starting.load(Ordering::SeqCst) || self.session.lock().is_some()
    }

    /// Reload the primary file and fold in un-checkpointed WAL entries.
    /// Caller must hold the write lock.
    pub(crate) fn load_locked(&self) -> Result<Loaded> {
        let dir = self.dir();
        let mut index = IndexFile::load(dir)?.unwrap_or_else(|| IndexFile::new(self.config.settings.clone()));
        let oplog = OperationsLog::open(dir, self.config.operations_log)?;
        let wal = if self.config.wal.enabled {
            Some(WriteAheadLog::open(dir, self.config.wal)?)
        } else {
            None
        };

        let mut recovered = 0;
        if let Some(wal) = &wal {
            let pending = decode_entries(&wal.entries_since_checkpoint()?);
            if !pending.is_empty() {
                // The log gets the same entries so folding it onto the
                // primary file keeps matching what the file now holds.
                oplog.append_all(&pending)?;
                let mut items = ItemMap::from_items(std::mem::take(&mut index.items));
                apply_entries(&mut items, &pending);
                index.items = items.into_items();
                establish_dimension(&mut index);
                index.save(dir, &self.policy)?;
                self.sync_checksums(&index)?;
                wal.checkpoint()?;
                recovered = pending.len();
                info!(recovered, dir = %dir.display(), "recovered un-checkpointed wal entries");
            }
        }
        establish_dimension(&mut index);
        self.install(&index);

        Ok(Loaded {
            index,
            wal,
            oplog,
            recovered,
        })
    }

    /// Make `index` the committed view if it differs from the current one.
    pub(crate) fn install(&self, index: &IndexFile) {
        let next = Committed::from_index(index);
        {
            let mut committed = self.committed.write();
            if committed.settings == next.settings && committed.items == next.items {
                return;
            }
            *committed = Arc::new(next);
        }
        debug!(items = index.items.len(), "installed new committed view");
        self.rebuild_vector_index();
    }

    pub(crate) fn rebuild_vector_index(&self) {
        let committed = self.committed();
        if let Some(index) = self.vector_index.lock().as_mut() {
            if let Err(e) = index.rebuild(committed.items.as_slice()) {
                warn!(error = %e, "vector index rebuild failed");
            }
        }
    }

    /// Apply per-id changes to the vector index and save it. Falls back to
    /// a full rebuild when an incremental update fails.
    pub(crate) fn sync_vector_index(&self, touched: &[(String, Option<StoreItem>)], items: &ItemMap) -> bool {
        let mut guard = self.vector_index.lock();
        let Some(index) = guard.as_mut() else {
            return true;
        };
        let dir = self.dir();

        let Err(e) = update_vector_index(&mut **index, touched, items, dir) else {
            return true;
        };
        warn!(error = %e, "incremental vector index update failed, rebuilding");
        match index.rebuild(items.as_slice()).and_then(|_| index.save(dir)) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "vector index rebuild failed");
                false
            }
        }
    }

    /// Rewrite `checksums.json` for the primary file and referenced metadata.
    pub(crate) fn refresh_checksums(&self, index: &IndexFile) -> Result<ChecksumManifest> {
        integrity::update_checksums(self.dir(), tracked_files(index))
    }

    /// Bring the manifest in line with a freshly saved primary file. Without
    /// tracking, a manifest left by an explicit refresh would no longer
    /// match, so it is removed.
    pub(crate) fn sync_checksums(&self, index: &IndexFile) -> Result<()> {
        if self.config.track_checksums {
            self.refresh_checksums(index)?;
        } else {
            integrity::remove_manifest(self.dir())?;
        }
        Ok(())
    }
}

/// An embedded, crash-safe vector store.
///
/// Mutations run inside an [`UpdateSession`]; every mutation passes through
/// the store's operation queue, is written to the WAL and the operations
/// log, and becomes visible to readers when the session ends.
pub struct Store {
    pub(crate) shared: Arc<Shared>,
    pub(crate) queue: OperationQueue<Mutation, Outcome>,
}

impl Store {
    /// Open a store with the default collaborators.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with(config, Collaborators::default())
    }

    /// Open (or create) a store.
    ///
    /// An unreadable primary file fails with `Corruption`. Un-checkpointed
    /// WAL entries are replayed and persisted when the write lock is free
    /// or stale. While a live writer holds it, the primary file is served
    /// as is and recovery is left to the next locked operation.
    pub fn open_with(config: StoreConfig, collaborators: Collaborators) -> Result<Self> {
        let dir = config.path.clone();
        if !dir.exists() {
            if !config.create_if_missing {
                return Err(StoreError::NotInitialized);
            }
            fs::create_dir_all(&dir)?;
        }

        let policy = RetryPolicy::default();
        let index = match IndexFile::load(&dir)? {
            Some(index) => index,
            None if config.create_if_missing => {
                let index = IndexFile::new(config.settings.clone());
                index.save(&dir, &policy)?;
                info!(dir = %dir.display(), "created store");
                index
            }
            None => return Err(StoreError::NotInitialized),
        };

        let shared = Arc::new(Shared {
            lease: Arc::new(FileLeaseBackend::new(&dir, config.lock.stale_after)),
            committed: RwLock::new(Arc::new(Committed::from_index(&index))),
            session: Mutex::new(None),
            metadata: MetadataFiles::new(&dir, collaborators.sanitizer, config.metadata_cache_size),
            validator: collaborators.validator,
            vector_index: Mutex::new(collaborators.vector_index),
            next_token: AtomicU64::new(1),
            starting: AtomicBool::new(false),
            policy,
            config,
        });

        let recovered = Self::recover_on_open(&shared)?;
        Self::load_vector_index(&shared, recovered);

        let queue = OperationQueue::new(shared.config.queue);
        session::register_handlers(&queue, &shared);
        debug!(dir = %dir.display(), items = shared.committed().items.len(), "opened store");
        Ok(Self { shared, queue })
    }

    fn recover_on_open(shared: &Arc<Shared>) -> Result<usize> {
        if !shared.config.wal.enabled {
            return Ok(0);
        }
        let pending = wal::pending_entries(shared.dir(), shared.config.wal.checksums)?;
        if pending.is_empty() {
            return Ok(0);
        }

        // A live holder owns these entries through an open session; they
        // are not crash leftovers and must stay invisible until it commits.
        let Some(lock) = try_acquire_with(Arc::clone(&shared.lease))? else {
            debug!(
                entries = pending.len(),
                "store is write-locked; serving the primary file without wal replay"
            );
            return Ok(0);
        };
        let loaded = shared.load_locked();
        let released = lock.release();
        let recovered = loaded?.recovered;
        released?;
        Ok(recovered)
    }

    fn load_vector_index(shared: &Shared, recovered: usize) {
        let mut guard = shared.vector_index.lock();
        let Some(index) = guard.as_mut() else {
            return;
        };
        if recovered == 0 && index.load(shared.dir()).is_ok() {
            return;
        }
        let committed = shared.committed();
        if let Err(e) = index.rebuild(committed.items.as_slice()) {
            warn!(error = %e, "vector index rebuild failed");
        }
    }

    /// Store directory.
    pub fn path(&self) -> &Path {
        self.shared.dir()
    }

    /// Committed index settings.
    pub fn settings(&self) -> IndexSettings {
        self.shared.committed().settings.clone()
    }

    /// Number of committed items.
    pub fn len(&self) -> usize {
        self.shared.committed().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // --- Update sessions ---

    /// Start an update session, waiting for the write lock.
    ///
    /// Fails with `UpdateInProgress` if this store already has an open
    /// session. Un-checkpointed WAL entries are persisted before staging.
    pub fn begin_update(&self) -> Result<UpdateSession<'_>> {
        let _reserved = Reservation::take(&self.shared.starting)?;
        if self.shared.session.lock().is_some() {
            return Err(StoreError::UpdateInProgress);
        }
        let lock = acquire_with(Arc::clone(&self.shared.lease), &self.shared.config.lock.acquire)?;
        let loaded = self.shared.load_locked()?;

        let token = self.shared.next_token.fetch_add(1, Ordering::SeqCst);
        *self.shared.session.lock() = Some(SessionState::new(token, loaded));

        debug!(token, "update session started");
        Ok(UpdateSession::new(self, token, lock))
    }

    /// Run `f` in a session: commit if it succeeds, cancel if it fails.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&UpdateSession<'_>) -> Result<T>,
    {
        let session = self.begin_update()?;
        match f(&session) {
            Ok(value) => {
                session.end()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(cancel) = session.cancel() {
                    warn!(error = %cancel, "failed to cancel update session");
                }
                Err(e)
            }
        }
    }

    /// Insert one item in its own session.
    pub fn insert(&self, item: NewItem) -> Result<StoreItem> {
        self.update(|s| s.insert(item))
    }

    /// Insert or replace one item in its own session.
    pub fn upsert(&self, item: NewItem) -> Result<StoreItem> {
        self.update(|s| s.upsert(item))
    }

    /// Delete one item in its own session. Returns whether it existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        self.update(|s| s.delete(id))
    }

    // --- Reads ---

    /// A committed item with its metadata resolved.
    pub fn get(&self, id: &str) -> Result<Option<StoreItem>> {
        let committed = self.shared.committed();
        committed
            .items
            .get(id)
            .map(|item| self.shared.metadata.materialize(item))
            .transpose()
    }

    /// All committed items in insertion order, metadata resolved.
    pub fn list(&self) -> Result<Vec<StoreItem>> {
        let committed = self.shared.committed();
        committed
            .items
            .iter()
            .map(|item| self.shared.metadata.materialize(item))
            .collect()
    }

    /// Nearest neighbours from the attached vector index.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(String, f32)>> {
        let guard = self.shared.vector_index.lock();
        let index = guard.as_ref().ok_or(StoreError::NotInitialized)?;
        index.search(query, k)
    }

    // --- Maintenance ---

    /// Fold the operations log into the primary file, then remove orphaned
    /// metadata files and expired backups.
    pub fn compact(&self) -> Result<CompactionReport> {
        self.exclusive(|loaded| {
            let dir = self.shared.dir();
            let entries = loaded.oplog.read_entries()?;
            let bytes_before = loaded.oplog.stats()?.total_bytes();

            let mut items = ItemMap::from_items(loaded.index.items.clone());
            apply_entries(&mut items, &entries);
            let mut index = IndexFile {
                settings: loaded.index.settings.clone(),
                items: items.into_items(),
            };
            establish_dimension(&mut index);

            let primary = dir.join(INDEX_FILE);
            if primary.exists() {
                atomic::create_backup(&primary)?;
            }
            index.save(dir, &self.shared.policy)?;
            loaded.oplog.clear()?;
            if let Some(wal) = &loaded.wal {
                wal.checkpoint()?;
            }

            let orphans = metadata::remove_orphans(dir, &index.items)?;
            let backups = atomic::cleanup_backups(dir, INDEX_BACKUP_GLOB, self.shared.config.backup_max_age)?;
            self.shared.sync_checksums(&index)?;
            self.shared.install(&index);

            let report = CompactionReport {
                items: index.items.len(),
                recovered: loaded.recovered,
                log_entries: entries.len(),
                log_bytes_reclaimed: bytes_before.saturating_sub(loaded.oplog.stats()?.total_bytes()),
                orphans_removed: orphans.len(),
                backups_removed: backups.len(),
            };
            info!(
                items = report.items,
                log_entries = report.log_entries,
                orphans = report.orphans_removed,
                "compacted store"
            );
            Ok(report)
        })
    }

    /// Write a self-contained copy of the committed state to `target`:
    /// primary file, referenced metadata files and a checksum manifest.
    pub fn snapshot(&self, target: impl AsRef<Path>) -> Result<SnapshotInfo> {
        let target = target.as_ref();
        if target.join(INDEX_FILE).exists() {
            return Err(StoreError::InvalidPath(format!(
                "{} already contains a store",
                target.display()
            )));
        }
        fs::create_dir_all(target)?;

        let committed = self.shared.committed();
        let index = IndexFile {
            settings: committed.settings.clone(),
            items: committed.items.as_slice().to_vec(),
        };

        // Metadata first, so the primary file never references a missing file.
        let mut metadata_files = 0;
        for name in index.items.iter().filter_map(|i| i.metadata_file.as_deref()) {
            let bytes = fs::read(self.shared.dir().join(name))?;
            atomic::write(&target.join(name), &bytes, &self.shared.policy)?;
            metadata_files += 1;
        }
        index.save(target, &self.shared.policy)?;
        integrity::update_checksums(target, tracked_files(&index))?;

        info!(target = %target.display(), items = index.items.len(), "wrote snapshot");
        Ok(SnapshotInfo {
            path: target.to_path_buf(),
            items: index.items.len(),
            metadata_files,
        })
    }

    /// Operations log statistics, read without locking.
    pub fn operations_log_stats(&self) -> Result<LogStats> {
        log_stats(self.shared.dir())
    }

    /// Collapse the operations log to one entry per live id.
    pub fn compact_operations_log(&self) -> Result<LogCompaction> {
        self.exclusive(|loaded| loaded.oplog.compact())
    }

    /// Seal the active operations log segment.
    pub fn rotate_operations_log(&self) -> Result<Option<PathBuf>> {
        self.exclusive(|loaded| loaded.oplog.rotate())
    }

    /// WAL statistics, read without locking. `None` when the WAL is disabled.
    pub fn wal_stats(&self) -> Result<Option<WalStats>> {
        if !self.shared.config.wal.enabled {
            return Ok(None);
        }
        wal::inspect(self.shared.dir(), self.shared.config.wal.checksums).map(Some)
    }

    /// Replay every retained WAL entry onto the primary file and checkpoint.
    /// Returns the number of entries replayed. Replay is idempotent, so
    /// entries already reflected in the primary file change nothing.
    pub fn recover_from_wal(&self) -> Result<usize> {
        self.exclusive(|loaded| {
            let Some(wal) = &loaded.wal else {
                return Ok(0);
            };
            let ops = decode_entries(&wal.read_entries()?);
            let mut items = ItemMap::from_items(loaded.index.items.clone());
            apply_entries(&mut items, &ops);

            let mut index = IndexFile {
                settings: loaded.index.settings.clone(),
                items: items.into_items(),
            };
            establish_dimension(&mut index);
            if index != loaded.index {
                warn!("wal replay changed checkpointed state; rewriting primary file");
                loaded.oplog.append_all(&ops)?;
                index.save(self.shared.dir(), &self.shared.policy)?;
                self.shared.sync_checksums(&index)?;
            }
            wal.checkpoint()?;
            self.shared.install(&index);
            info!(replayed = ops.len(), "recovered from wal");
            Ok(ops.len())
        })
    }

    /// Delete sealed WAL segments beyond the most recent `keep`.
    pub fn cleanup_wal(&self, keep: usize) -> Result<usize> {
        self.exclusive(|loaded| match &loaded.wal {
            Some(wal) => wal.cleanup(keep),
            None => Ok(0),
        })
    }

    /// Recompute `checksums.json` for the primary file and metadata files.
    pub fn update_checksums(&self) -> Result<ChecksumManifest> {
        self.exclusive(|loaded| self.shared.refresh_checksums(&loaded.index))
    }

    pub fn verify_integrity(&self, options: VerifyOptions) -> Result<IntegrityReport> {
        integrity::verify_index_integrity(self.shared.dir(), options)
    }

    pub fn generate_integrity_report(&self) -> Result<String> {
        integrity::generate_integrity_report(self.shared.dir())
    }

    /// Repair the store directory. See [`integrity::repair_index`].
    pub fn repair_index(&self, mut options: RepairOptions) -> Result<RepairReport> {
        if self.shared.session_busy() {
            return Err(StoreError::UpdateInProgress);
        }
        options.lock = self.shared.config.lock;
        integrity::repair_index(self.shared.dir(), options)
    }

    /// Remove metadata files not referenced by any item.
    pub fn cleanup_orphans(&self) -> Result<Vec<PathBuf>> {
        self.exclusive(|loaded| {
            let mut items = ItemMap::from_items(loaded.index.items.clone());
            apply_entries(&mut items, &loaded.oplog.read_entries()?);
            let referenced: Vec<&StoreItem> = loaded.index.items.iter().chain(items.iter()).collect();
            metadata::remove_orphans(self.shared.dir(), referenced)
        })
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let committed = self.shared.committed();
        Ok(StoreStats {
            items: committed.items.len(),
            settings: committed.settings.clone(),
            session_active: self.shared.session_busy(),
            wal: self.wal_stats()?,
            operations_log: self.operations_log_stats()?,
            queue: self.queue.stats(),
        })
    }

    /// Queue counters.
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Receive queue lifecycle events. Slow subscribers are dropped.
    pub fn subscribe(&self, buffer: usize) -> Receiver<QueueEvent> {
        self.queue.subscribe(buffer)
    }

    // --- Private Helpers ---

    /// Run `f` holding the write lock, with no session open in this store.
    fn exclusive<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Loaded) -> Result<T>,
    {
        if self.shared.session_busy() {
            return Err(StoreError::UpdateInProgress);
        }
        let lock = acquire_with(Arc::clone(&self.shared.lease), &self.shared.config.lock.acquire)?;
        let result = self.shared.load_locked().and_then(|loaded| f(&loaded));
        let released = lock.release();
        let value = result?;
        released?;
        Ok(value)
    }
}

/// Claim on the right to open a session, released on drop.
struct Reservation<'a>(&'a AtomicBool);

impl<'a> Reservation<'a> {
    fn take(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| Reservation(flag))
            .map_err(|_| StoreError::UpdateInProgress)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Decode WAL payloads into log entries, skipping any that do not parse.
pub(crate) fn decode_entries(entries: &[WalEntry]) -> Vec<OperationsLogEntry> {
    entries
        .iter()
        .filter_map(|entry| match serde_json::from_str::<LogOperation>(&entry.payload) {
            Ok(operation) => Some(OperationsLogEntry {
                timestamp: entry.timestamp,
                operation,
            }),
            Err(e) => {
                warn!(id = entry.id, error = %e, "skipping undecodable wal payload");
                None
            }
        })
        .collect()
}

fn update_vector_index(
    index: &mut dyn VectorIndex,
    touched: &[(String, Option<StoreItem>)],
    items: &ItemMap,
    dir: &Path,
) -> Result<()> {
    for (id, before) in touched {
        match (before, items.get(id)) {
            (None, Some(after)) => index.add(id, &after.vector)?,
            (Some(_), Some(after)) => index.update(id, &after.vector)?,
            (Some(_), None) => index.remove(id)?,
            (None, None) => {}
        }
    }
    index.save(dir)
}

/// Fix the dimension from the first item when not yet established.
fn establish_dimension(index: &mut IndexFile) {
    if index.settings.dimension.is_none() {
        index.settings.dimension = index.items.first().map(|i| i.vector.len());
    }
}

/// Files covered by the checksum manifest.
fn tracked_files(index: &IndexFile) -> Vec<String> {
    let mut files = vec![INDEX_FILE.to_string()];
    files.extend(index.items.iter().filter_map(|i| i.metadata_file.clone()));
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MetadataStorage, MetadataValue};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            path: dir.path().join("store"),
            settings: IndexSettings::with_dimension(3),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_store() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(test_config(&dir)).unwrap();
        assert!(store.is_empty());
        assert!(store.path().join(INDEX_FILE).exists());
        assert_eq!(store.settings().dimension, Some(3));
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            create_if_missing: false,
            ..test_config(&dir)
        };
        assert!(matches!(Store::open(config), Err(StoreError::NotInitialized)));
    }

    #[test]
    fn test_insert_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(test_config(&dir)).unwrap();

        let item = store
            .insert(NewItem::new(vec![3.0, 4.0, 0.0]).with_id("a").with_metadata("k", "v"))
            .unwrap();
        assert_eq!(item.norm, 5.0);

        let got = store.get("a").unwrap().unwrap();
        assert_eq!(got.metadata["k"], MetadataValue::from("v"));
        assert!(matches!(
            store.insert(NewItem::new(vec![1.0, 0.0, 0.0]).with_id("a")),
            Err(StoreError::DuplicateId(_))
        ));

        assert!(store.delete("a").unwrap());
        assert!(!store.delete("a").unwrap());
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn test_generated_ids_and_dimension() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig {
            settings: IndexSettings::default(),
            ..test_config(&dir)
        })
        .unwrap();

        let item = store.insert(NewItem::new(vec![1.0, 2.0])).unwrap();
        assert!(!item.id.is_empty());
        assert_eq!(store.settings().dimension, Some(2));
        assert!(matches!(
            store.insert(NewItem::new(vec![1.0, 2.0, 3.0])),
            Err(StoreError::DimensionMismatch { expected: 2, got: 3 })
        ));
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(test_config(&dir)).unwrap();
            store.insert(NewItem::new(vec![1.0, 0.0, 0.0]).with_id("x")).unwrap();
            store.upsert(NewItem::new(vec![0.0, 1.0, 0.0]).with_id("x")).unwrap();
        }
        let store = Store::open(test_config(&dir)).unwrap();
        assert_eq!(store.get("x").unwrap().unwrap().vector, vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_external_metadata_and_compaction() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.settings.metadata_storage = MetadataStorage::External;
        let store = Store::open(config).unwrap();

        store
            .insert(NewItem::new(vec![1.0, 0.0, 0.0]).with_id("a").with_metadata("v", 1i64))
            .unwrap();
        store
            .upsert(NewItem::new(vec![1.0, 0.0, 0.0]).with_id("a").with_metadata("v", 2i64))
            .unwrap();
        assert_eq!(metadata::list_metadata_files(store.path()).unwrap().len(), 2);
        assert_eq!(store.get("a").unwrap().unwrap().metadata["v"], MetadataValue::from(2i64));

        let report = store.compact().unwrap();
        assert_eq!(report.items, 1);
        assert_eq!(report.log_entries, 2);
        assert_eq!(report.orphans_removed, 1);
        assert_eq!(store.operations_log_stats().unwrap().entries, 0);
        assert_eq!(store.get("a").unwrap().unwrap().metadata["v"], MetadataValue::from(2i64));
    }

    #[test]
    fn test_snapshot_is_a_valid_store() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(test_config(&dir)).unwrap();
        store.insert(NewItem::new(vec![1.0, 0.0, 0.0]).with_id("a")).unwrap();

        let target = dir.path().join("snap");
        let info = store.snapshot(&target).unwrap();
        assert_eq!(info.items, 1);
        assert!(integrity::verify_index_integrity(&target, VerifyOptions::default())
            .unwrap()
            .valid);
        assert!(matches!(store.snapshot(&target), Err(StoreError::InvalidPath(_))));

        let copy = Store::open(StoreConfig {
            path: target,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(copy.len(), 1);
    }

    #[test]
    fn test_session_reserved_while_starting() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(test_config(&dir)).unwrap();

        store.shared.starting.store(true, Ordering::SeqCst);
        assert!(matches!(store.begin_update(), Err(StoreError::UpdateInProgress)));
        assert!(matches!(store.compact(), Err(StoreError::UpdateInProgress)));
        assert!(store.stats().unwrap().session_active);

        store.shared.starting.store(false, Ordering::SeqCst);
        store.begin_update().unwrap().end().unwrap();
        assert!(!store.shared.starting.load(Ordering::SeqCst));
    }

    #[test]
    fn test_racing_sessions_on_one_handle() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(test_config(&dir)).unwrap();
        let start = std::sync::Barrier::new(2);
        let decided = std::sync::Barrier::new(2);

        let (store, start, decided) = (&store, &start, &decided);
        let results: Vec<bool> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(move || {
                        start.wait();
                        let result = store.begin_update();
                        let won = match &result {
                            Ok(_) => true,
                            Err(StoreError::UpdateInProgress) => false,
                            Err(e) => panic!("unexpected error: {}", e),
                        };
                        decided.wait();
                        won
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|won| **won).count(), 1);
        assert!(!store.stats().unwrap().session_active);
    }

    #[test]
    fn test_commit_never_leaves_a_stale_manifest() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(test_config(&dir)).unwrap();
        store.insert(NewItem::new(vec![1.0, 0.0, 0.0]).with_id("a")).unwrap();
        store.update_checksums().unwrap();
        assert!(store.path().join(integrity::CHECKSUM_FILE).exists());

        store.insert(NewItem::new(vec![0.0, 1.0, 0.0]).with_id("b")).unwrap();
        let report = store.verify_integrity(VerifyOptions::default()).unwrap();
        assert!(report.valid, "{:?}", report.errors);
        assert!(!store.path().join(integrity::CHECKSUM_FILE).exists());

        store.update_checksums().unwrap();
        store.compact().unwrap();
        assert!(store.verify_integrity(VerifyOptions::default()).unwrap().valid);
    }

    #[test]
    fn test_tracked_manifest_follows_commits() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(StoreConfig {
            track_checksums: true,
            ..test_config(&dir)
        })
        .unwrap();
        store.insert(NewItem::new(vec![1.0, 0.0, 0.0]).with_id("a")).unwrap();
        store.insert(NewItem::new(vec![0.0, 1.0, 0.0]).with_id("b")).unwrap();

        let report = store.verify_integrity(VerifyOptions::default()).unwrap();
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    }

    #[test]
    fn test_stats() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(test_config(&dir)).unwrap();
        store.insert(NewItem::new(vec![1.0, 0.0, 0.0])).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.items, 1);
        assert!(!stats.session_active);
        let wal = stats.wal.unwrap();
        assert_eq!(wal.entries, 1);
        assert_eq!(wal.pending, 0);
        assert_eq!(stats.operations_log.entries, 1);
        assert_eq!(stats.queue.completed, 2);
    }
}
