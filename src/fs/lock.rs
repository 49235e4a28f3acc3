//! Cross-process write lock.
//!
//! A lock is a lease record in `write.lock`, created with exclusive-create so
//! at most one holder can exist per store directory. The holder keeps an OS
//! advisory lock on the file for as long as it lives; a lock file nobody
//! holds that has not been renewed within `stale_after` can be reclaimed.

use crate::error::{Result, StoreError};
use crate::retry::RetryPolicy;
use crate::types::Timestamp;
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Name of the lock file inside a store directory.
pub const LOCK_FILE: &str = "write.lock";

/// A lock file whose record cannot be parsed is only reclaimed after this
/// long, so a holder caught between create and write is never evicted.
const MIN_UNREADABLE_AGE: Duration = Duration::from_secs(1);

/// Bounded attempts at the create/reclaim cycle within one `try_acquire`.
const RECLAIM_ROUNDS: usize = 3;

/// A granted lease.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub token: String,
    pub pid: u32,
    pub acquired_at: Timestamp,
    pub renewed_at: Timestamp,
}

/// What a backend observes about the lock without taking it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockState {
    Free,
    /// Held by a live owner, or not yet old enough to reclaim.
    Held(Option<Lease>),
    /// Present but reclaimable.
    Stale(Option<Lease>),
}

/// Storage for leases. Implementations must guarantee that at most one
/// unreleased lease exists at any instant.
pub trait LeaseBackend: Send + Sync {
    /// Take the lease if free or stale, without waiting.
    fn try_acquire(&self, holder: &str) -> Result<Option<Lease>>;

    /// Refresh the renewal time of a lease this backend granted.
    fn renew(&self, lease: &Lease) -> Result<Lease>;

    /// Give the lease back. Releasing an unknown lease is a no-op.
    fn release(&self, lease: &Lease) -> Result<()>;

    /// Side-effect-free observation of the current state.
    fn inspect(&self) -> Result<LockState>;
}

/// Lock acquisition options.
#[derive(Clone, Copy, Debug)]
pub struct LockOptions {
    /// Minimum age since last renewal before an unowned lock is reclaimable.
    pub stale_after: Duration,
    /// Polling policy for blocking acquisition.
    pub acquire: RetryPolicy,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(15),
            acquire: RetryPolicy {
                max_attempts: 80,
                base_delay: Duration::from_millis(25),
                max_delay: Duration::from_millis(500),
            },
        }
    }
}

/// File-backed lease store.
pub struct FileLeaseBackend {
    path: PathBuf,
    stale_after: Duration,
    /// Open handles of leases granted by this backend, keyed by token.
    held: Mutex<HashMap<String, File>>,
}

impl FileLeaseBackend {
    pub fn new(dir: impl AsRef<Path>, stale_after: Duration) -> Self {
        Self {
            path: dir.as_ref().join(LOCK_FILE),
            stale_after,
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn create(&self, holder: &str) -> Result<Option<Lease>> {
        let mut file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // A reclaimer may be inspecting the fresh file; it only holds the
        // advisory lock briefly, so wait for it.
        file.lock_exclusive()?;

        let now = Timestamp::now();
        let lease = Lease {
            holder: holder.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
            acquired_at: now,
            renewed_at: now,
        };
        write_record(&mut file, &lease)?;
        self.held.lock().insert(lease.token.clone(), file);
        Ok(Some(lease))
    }

    /// Classify an existing lock file. Returns the handle still holding the
    /// advisory lock when the file is reclaimable.
    fn examine(&self) -> Result<(LockState, Option<File>)> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((LockState::Free, None)),
            Err(e) => return Err(e.into()),
        };

        let record = read_record(&mut file);
        if file.try_lock_exclusive().is_err() {
            return Ok((LockState::Held(record), None));
        }

        // The path may have been replaced between open and lock.
        if !same_file(&file, &self.path)? {
            FileExt::unlock(&file)?;
            return Ok((LockState::Held(None), None));
        }

        let (age, threshold) = match &record {
            Some(lease) => (lease.renewed_at.elapsed(), self.stale_after),
            None => {
                let age = file
                    .metadata()?
                    .modified()?
                    .elapsed()
                    .unwrap_or_default();
                (age, self.stale_after.max(MIN_UNREADABLE_AGE))
            }
        };

        if age >= threshold {
            Ok((LockState::Stale(record), Some(file)))
        } else {
            FileExt::unlock(&file)?;
            Ok((LockState::Held(record), None))
        }
    }
}

impl LeaseBackend for FileLeaseBackend {
    fn try_acquire(&self, holder: &str) -> Result<Option<Lease>> {
        for _ in 0..RECLAIM_ROUNDS {
            if let Some(lease) = self.create(holder)? {
                debug!(path = %self.path.display(), token = %lease.token, "write lock acquired");
                return Ok(Some(lease));
            }

            match self.examine()? {
                (LockState::Free, _) => continue,
                (LockState::Held(_), _) => return Ok(None),
                (LockState::Stale(record), guard) => {
                    warn!(
                        path = %self.path.display(),
                        previous_holder = record.as_ref().map(|l| l.holder.as_str()).unwrap_or("unknown"),
                        "reclaiming stale write lock"
                    );
                    match fs::remove_file(&self.path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e.into()),
                    }
                    drop(guard);
                }
            }
        }
        Ok(None)
    }

    fn renew(&self, lease: &Lease) -> Result<Lease> {
        let mut held = self.held.lock();
        let file = held
            .get_mut(&lease.token)
            .ok_or_else(|| StoreError::LeaseNotHeld(lease.token.clone()))?;
        let renewed = Lease {
            renewed_at: Timestamp::now(),
            ..lease.clone()
        };
        write_record(file, &renewed)?;
        Ok(renewed)
    }

    fn release(&self, lease: &Lease) -> Result<()> {
        let Some(file) = self.held.lock().remove(&lease.token) else {
            return Ok(());
        };

        // Only remove the path if it is still our file.
        if same_file(&file, &self.path)? {
            match fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        FileExt::unlock(&file)?;
        debug!(path = %self.path.display(), token = %lease.token, "write lock released");
        Ok(())
    }

    fn inspect(&self) -> Result<LockState> {
        let (state, guard) = self.examine()?;
        if let Some(file) = guard {
            FileExt::unlock(&file)?;
        }
        Ok(state)
    }
}

/// Handle for a held write lock. Released on drop.
pub struct WriteLock {
    backend: Arc<dyn LeaseBackend>,
    lease: Mutex<Lease>,
    released: AtomicBool,
}

impl std::fmt::Debug for WriteLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteLock")
            .field("lease", &*self.lease.lock())
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

impl WriteLock {
    /// The current lease.
    pub fn lease(&self) -> Lease {
        self.lease.lock().clone()
    }

    /// Push the renewal time forward.
    pub fn renew(&self) -> Result<()> {
        let mut lease = self.lease.lock();
        *lease = self.backend.renew(&lease)?;
        Ok(())
    }

    /// Release the lock. Calling this more than once is a no-op.
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.backend.release(&self.lease.lock())
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to release write lock on drop");
        }
    }
}

/// Take a lease from `backend` without waiting.
pub fn try_acquire_with(backend: Arc<dyn LeaseBackend>) -> Result<Option<WriteLock>> {
    let holder = default_holder();
    Ok(backend.try_acquire(&holder)?.map(|lease| WriteLock {
        backend,
        lease: Mutex::new(lease),
        released: AtomicBool::new(false),
    }))
}

/// Take a lease from `backend`, polling per `policy` until it is granted.
pub fn acquire_with(backend: Arc<dyn LeaseBackend>, policy: &RetryPolicy) -> Result<WriteLock> {
    let result = policy.run("acquire write lock", |_| {
        try_acquire_with(Arc::clone(&backend))?.ok_or(StoreError::Locked)
    });
    match result {
        Err(StoreError::RetriesExhausted { attempts, .. }) => Err(StoreError::LockTimeout { attempts }),
        other => other,
    }
}

/// Block until the write lock for `dir` is acquired or the policy gives up.
pub fn acquire_write_lock(dir: &Path, options: &LockOptions) -> Result<WriteLock> {
    acquire_with(file_backend(dir, options), &options.acquire)
}

/// Acquire the write lock for `dir` if it is available right now.
pub fn try_acquire_write_lock(dir: &Path, options: &LockOptions) -> Result<Option<WriteLock>> {
    try_acquire_with(file_backend(dir, options))
}

/// Whether `dir` is currently write-locked by a holder that is not reclaimable.
pub fn is_write_locked(dir: &Path, options: &LockOptions) -> Result<bool> {
    let backend = FileLeaseBackend::new(dir, options.stale_after);
    Ok(matches!(backend.inspect()?, LockState::Held(_)))
}

fn file_backend(dir: &Path, options: &LockOptions) -> Arc<dyn LeaseBackend> {
    Arc::new(FileLeaseBackend::new(dir, options.stale_after))
}

fn default_holder() -> String {
    format!("pid-{}", std::process::id())
}

fn write_record(file: &mut File, lease: &Lease) -> Result<()> {
    let bytes = serde_json::to_vec(lease).map_err(|e| StoreError::Serialization(e.to_string()))?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&bytes)?;
    file.sync_data()?;
    Ok(())
}

fn read_record(file: &mut File) -> Option<Lease> {
    let mut buf = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut buf).ok()?;
    serde_json::from_str(&buf).ok()
}

#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn same_file(_file: &File, path: &Path) -> Result<bool> {
    Ok(path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use tempfile::TempDir;

    fn quick_options() -> LockOptions {
        LockOptions {
            stale_after: Duration::from_secs(60),
            acquire: RetryPolicy {
                max_attempts: 200,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
        }
    }

    #[test]
    fn test_try_acquire_on_held_lock_returns_none() {
        let dir = TempDir::new().unwrap();
        let options = quick_options();

        let lock = try_acquire_write_lock(dir.path(), &options).unwrap().unwrap();
        assert!(is_write_locked(dir.path(), &options).unwrap());
        assert!(try_acquire_write_lock(dir.path(), &options).unwrap().is_none());

        lock.release().unwrap();
        assert!(!is_write_locked(dir.path(), &options).unwrap());
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let lock = acquire_write_lock(dir.path(), &quick_options()).unwrap();

        lock.release().unwrap();
        lock.release().unwrap();
        assert!(lock.is_released());

        // A second holder can now take it, and our stale handle cannot evict it.
        let other = try_acquire_write_lock(dir.path(), &quick_options()).unwrap().unwrap();
        lock.release().unwrap();
        assert!(is_write_locked(dir.path(), &quick_options()).unwrap());
        drop(other);
    }

    #[test]
    fn test_concurrent_acquire_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().to_path_buf();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                let inside = Arc::clone(&inside);
                let max_seen = Arc::clone(&max_seen);
                thread::spawn(move || {
                    for _ in 0..5 {
                        let lock = acquire_write_lock(&path, &quick_options()).unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(2));
                        inside.fetch_sub(1, Ordering::SeqCst);
                        lock.release().unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_acquire_times_out() {
        let dir = TempDir::new().unwrap();
        let options = LockOptions {
            stale_after: Duration::from_secs(60),
            acquire: RetryPolicy::new(3, Duration::from_millis(1)),
        };
        let _held = acquire_write_lock(dir.path(), &options).unwrap();

        let result = acquire_write_lock(dir.path(), &options);
        assert!(matches!(result, Err(StoreError::LockTimeout { attempts: 3 })));
    }

    #[test]
    fn test_abandoned_lock_is_reclaimed_once_stale() {
        let dir = TempDir::new().unwrap();
        let now = Timestamp::now();
        let abandoned = Lease {
            holder: "pid-1".into(),
            token: "dead".into(),
            pid: 1,
            acquired_at: now,
            renewed_at: Timestamp(now.0 - 120_000_000),
        };
        fs::write(dir.path().join(LOCK_FILE), serde_json::to_vec(&abandoned).unwrap()).unwrap();

        // Old and unowned: reclaimable.
        let options = quick_options();
        assert!(!is_write_locked(dir.path(), &options).unwrap());
        let lock = try_acquire_write_lock(dir.path(), &options).unwrap().unwrap();
        assert_ne!(lock.lease().token, "dead");
    }

    #[test]
    fn test_live_owner_is_never_reclaimed() {
        let dir = TempDir::new().unwrap();
        let reclaim_eagerly = LockOptions {
            stale_after: Duration::ZERO,
            ..quick_options()
        };
        let lock = try_acquire_write_lock(dir.path(), &reclaim_eagerly).unwrap().unwrap();
        thread::sleep(Duration::from_millis(5));

        assert!(try_acquire_write_lock(dir.path(), &reclaim_eagerly).unwrap().is_none());
        assert!(is_write_locked(dir.path(), &reclaim_eagerly).unwrap());

        let before = lock.lease().renewed_at;
        lock.renew().unwrap();
        assert!(lock.lease().renewed_at >= before);
    }
}
