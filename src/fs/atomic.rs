//! Atomic file replacement.
//!
//! Every write lands in a uniquely named temp file in the target's directory,
//! is synced, and then renamed over the target. Readers therefore observe
//! either the complete old content or the complete new content.

use crate::error::{Result, StoreError};
use crate::retry::RetryPolicy;
use crate::types::Timestamp;
use globset::Glob;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Marker embedded in temp file names.
pub const TEMP_MARKER: &str = ".tmp-";

/// Marker embedded in backup file names.
pub const BACKUP_MARKER: &str = ".backup-";

/// Delay between read attempts that hit a missing file.
const READ_RETRY_DELAY: Duration = Duration::from_millis(10);

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Atomically replace `path` with `bytes`.
pub fn write(path: &Path, bytes: &[u8], policy: &RetryPolicy) -> Result<()> {
    policy.run("atomic write", |_| write_once(path, bytes))
}

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T, policy: &RetryPolicy) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    write(path, &bytes, policy)
}

/// Read a whole file, retrying briefly when it does not exist yet.
///
/// This tolerates a producer that is about to rename the file into place.
/// Other errors propagate immediately.
pub fn read(path: &Path, retries: u32) -> Result<Vec<u8>> {
    let mut attempt = 0;
    loop {
        match fs::read(path) {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound && attempt < retries => {
                attempt += 1;
                std::thread::sleep(READ_RETRY_DELAY * attempt);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Read and parse a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = read(path, 3)?;
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
}

/// Read, transform and atomically rewrite a JSON file as one retried unit.
///
/// `transform` receives `None` when the file does not exist. It may run more
/// than once, so it must not have side effects beyond computing the value.
pub fn update_json_file<T, F>(path: &Path, mut transform: F, policy: &RetryPolicy) -> Result<T>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(Option<T>) -> Result<T>,
{
    policy.run("json update", |_| {
        let current = match fs::read(path) {
            Ok(bytes) => Some(
                serde_json::from_slice(&bytes)
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?,
            ),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        let next = transform(current)?;
        let bytes = serde_json::to_vec_pretty(&next)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_once(path, &bytes)?;
        Ok(next)
    })
}

/// Copy `path` to a timestamped sibling and return the backup path.
pub fn create_backup(path: &Path) -> Result<PathBuf> {
    let name = file_name(path)?;
    let backup = path.with_file_name(format!("{}{}{}", name, BACKUP_MARKER, Timestamp::now().0));
    let bytes = fs::read(path)?;
    write_once(&backup, &bytes)?;
    debug!(source = %path.display(), backup = %backup.display(), "created backup");
    Ok(backup)
}

/// Atomically restore `target` from a backup created by [`create_backup`].
pub fn restore_backup(backup: &Path, target: &Path, policy: &RetryPolicy) -> Result<()> {
    let bytes = fs::read(backup)?;
    write(target, &bytes, policy)
}

/// Delete files in `dir` matching the glob `pattern` whose modification time
/// is older than `max_age`. Best effort: individual failures are logged.
pub fn cleanup_backups(dir: &Path, pattern: &str, max_age: Duration) -> Result<Vec<PathBuf>> {
    let matcher = Glob::new(pattern)?.compile_matcher();
    let mut removed = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !matcher.is_match(entry.file_name()) {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok());
        if age.map_or(false, |age| age >= max_age) {
            match fs::remove_file(entry.path()) {
                Ok(()) => removed.push(entry.path()),
                Err(e) => warn!(path = %entry.path().display(), error = %e, "failed to remove backup"),
            }
        }
    }

    Ok(removed)
}

/// Whether a file name looks like a leftover temp file from an interrupted write.
pub fn is_temp_file(name: &str) -> bool {
    name.starts_with('.') && name.contains(TEMP_MARKER)
}

/// Fsync a directory so renames inside it are durable.
pub fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

fn write_once(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp = temp_path(path)?;
    match write_and_rename(&temp, path, bytes) {
        Ok(()) => Ok(()),
        Err(e) => {
            if let Err(cleanup) = fs::remove_file(&temp) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    warn!(temp = %temp.display(), error = %cleanup, "failed to remove temp file");
                }
            }
            Err(e)
        }
    }
}

fn write_and_rename(temp: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(temp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(temp, path)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        sync_dir(parent)?;
    }
    Ok(())
}

fn temp_path(path: &Path) -> Result<PathBuf> {
    let name = file_name(path)?;
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    Ok(path.with_file_name(format!(
        ".{}{}{}-{}-{}",
        name,
        TEMP_MARKER,
        std::process::id(),
        Timestamp::now().0,
        counter
    )))
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| StoreError::InvalidPath(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn no_temp_files(dir: &Path) -> bool {
        fs::read_dir(dir)
            .unwrap()
            .all(|e| !is_temp_file(&e.unwrap().file_name().to_string_lossy()))
    }

    #[test]
    fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.json");

        write(&path, b"first", &RetryPolicy::default()).unwrap();
        write(&path, b"second", &RetryPolicy::default()).unwrap();

        assert_eq!(read(&path, 0).unwrap(), b"second");
        assert!(no_temp_files(dir.path()));
    }

    #[test]
    fn test_missing_parent_fails_immediately() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("data.json");

        let result = write(&path, b"x", &RetryPolicy::default());
        assert!(matches!(result, Err(StoreError::Io(ref e)) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn test_read_missing_file_errors_after_retries() {
        let dir = TempDir::new().unwrap();
        let result = read(&dir.path().join("nope"), 2);
        assert!(matches!(result, Err(StoreError::Io(_))));
    }

    #[test]
    fn test_concurrent_writers_never_mix() {
        let dir = TempDir::new().unwrap();
        let path = Arc::new(dir.path().join("shared.bin"));

        let payloads: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 64 * 1024]).collect();
        let handles: Vec<_> = payloads
            .iter()
            .cloned()
            .map(|payload| {
                let path = Arc::clone(&path);
                thread::spawn(move || write(&path, &payload, &RetryPolicy::default()).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let content = fs::read(&*path).unwrap();
        assert!(payloads.iter().any(|p| *p == content));
        assert!(no_temp_files(dir.path()));
    }

    #[test]
    fn test_update_json_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("counter.json");

        for _ in 0..3 {
            update_json_file(
                &path,
                |current: Option<serde_json::Value>| {
                    let n = current.and_then(|v| v["n"].as_u64()).unwrap_or(0);
                    Ok(json!({ "n": n + 1 }))
                },
                &RetryPolicy::default(),
            )
            .unwrap();
        }

        let value: serde_json::Value = read_json(&path).unwrap();
        assert_eq!(value["n"], 3);
    }

    #[test]
    fn test_backup_restore_and_cleanup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");
        write(&path, b"original", &RetryPolicy::default()).unwrap();

        let backup = create_backup(&path).unwrap();
        write(&path, b"changed", &RetryPolicy::default()).unwrap();
        restore_backup(&backup, &path, &RetryPolicy::default()).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"original");

        // Nothing is old enough yet.
        let removed = cleanup_backups(dir.path(), "index.json.backup-*", Duration::from_secs(3600)).unwrap();
        assert!(removed.is_empty());

        let removed = cleanup_backups(dir.path(), "index.json.backup-*", Duration::ZERO).unwrap();
        assert_eq!(removed, vec![backup]);
        assert!(path.exists());
    }
}
