//! Durability and concurrency tests.
//!
//! These exercise the guarantees that have to hold across processes and
//! crashes: one writer at a time, whole-file replacement, bounded logs and
//! idempotent recovery.

use proptest::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use vecvault::fs::atomic;
use vecvault::logs::OperationsLogConfig;
use vecvault::wal::{WalConfig, WalOperation, WriteAheadLog};
use vecvault::{IndexSettings, LockOptions, NewItem, RetryPolicy, Store, StoreConfig};

fn patient_lock() -> LockOptions {
    LockOptions {
        acquire: RetryPolicy {
            max_attempts: 5000,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        ..Default::default()
    }
}

fn store_config(path: &Path) -> StoreConfig {
    StoreConfig {
        path: path.to_path_buf(),
        settings: IndexSettings::with_dimension(2),
        lock: patient_lock(),
        ..Default::default()
    }
}

#[test]
fn test_writers_in_separate_stores_are_mutually_exclusive() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    Store::open(store_config(&path)).unwrap();

    let inside = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let writers: Vec<_> = (0..4)
        .map(|w| {
            let path = path.clone();
            let (inside, peak) = (Arc::clone(&inside), Arc::clone(&peak));
            thread::spawn(move || {
                let store = Store::open(store_config(&path)).unwrap();
                for i in 0..5 {
                    store
                        .update(|s| {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            s.insert(NewItem::new(vec![w as f32, i as f32]).with_id(format!("w{}-{}", w, i)))?;
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    let store = Store::open(store_config(&path)).unwrap();
    assert_eq!(store.len(), 20);
    assert_eq!(store.operations_log_stats().unwrap().entries, 20);
}

#[test]
fn test_concurrent_atomic_writes_never_expose_partial_files() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("doc.json");
    let policy = RetryPolicy::default();
    let payload = |n: usize| serde_json::to_vec(&vec![n; 4096]).unwrap();
    atomic::write(&path, &payload(0), &policy).unwrap();

    let writers: Vec<_> = (1..=4)
        .map(|n| {
            let path = path.clone();
            thread::spawn(move || {
                for _ in 0..20 {
                    atomic::write(&path, &payload(n), &RetryPolicy::default()).unwrap();
                }
            })
        })
        .collect();

    for _ in 0..200 {
        let bytes = fs::read(&path).unwrap();
        let values: Vec<usize> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(values.len(), 4096);
        assert!(values.iter().all(|v| *v == values[0]));
    }
    for writer in writers {
        writer.join().unwrap();
    }

    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| atomic::is_temp_file(&e.file_name().to_string_lossy()))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_operations_log_segments_stay_bounded() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreConfig {
        operations_log: OperationsLogConfig {
            max_bytes: 512,
            max_files: 2,
            compress: false,
        },
        ..store_config(&dir.path().join("store"))
    })
    .unwrap();

    for i in 0..40 {
        store.insert(NewItem::new(vec![i as f32, 1.0])).unwrap();
        assert!(store.operations_log_stats().unwrap().sealed_segments <= 2);
    }
    assert_eq!(store.len(), 40);
}

#[test]
fn test_wal_replay_skips_exactly_the_corrupted_entry() {
    let dir = TempDir::new().unwrap();
    let wal = WriteAheadLog::open(dir.path(), WalConfig::default()).unwrap();
    for i in 0..10 {
        wal.write_entry(WalOperation::Insert, format!("{{\"n\":{}}}", i)).unwrap();
    }
    drop(wal);

    let segment = dir.path().join("wal").join("wal.1.log");
    let content = fs::read_to_string(&segment).unwrap();
    let tampered: Vec<String> = content
        .lines()
        .enumerate()
        .map(|(n, line)| {
            if n == 6 {
                let mut entry: serde_json::Value = serde_json::from_str(line).unwrap();
                entry["payload"] = serde_json::Value::String("{\"n\":666}".into());
                entry.to_string()
            } else {
                line.to_string()
            }
        })
        .collect();
    fs::write(&segment, tampered.join("\n") + "\n").unwrap();

    let wal = WriteAheadLog::open(dir.path(), WalConfig::default()).unwrap();
    let mut seen = Vec::new();
    let replayed = wal
        .replay(|entry| {
            seen.push(entry.id);
            Ok(())
        })
        .unwrap();
    assert_eq!(replayed, 9);
    assert!(!seen.contains(&7));
    assert_eq!(wal.stats().unwrap().invalid_entries, 1);
}

#[test]
fn test_recovery_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(store_config(&dir.path().join("store"))).unwrap();
    store.insert(NewItem::new(vec![1.0, 0.0]).with_id("a")).unwrap();
    store.upsert(NewItem::new(vec![0.0, 1.0]).with_id("a")).unwrap();
    store.insert(NewItem::new(vec![1.0, 1.0]).with_id("b")).unwrap();
    store.delete("b").unwrap();
    let expected = store.list().unwrap();

    assert_eq!(store.recover_from_wal().unwrap(), 4);
    assert_eq!(store.list().unwrap(), expected);
    assert_eq!(store.recover_from_wal().unwrap(), 4);
    assert_eq!(store.list().unwrap(), expected);
}

#[derive(Clone, Debug)]
enum Op {
    Upsert(u8, f32),
    Delete(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..6, -100.0f32..100.0).prop_map(|(id, v)| Op::Upsert(id, v)),
        (0u8..6).prop_map(Op::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_reopened_store_matches_model(ops in prop::collection::vec(op_strategy(), 1..20)) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");
        let mut model: HashMap<String, Vec<f32>> = HashMap::new();
        {
            let store = Store::open(store_config(&path)).unwrap();
            store.update(|s| {
                for op in &ops {
                    match op {
                        Op::Upsert(id, v) => {
                            s.upsert(NewItem::new(vec![*v, 1.0]).with_id(format!("id-{}", id)))?;
                        }
                        Op::Delete(id) => {
                            s.delete(&format!("id-{}", id))?;
                        }
                    }
                }
                Ok(())
            }).unwrap();
        }
        for op in &ops {
            match op {
                Op::Upsert(id, v) => {
                    model.insert(format!("id-{}", id), vec![*v, 1.0]);
                }
                Op::Delete(id) => {
                    model.remove(&format!("id-{}", id));
                }
            }
        }

        let store = Store::open(store_config(&path)).unwrap();
        prop_assert_eq!(store.len(), model.len());
        for (id, vector) in &model {
            prop_assert_eq!(&store.get(id).unwrap().unwrap().vector, vector);
        }

        store.compact().unwrap();
        prop_assert_eq!(store.len(), model.len());
    }
}

#[test]
fn test_reader_never_sees_an_open_session() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    let writer = Store::open(store_config(&path)).unwrap();
    writer.insert(NewItem::new(vec![1.0, 0.0]).with_id("a")).unwrap();

    let session = writer.begin_update().unwrap();
    session.insert(NewItem::new(vec![0.0, 1.0]).with_id("staged")).unwrap();

    let reader = Store::open(store_config(&path)).unwrap();
    assert_eq!(reader.len(), 1);
    assert!(reader.get("staged").unwrap().is_none());

    session.cancel().unwrap();
    assert_eq!(reader.len(), 1);
    assert!(reader.get("staged").unwrap().is_none());
    assert_eq!(writer.len(), 1);

    let fresh = Store::open(store_config(&path)).unwrap();
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh.wal_stats().unwrap().unwrap().pending, 0);
}

fn log_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.file_name().unwrap().to_string_lossy().starts_with("operations.log"))
        .collect();
    files.sort();
    files
}

fn sealed_seq(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_string_lossy()
        .strip_prefix("operations.log.")?
        .parse()
        .ok()
}

#[test]
fn test_compaction_interrupted_before_log_clear() {
    let dir = TempDir::new().unwrap();
    let store = Store::open(StoreConfig {
        operations_log: OperationsLogConfig {
            max_bytes: 100,
            max_files: 10,
            compress: false,
        },
        ..store_config(&dir.path().join("store"))
    })
    .unwrap();

    store.insert(NewItem::new(vec![1.0, 0.0]).with_id("a")).unwrap();
    store.insert(NewItem::new(vec![1.0, 0.0]).with_id("b")).unwrap();
    store.delete("a").unwrap();
    store.upsert(NewItem::new(vec![9.0, 9.0]).with_id("b")).unwrap();
    store.insert(NewItem::new(vec![2.0, 2.0]).with_id("c")).unwrap();
    assert!(store.operations_log_stats().unwrap().sealed_segments >= 3);
    let expected = store.list().unwrap();

    let saved: Vec<(PathBuf, Vec<u8>)> = log_files(store.path())
        .into_iter()
        .map(|p| {
            let bytes = fs::read(&p).unwrap();
            (p, bytes)
        })
        .collect();
    store.compact().unwrap();

    // The primary file was replaced but the log was only partly cleared:
    // the oldest sealed segment is gone, the rest survived.
    for file in log_files(store.path()) {
        fs::remove_file(file).unwrap();
    }
    for (path, bytes) in &saved {
        fs::write(path, bytes).unwrap();
    }
    let oldest = saved.iter().filter_map(|(p, _)| sealed_seq(p)).min().unwrap();
    fs::remove_file(store.path().join(format!("operations.log.{}", oldest))).unwrap();

    store.compact().unwrap();
    assert_eq!(store.list().unwrap(), expected);
    assert!(store.get("a").unwrap().is_none());
    assert_eq!(store.get("b").unwrap().unwrap().vector, vec![9.0, 9.0]);
}

#[test]
fn test_commit_interrupted_before_checkpoint() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store");
    let checkpoint = path.join("wal").join("checkpoint.json");
    let expected = {
        let store = Store::open(store_config(&path)).unwrap();
        store.insert(NewItem::new(vec![1.0, 0.0]).with_id("x")).unwrap();
        let before = fs::read(&checkpoint).unwrap();

        store
            .update(|s| {
                s.upsert(NewItem::new(vec![0.0, 1.0]).with_id("x"))?;
                s.insert(NewItem::new(vec![1.0, 1.0]).with_id("y"))?;
                s.insert(NewItem::new(vec![2.0, 2.0]).with_id("z"))?;
                s.delete("z")?;
                Ok(())
            })
            .unwrap();

        // Primary file written, checkpoint not yet advanced.
        fs::write(&checkpoint, before).unwrap();
        store.list().unwrap()
    };

    let store = Store::open(store_config(&path)).unwrap();
    assert_eq!(store.list().unwrap(), expected);
    assert_eq!(store.wal_stats().unwrap().unwrap().pending, 0);

    store.compact().unwrap();
    assert_eq!(store.list().unwrap(), expected);
}
