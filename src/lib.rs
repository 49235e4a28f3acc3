//! # Vecvault
//!
//! A crash-safe embedded store for vectors with attached metadata, kept in
//! a single directory.
//!
//! ## Core Concepts
//!
//! - **Primary file**: `index.json`, the last committed state, always
//!   replaced atomically
//! - **Update sessions**: exclusive, lock-protected batches of mutations
//!   that become visible on commit
//! - **Write-ahead log**: checksummed entries written before each mutation
//!   is acknowledged, replayed after a crash
//! - **Operations log**: an append-only record of mutations, folded into
//!   the primary file by compaction
//! - **Integrity**: checksums, verification and best-effort repair
//!
//! ## Example
//!
//! ```ignore
//! use vecvault::{IndexSettings, NewItem, Store, StoreConfig};
//!
//! let store = Store::open(StoreConfig {
//!     path: "./my-store".into(),
//!     settings: IndexSettings::with_dimension(3),
//!     ..Default::default()
//! })?;
//!
//! store.update(|session| {
//!     session.insert(NewItem::new(vec![0.1, 0.2, 0.3]).with_metadata("title", "first"))?;
//!     session.delete("stale-item")?;
//!     Ok(())
//! })?;
//!
//! let report = store.compact()?;
//! ```

pub mod collab;
pub mod error;
pub mod fs;
pub mod index_file;
pub mod integrity;
pub mod logs;
pub mod metadata;
pub mod queue;
pub mod retry;
pub mod session;
pub mod store;
pub mod types;
pub mod wal;

// Re-exports
pub use collab::{DefaultSanitizer, ItemValidator, PathSanitizer, ShapeValidator, VectorIndex};
pub use error::{Result, StoreError};
pub use fs::{LockOptions, WriteLock};
pub use integrity::{IntegrityReport, RepairMode, RepairOptions, RepairReport, VerifyOptions};
pub use logs::{LogStats, OperationsLogConfig};
pub use queue::{QueueConfig, QueueEvent, QueueStats};
pub use retry::RetryPolicy;
pub use session::{CommitSummary, UpdateSession};
pub use store::{Collaborators, CompactionReport, SnapshotInfo, Store, StoreConfig, StoreStats};
pub use types::{
    DistanceMetric, IndexSettings, Metadata, MetadataStorage, MetadataValue, NewItem, StoreItem, Timestamp,
};
pub use wal::{WalConfig, WalStats};
