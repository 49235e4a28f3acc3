//! Update sessions and the queued mutation handlers behind them.
//!
//! A session holds the write lock for its lifetime. Every mutation is
//! enqueued on the store's operation queue; the handler stages it in the
//! session's private item map and records it in the WAL and the
//! operations log before acknowledging. Readers see nothing until commit.

use crate::error::{Result, StoreError};
use crate::fs::WriteLock;
use crate::index_file::IndexFile;
use crate::logs::{LogOperation, OperationsLog, OperationsLogEntry};
use crate::queue::OperationQueue;
use crate::store::{Committed, Loaded, Shared, Store};
use crate::types::{vector_norm, IndexSettings, ItemMap, MetadataStorage, NewItem, StoreItem, Timestamp};
use crate::wal::{WalOperation, WriteAheadLog};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

const INSERT: &str = "insert";
const UPSERT: &str = "upsert";
const DELETE: &str = "delete";
const COMMIT: &str = "commit";
const CANCEL: &str = "cancel";

/// Counts of what a commit changed, by id.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// False when the vector index could not be brought up to date.
    pub vector_index_synced: bool,
}

/// Work submitted to the operation queue.
#[derive(Clone, Debug)]
pub(crate) enum Mutation {
    Insert { token: u64, item: StoreItem },
    Upsert { token: u64, item: StoreItem },
    Delete { token: u64, id: String },
    Commit { token: u64 },
    Cancel { token: u64 },
}

impl Mutation {
    fn token(&self) -> u64 {
        match self {
            Mutation::Insert { token, .. }
            | Mutation::Upsert { token, .. }
            | Mutation::Delete { token, .. }
            | Mutation::Commit { token }
            | Mutation::Cancel { token } => *token,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Outcome {
    Stored(StoreItem),
    Deleted(bool),
    Committed(CommitSummary),
    Cancelled(usize),
}

impl Outcome {
    fn into_stored(self) -> Result<StoreItem> {
        match self {
            Outcome::Stored(item) => Ok(item),
            other => Err(unexpected(other)),
        }
    }

    fn into_deleted(self) -> Result<bool> {
        match self {
            Outcome::Deleted(existed) => Ok(existed),
            other => Err(unexpected(other)),
        }
    }

    fn into_committed(self) -> Result<CommitSummary> {
        match self {
            Outcome::Committed(summary) => Ok(summary),
            other => Err(unexpected(other)),
        }
    }

    fn into_cancelled(self) -> Result<usize> {
        match self {
            Outcome::Cancelled(count) => Ok(count),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(outcome: Outcome) -> StoreError {
    StoreError::InvalidFormat(format!("unexpected operation outcome: {:?}", outcome))
}

/// Staged state of the open session.
pub(crate) struct SessionState {
    token: u64,
    settings: IndexSettings,
    items: ItemMap,
    wal: Option<WriteAheadLog>,
    oplog: OperationsLog,
    /// First-touch state of every id changed in this session, in order.
    touched: Vec<(String, Option<StoreItem>)>,
    seen: HashSet<String>,
}

impl SessionState {
    pub(crate) fn new(token: u64, loaded: Loaded) -> Self {
        Self {
            token,
            settings: loaded.index.settings,
            items: ItemMap::from_items(loaded.index.items),
            wal: loaded.wal,
            oplog: loaded.oplog,
            touched: Vec::new(),
            seen: HashSet::new(),
        }
    }

    fn touch(&mut self, id: &str) {
        if self.seen.insert(id.to_string()) {
            self.touched.push((id.to_string(), self.items.get(id).cloned()));
        }
    }

    /// WAL first, then the operations log.
    fn record(&self, operation: LogOperation) -> Result<()> {
        if let Some(wal) = &self.wal {
            let kind = match &operation {
                LogOperation::Insert { .. } => WalOperation::Insert,
                LogOperation::Upsert { .. } => WalOperation::Upsert,
                LogOperation::Delete { .. } => WalOperation::Delete,
            };
            wal.write_entry(kind, serde_json::to_string(&operation)?)?;
        }
        self.oplog.append(&OperationsLogEntry {
            timestamp: Timestamp::now(),
            operation,
        })
    }

    fn stage(&mut self, shared: &Shared, mut item: StoreItem, replace: bool) -> Result<StoreItem> {
        if !replace && self.items.contains(&item.id) {
            return Err(StoreError::DuplicateId(item.id));
        }
        if let Some(expected) = self.settings.dimension {
            if item.vector.len() != expected {
                return Err(StoreError::DimensionMismatch {
                    expected,
                    got: item.vector.len(),
                });
            }
        }
        if self.settings.metadata_storage == MetadataStorage::External {
            shared.metadata.externalize(&mut item)?;
        }

        self.touch(&item.id);
        let operation = if replace {
            LogOperation::Upsert { item: item.clone() }
        } else {
            LogOperation::Insert { item: item.clone() }
        };
        self.record(operation)?;
        if self.settings.dimension.is_none() {
            self.settings.dimension = Some(item.vector.len());
        }
        self.items.put(item.clone());
        Ok(item)
    }

    fn delete(&mut self, id: &str) -> Result<bool> {
        if !self.items.contains(id) {
            return Ok(false);
        }
        self.touch(id);
        self.record(LogOperation::Delete { id: id.to_string() })?;
        self.items.remove(id);
        Ok(true)
    }

    fn commit(&mut self, shared: &Shared) -> Result<CommitSummary> {
        let index = IndexFile {
            settings: self.settings.clone(),
            items: self.items.as_slice().to_vec(),
        };
        index.save(shared.dir(), &shared.policy)?;
        shared.sync_checksums(&index)?;
        if let Some(wal) = &self.wal {
            wal.checkpoint()?;
        }

        *shared.committed.write() = Arc::new(Committed {
            settings: self.settings.clone(),
            items: self.items.clone(),
        });

        let mut summary = CommitSummary::default();
        for (id, before) in &self.touched {
            match (before, self.items.contains(id)) {
                (None, true) => summary.inserted += 1,
                (Some(_), true) => summary.updated += 1,
                (Some(_), false) => summary.deleted += 1,
                (None, false) => {}
            }
        }
        summary.vector_index_synced = shared.sync_vector_index(&self.touched, &self.items);
        info!(
            inserted = summary.inserted,
            updated = summary.updated,
            deleted = summary.deleted,
            "committed update session"
        );
        Ok(summary)
    }

    /// Log compensating entries restoring every touched id, newest first.
    fn cancel(&mut self) -> Result<usize> {
        let touched = std::mem::take(&mut self.touched);
        for (id, before) in touched.iter().rev() {
            let operation = match before {
                Some(item) => LogOperation::Upsert { item: item.clone() },
                None => LogOperation::Delete { id: id.clone() },
            };
            self.record(operation)?;
        }
        if let Some(wal) = &self.wal {
            wal.checkpoint()?;
        }
        info!(reverted = touched.len(), "cancelled update session");
        Ok(touched.len())
    }
}

fn active(state: &mut Option<SessionState>, token: u64) -> Result<&mut SessionState> {
    match state.as_mut() {
        Some(session) if session.token == token => Ok(session),
        _ => Err(StoreError::NoActiveUpdate),
    }
}

fn apply(shared: &Shared, mutation: &Mutation) -> Result<Outcome> {
    let mut guard = shared.session.lock();
    let state = active(&mut guard, mutation.token())?;
    match mutation {
        Mutation::Insert { item, .. } => state.stage(shared, item.clone(), false).map(Outcome::Stored),
        Mutation::Upsert { item, .. } => state.stage(shared, item.clone(), true).map(Outcome::Stored),
        Mutation::Delete { id, .. } => state.delete(id).map(Outcome::Deleted),
        Mutation::Commit { .. } => {
            let summary = state.commit(shared)?;
            *guard = None;
            Ok(Outcome::Committed(summary))
        }
        Mutation::Cancel { .. } => {
            let reverted = state.cancel()?;
            *guard = None;
            Ok(Outcome::Cancelled(reverted))
        }
    }
}

pub(crate) fn register_handlers(queue: &OperationQueue<Mutation, Outcome>, shared: &Arc<Shared>) {
    for op_type in [INSERT, UPSERT, DELETE, COMMIT, CANCEL] {
        let shared = Arc::clone(shared);
        queue.register(op_type, move |mutation: &Mutation| apply(&shared, mutation));
    }
}

/// An open update session. Holds the store's write lock until it ends.
///
/// Dropping a session without calling [`end`](Self::end) cancels it.
pub struct UpdateSession<'a> {
    store: &'a Store,
    token: u64,
    lock: WriteLock,
    done: bool,
}

impl<'a> UpdateSession<'a> {
    pub(crate) fn new(store: &'a Store, token: u64, lock: WriteLock) -> Self {
        Self {
            store,
            token,
            lock,
            done: false,
        }
    }

    /// Stage a new item. Fails with `DuplicateId` if the id exists.
    pub fn insert(&self, item: NewItem) -> Result<StoreItem> {
        let item = self.prepare(item)?;
        let stored = self
            .submit(INSERT, Mutation::Insert { token: self.token, item })?
            .into_stored()?;
        self.store.shared.metadata.materialize(&stored)
    }

    /// Stage an item, replacing any existing item with the same id.
    pub fn upsert(&self, item: NewItem) -> Result<StoreItem> {
        let item = self.prepare(item)?;
        let stored = self
            .submit(UPSERT, Mutation::Upsert { token: self.token, item })?
            .into_stored()?;
        self.store.shared.metadata.materialize(&stored)
    }

    /// Stage a delete. Returns whether the id existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        self.submit(
            DELETE,
            Mutation::Delete {
                token: self.token,
                id: id.to_string(),
            },
        )?
        .into_deleted()
    }

    /// An item as staged in this session.
    pub fn get(&self, id: &str) -> Result<Option<StoreItem>> {
        let item = self.read(|state| state.items.get(id).cloned())?;
        item.map(|item| self.store.shared.metadata.materialize(&item)).transpose()
    }

    /// All staged items in insertion order.
    pub fn list(&self) -> Result<Vec<StoreItem>> {
        let items = self.read(|state| state.items.as_slice().to_vec())?;
        items
            .iter()
            .map(|item| self.store.shared.metadata.materialize(item))
            .collect()
    }

    pub fn len(&self) -> Result<usize> {
        self.read(|state| state.items.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|n| n == 0)
    }

    /// Commit: persist the staged state, make it visible and release the lock.
    pub fn end(mut self) -> Result<CommitSummary> {
        let summary = self
            .submit(COMMIT, Mutation::Commit { token: self.token })?
            .into_committed()?;
        self.done = true;
        self.lock.release()?;
        Ok(summary)
    }

    /// Discard staged changes and release the lock. Returns the number of
    /// ids restored.
    pub fn cancel(mut self) -> Result<usize> {
        self.done = true;
        let result = self
            .submit(CANCEL, Mutation::Cancel { token: self.token })
            .and_then(Outcome::into_cancelled);
        if result.is_err() {
            self.discard();
        }
        self.lock.release()?;
        result
    }

    fn prepare(&self, item: NewItem) -> Result<StoreItem> {
        let settings = self.read(|state| state.settings.clone())?;
        self.store.shared.validator.validate(&item, &settings)?;
        Ok(StoreItem {
            id: item.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            norm: vector_norm(&item.vector),
            vector: item.vector,
            metadata: item.metadata,
            metadata_file: None,
        })
    }

    fn submit(&self, op_type: &str, mutation: Mutation) -> Result<Outcome> {
        self.keep_alive();
        self.store.queue.enqueue(op_type, mutation, 0).wait()
    }

    /// Renew the lease once a third of its stale window has passed.
    fn keep_alive(&self) {
        let stale_after = self.store.shared.config.lock.stale_after;
        if self.lock.lease().renewed_at.elapsed() * 3 < stale_after {
            return;
        }
        if let Err(e) = self.lock.renew() {
            warn!(error = %e, "failed to renew write lock");
        }
    }

    fn read<T>(&self, f: impl FnOnce(&SessionState) -> T) -> Result<T> {
        let mut guard = self.store.shared.session.lock();
        active(&mut guard, self.token).map(|state| f(state))
    }

    /// Drop the staged state without logging compensation.
    fn discard(&self) {
        let mut guard = self.store.shared.session.lock();
        if guard.as_ref().map_or(false, |s| s.token == self.token) {
            *guard = None;
            warn!(token = self.token, "discarded update session state");
        }
    }
}

impl Drop for UpdateSession<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        debug!(token = self.token, "update session dropped without end, cancelling");
        let result = self
            .submit(CANCEL, Mutation::Cancel { token: self.token })
            .and_then(Outcome::into_cancelled);
        if let Err(e) = result {
            warn!(error = %e, "failed to cancel dropped update session");
            self.discard();
        }
    }
}
