//! Queue configuration, events and outcome handles.

use crate::error::{Result, StoreError};
use crate::retry::RetryPolicy;
use crossbeam_channel::{Receiver, TryRecvError};
use std::fmt;
use std::time::Duration;

/// Operation queue configuration.
#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    /// Handlers running at once. `1` serializes all operations.
    pub max_concurrency: usize,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles per attempt.
    pub retry_delay: Duration,
    /// Cap on a single retry delay.
    pub max_retry_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 1,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(5),
        }
    }
}

impl QueueConfig {
    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries.saturating_add(1),
            base_delay: self.retry_delay,
            max_delay: self.max_retry_delay,
        }
    }
}

/// Identifier assigned at enqueue time.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(pub u64);

impl fmt::Debug for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Op({})", self.0)
    }
}

/// Lifecycle notifications published to subscribers.
#[derive(Clone, Debug, PartialEq)]
pub enum QueueEvent {
    Enqueued {
        id: OperationId,
        op_type: String,
        priority: i32,
    },
    Started {
        id: OperationId,
        op_type: String,
        attempt: u32,
    },
    Retrying {
        id: OperationId,
        op_type: String,
        attempt: u32,
        delay: Duration,
    },
    Completed {
        id: OperationId,
        op_type: String,
    },
    Failed {
        id: OperationId,
        op_type: String,
        error: String,
    },
    Cancelled {
        id: OperationId,
        op_type: String,
    },
    /// Queued, delayed and in-flight sets all became empty.
    Drained,
}

/// Point-in-time queue counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub max_concurrency: usize,
}

/// The eventual outcome of an enqueued operation.
pub struct Pending<R> {
    pub(crate) id: OperationId,
    pub(crate) receiver: Receiver<Result<R>>,
}

impl<R> Pending<R> {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Block until the handler's final outcome is known.
    pub fn wait(self) -> Result<R> {
        self.receiver.recv().unwrap_or(Err(StoreError::QueueClosed))
    }

    /// The outcome, if already available.
    pub fn try_wait(&self) -> Option<Result<R>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(StoreError::QueueClosed)),
        }
    }
}
