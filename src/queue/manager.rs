//! Priority operation queue with bounded concurrency and retry.

use crate::error::{Result, StoreError};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{OperationId, Pending, QueueConfig, QueueEvent, QueueStats};

/// A handler for one operation type. Invoked once per attempt.
pub type Handler<P, R> = Arc<dyn Fn(&P) -> Result<R> + Send + Sync>;

/// A queued operation.
struct Job<P, R> {
    id: OperationId,
    seq: u64,
    op_type: String,
    priority: i32,
    payload: P,
    attempt: u32,
    /// Retried jobs jump ahead of everything that has not started yet.
    retried: bool,
    reply: Sender<Result<R>>,
}

impl<P, R> Job<P, R> {
    fn key(&self) -> (bool, i32, Reverse<u64>) {
        (self.retried, self.priority, Reverse(self.seq))
    }
}

impl<P, R> PartialEq for Job<P, R> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<P, R> Eq for Job<P, R> {}

impl<P, R> PartialOrd for Job<P, R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P, R> Ord for Job<P, R> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

struct State<P, R> {
    ready: BinaryHeap<Job<P, R>>,
    /// Jobs waiting out a retry delay.
    delayed: HashMap<OperationId, Job<P, R>>,
    in_flight: usize,
    max_concurrency: usize,
    next_id: u64,
    next_seq: u64,
    completed: u64,
    failed: u64,
    closed: bool,
}

impl<P, R> State<P, R> {
    fn is_idle(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty() && self.in_flight == 0
    }
}

struct Inner<P, R> {
    state: Mutex<State<P, R>>,
    idle: Condvar,
    handlers: RwLock<HashMap<String, Handler<P, R>>>,
    subscribers: Mutex<Vec<Sender<QueueEvent>>>,
    config: QueueConfig,
}

/// Serializes operations: ready work runs by priority (highest first), then
/// enqueue order, with at most `max_concurrency` handlers in flight.
pub struct OperationQueue<P, R> {
    inner: Arc<Inner<P, R>>,
}

impl<P, R> OperationQueue<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    ready: BinaryHeap::new(),
                    delayed: HashMap::new(),
                    in_flight: 0,
                    max_concurrency: config.max_concurrency.max(1),
                    next_id: 1,
                    next_seq: 0,
                    completed: 0,
                    failed: 0,
                    closed: false,
                }),
                idle: Condvar::new(),
                handlers: RwLock::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    /// Register (or replace) the handler for an operation type.
    pub fn register<F>(&self, op_type: impl Into<String>, handler: F)
    where
        F: Fn(&P) -> Result<R> + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .insert(op_type.into(), Arc::new(handler));
    }

    /// Queue an operation and return a handle to its eventual outcome.
    pub fn enqueue(&self, op_type: impl Into<String>, payload: P, priority: i32) -> Pending<R> {
        let op_type = op_type.into();
        let (reply, receiver) = bounded(1);

        let id = {
            let mut state = self.inner.state.lock();
            let id = OperationId(state.next_id);
            state.next_id += 1;

            if state.closed {
                let _ = reply.send(Err(StoreError::QueueClosed));
                return Pending { id, receiver };
            }
            if !self.inner.handlers.read().contains_key(&op_type) {
                let _ = reply.send(Err(StoreError::NoHandler(op_type)));
                return Pending { id, receiver };
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            state.ready.push(Job {
                id,
                seq,
                op_type: op_type.clone(),
                priority,
                payload,
                attempt: 1,
                retried: false,
                reply,
            });
            id
        };

        self.inner.publish(QueueEvent::Enqueued {
            id,
            op_type,
            priority,
        });
        Inner::pump(&self.inner);
        Pending { id, receiver }
    }

    /// Block until nothing is queued, delayed or in flight.
    ///
    /// A paused queue with pending work does not drain until resumed.
    pub fn drain(&self) {
        let mut state = self.inner.state.lock();
        while !state.is_idle() {
            self.inner.idle.wait(&mut state);
        }
    }

    /// Fail every operation that has not started with `Cancelled`.
    /// Returns the number of operations cancelled.
    pub fn clear(&self) -> usize {
        let cancelled: Vec<Job<P, R>> = {
            let mut state = self.inner.state.lock();
            let mut jobs: Vec<_> = state.ready.drain().collect();
            jobs.extend(state.delayed.drain().map(|(_, job)| job));
            if state.is_idle() {
                self.inner.idle.notify_all();
            }
            jobs
        };

        let count = cancelled.len();
        for job in cancelled {
            let _ = job.reply.send(Err(StoreError::Cancelled));
            self.inner.publish(QueueEvent::Cancelled {
                id: job.id,
                op_type: job.op_type,
            });
        }
        if count > 0 {
            debug!(count, "cleared pending operations");
        }
        count
    }

    /// Stop starting new operations. In-flight work finishes; queued work stays.
    pub fn pause(&self) {
        self.inner.state.lock().max_concurrency = 0;
    }

    /// Resume with the given concurrency bound (at least one).
    pub fn resume(&self, max_concurrency: usize) {
        self.inner.state.lock().max_concurrency = max_concurrency.max(1);
        Inner::pump(&self.inner);
    }

    /// Reject new work and cancel everything not yet started.
    pub fn close(&self) {
        self.inner.state.lock().closed = true;
        self.clear();
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            queued: state.ready.len(),
            delayed: state.delayed.len(),
            in_flight: state.in_flight,
            completed: state.completed,
            failed: state.failed,
            max_concurrency: state.max_concurrency,
        }
    }

    /// Receive lifecycle events. Subscribers that fall `buffer` events
    /// behind are dropped rather than slowing the queue.
    pub fn subscribe(&self, buffer: usize) -> Receiver<QueueEvent> {
        let (sender, receiver) = bounded(buffer.max(1));
        self.inner.subscribers.lock().push(sender);
        receiver
    }
}

impl<P, R> Drop for OperationQueue<P, R> {
    fn drop(&mut self) {
        let pending: Vec<Job<P, R>> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            let mut jobs: Vec<_> = state.ready.drain().collect();
            jobs.extend(state.delayed.drain().map(|(_, job)| job));
            jobs
        };
        for job in pending {
            let _ = job.reply.send(Err(StoreError::Cancelled));
        }
    }
}

impl<P, R> Inner<P, R>
where
    P: Send + 'static,
    R: Send + 'static,
{
    /// Start ready jobs while concurrency allows.
    fn pump(inner: &Arc<Self>) {
        loop {
            let job = {
                let mut state = inner.state.lock();
                if state.in_flight >= state.max_concurrency {
                    return;
                }
                match state.ready.pop() {
                    Some(job) => {
                        state.in_flight += 1;
                        job
                    }
                    None => return,
                }
            };

            let worker = Arc::clone(inner);
            let spawned = thread::Builder::new()
                .name("vecvault-queue".into())
                .spawn(move || Inner::run(worker, job));
            if let Err(e) = spawned {
                // The job was moved into the closure and is gone with it.
                warn!(error = %e, "failed to spawn queue worker");
                let mut state = inner.state.lock();
                state.in_flight -= 1;
                state.failed += 1;
                if state.is_idle() {
                    inner.idle.notify_all();
                }
                return;
            }
        }
    }

    fn run(inner: Arc<Self>, mut job: Job<P, R>) {
        inner.publish(QueueEvent::Started {
            id: job.id,
            op_type: job.op_type.clone(),
            attempt: job.attempt,
        });

        let handler = inner.handlers.read().get(&job.op_type).cloned();
        let result = match handler {
            Some(handler) => handler(&job.payload),
            None => Err(StoreError::NoHandler(job.op_type.clone())),
        };

        let policy = inner.config.retry_policy();
        match result {
            Ok(value) => {
                inner.publish(QueueEvent::Completed {
                    id: job.id,
                    op_type: job.op_type,
                });
                // Counters settle before the waiter wakes.
                inner.finish(|state| state.completed += 1);
                let _ = job.reply.send(Ok(value));
            }
            Err(e) if e.is_transient() && job.attempt < policy.max_attempts => {
                let delay = policy.delay_for(job.attempt);
                debug!(id = ?job.id, op_type = %job.op_type, attempt = job.attempt, ?delay, error = %e, "operation failed, retrying");
                inner.publish(QueueEvent::Retrying {
                    id: job.id,
                    op_type: job.op_type.clone(),
                    attempt: job.attempt,
                    delay,
                });
                job.attempt += 1;
                job.retried = true;
                let id = job.id;
                {
                    let mut state = inner.state.lock();
                    state.in_flight -= 1;
                    state.delayed.insert(id, job);
                }
                Inner::schedule_retry(&inner, id, delay);
            }
            Err(e) => {
                warn!(id = ?job.id, op_type = %job.op_type, attempts = job.attempt, error = %e, "operation failed");
                inner.publish(QueueEvent::Failed {
                    id: job.id,
                    op_type: job.op_type.clone(),
                    error: e.to_string(),
                });
                inner.finish(|state| state.failed += 1);
                let _ = job.reply.send(Err(e));
            }
        }

        Inner::pump(&inner);
    }

    /// Move a delayed job back to the ready set once its backoff expires.
    fn schedule_retry(inner: &Arc<Self>, id: OperationId, delay: Duration) {
        let timer = Arc::clone(inner);
        let spawned = thread::Builder::new()
            .name("vecvault-retry".into())
            .spawn(move || {
                thread::sleep(delay);
                let requeued = {
                    let mut state = timer.state.lock();
                    match state.delayed.remove(&id) {
                        Some(job) => {
                            state.ready.push(job);
                            true
                        }
                        None => false,
                    }
                };
                if requeued {
                    Inner::pump(&timer);
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn retry timer, requeueing immediately");
            let mut state = inner.state.lock();
            if let Some(job) = state.delayed.remove(&id) {
                state.ready.push(job);
            }
        }
    }

    fn finish(&self, update: impl FnOnce(&mut State<P, R>)) {
        let drained = {
            let mut state = self.state.lock();
            state.in_flight -= 1;
            update(&mut state);
            let idle = state.is_idle();
            if idle {
                self.idle.notify_all();
            }
            idle
        };
        if drained {
            self.publish(QueueEvent::Drained);
        }
    }

    /// Deliver an event to every subscriber, dropping those that are full
    /// or disconnected.
    fn publish(&self, event: QueueEvent) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|sender| sender.try_send(event.clone()).is_ok());
    }
}
