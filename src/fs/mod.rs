//! Filesystem primitives: atomic replacement and the cross-process write lock.

pub mod atomic;
pub mod lock;

pub use lock::{
    acquire_write_lock, is_write_locked, try_acquire_write_lock, FileLeaseBackend, Lease,
    LeaseBackend, LockOptions, LockState, WriteLock,
};
