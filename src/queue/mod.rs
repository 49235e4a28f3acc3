//! In-process operation queue.
//!
//! Every store mutation passes through an [`OperationQueue`], which is what
//! makes the atomic-file and write-lock primitives sufficient: no two logical
//! mutations touch store state at the same time unless the concurrency bound
//! is raised on purpose.
//!
//! # Example
//!
//! ```ignore
//! let queue: OperationQueue<String, usize> = OperationQueue::new(QueueConfig::default());
//! queue.register("measure", |s: &String| Ok(s.len()));
//!
//! let events = queue.subscribe(64);
//! let len = queue.enqueue("measure", "hello".to_string(), 0).wait()?;
//! queue.drain();
//! ```

mod manager;
mod types;

pub use manager::{Handler, OperationQueue};
pub use types::{OperationId, Pending, QueueConfig, QueueEvent, QueueStats};
