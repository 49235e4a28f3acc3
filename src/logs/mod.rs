//! On-disk logs: the operations log and the shared segment helpers used by
//! both it and the write-ahead log.

mod operations;
pub mod segments;

pub use operations::{
    apply_entries, collapse, log_stats, scan_log, LogCompaction, LogOperation, LogStats, MergeSummary, OperationsLog,
    OperationsLogConfig, OperationsLogEntry, OPERATIONS_LOG,
};
