//! Checksums, verification and repair of store directories.

pub mod checksum;
mod repair;
mod verify;

pub use checksum::{
    calculate_file_checksum, calculate_object_checksum, remove_manifest, update_checksums, ChecksumManifest,
    CHECKSUM_FILE,
};
pub use repair::{repair_index, RepairAction, RepairMode, RepairOptions, RepairReport};
pub use verify::{
    generate_integrity_report, verify_index_integrity, ArtifactCheck, ArtifactState, IntegrityReport,
    VerifyOptions,
};
