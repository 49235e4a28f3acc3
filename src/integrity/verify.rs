//! Integrity verification and the human-readable report.

use super::checksum::{calculate_file_checksum, read_manifest};
use crate::error::{Result, StoreError};
use crate::index_file::{IndexFile, INDEX_FILE};
use crate::logs::scan_log;
use crate::metadata::find_orphans;
use crate::types::FORMAT_VERSION;
use crate::wal::scan_wal;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::path::Path;

/// What to check.
#[derive(Clone, Copy, Debug)]
pub struct VerifyOptions {
    /// Primary file shape, item invariants and log readability.
    pub validate_structure: bool,
    /// External metadata references and orphans.
    pub validate_references: bool,
    /// Artifact content against `checksums.json`.
    pub validate_checksums: bool,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        Self {
            validate_structure: true,
            validate_references: true,
            validate_checksums: true,
        }
    }
}

/// Checksum state of one artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactState {
    Ok,
    Mismatch,
    Missing,
    /// Present but not listed in the manifest.
    Untracked,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactCheck {
    pub checksum: Option<String>,
    pub state: ArtifactState,
}

/// Outcome of [`verify_index_integrity`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    /// No hard errors were found.
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Per artifact, keyed by file name relative to the store directory.
    pub artifacts: BTreeMap<String, ArtifactCheck>,
}

impl IntegrityReport {
    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Current checksums of every artifact that exists.
    pub fn checksums(&self) -> BTreeMap<&str, &str> {
        self.artifacts
            .iter()
            .filter_map(|(name, check)| Some((name.as_str(), check.checksum.as_deref()?)))
            .collect()
    }
}

/// Verify the store in `dir`.
///
/// Hard errors make the report invalid: a missing or unparseable primary
/// file, broken item invariants, unsafe metadata references and checksum
/// mismatches. Everything else is a warning.
pub fn verify_index_integrity(dir: &Path, options: VerifyOptions) -> Result<IntegrityReport> {
    let mut report = IntegrityReport::default();

    let index = match IndexFile::load(dir) {
        Ok(Some(index)) => Some(index),
        Ok(None) => {
            report.error(format!("{} is missing", INDEX_FILE));
            None
        }
        Err(StoreError::Corruption(message)) => {
            report.error(format!("{} is unreadable: {}", INDEX_FILE, message));
            None
        }
        Err(e) => return Err(e),
    };

    if let Some(index) = &index {
        if options.validate_structure {
            check_structure(index, &mut report);
            check_logs(dir, &mut report)?;
        }
        if options.validate_references {
            check_references(dir, index, &mut report)?;
        }
    }
    if options.validate_checksums {
        check_checksums(dir, index.as_ref(), &mut report)?;
    }

    report.valid = report.errors.is_empty();
    Ok(report)
}

/// Run every check and render the result as text.
pub fn generate_integrity_report(dir: &Path) -> Result<String> {
    let report = verify_index_integrity(dir, VerifyOptions::default())?;
    let mut out = String::new();

    let _ = writeln!(out, "Integrity report for {}", dir.display());
    let _ = writeln!(out, "Status: {}", if report.valid { "VALID" } else { "INVALID" });
    let _ = writeln!(out);
    let _ = writeln!(out, "Artifacts:");
    if report.artifacts.is_empty() {
        let _ = writeln!(out, "  (none)");
    }
    for (name, check) in &report.artifacts {
        let status = match check.state {
            ArtifactState::Ok => "ok",
            ArtifactState::Mismatch => "CHECKSUM MISMATCH",
            ArtifactState::Missing => "MISSING",
            ArtifactState::Untracked => "untracked",
        };
        let checksum = check.checksum.as_deref().map_or("-", |c| &c[..16.min(c.len())]);
        let _ = writeln!(out, "  {:<48} {:<16} {}", name, checksum, status);
    }
    for (title, lines) in [("Errors", &report.errors), ("Warnings", &report.warnings)] {
        let _ = writeln!(out);
        let _ = writeln!(out, "{} ({}):", title, lines.len());
        for line in lines {
            let _ = writeln!(out, "  - {}", line);
        }
    }
    Ok(out)
}

fn check_structure(index: &IndexFile, report: &mut IntegrityReport) {
    if index.settings.version > FORMAT_VERSION {
        report.error(format!(
            "unsupported format version {} (newest known is {})",
            index.settings.version, FORMAT_VERSION
        ));
    }

    let mut seen = HashSet::new();
    let mut dimension = index.settings.dimension;
    for (pos, item) in index.items.iter().enumerate() {
        if item.id.is_empty() {
            report.error(format!("item at position {} has an empty id", pos));
        } else if !seen.insert(item.id.as_str()) {
            report.error(format!("duplicate item id {}", item.id));
        }

        match dimension {
            Some(expected) if item.vector.len() != expected => report.error(format!(
                "item {} has dimension {}, expected {}",
                item.id,
                item.vector.len(),
                expected
            )),
            Some(_) => {}
            None => dimension = Some(item.vector.len()),
        }

        let norm = crate::types::vector_norm(&item.vector);
        if (norm - item.norm).abs() > 1e-3 * norm.max(1.0) {
            report.warn(format!("item {} has a stale norm ({} vs {})", item.id, item.norm, norm));
        }
        if item.metadata_file.is_some() && !item.metadata.is_empty() {
            report.error(format!("item {} has both inline and external metadata", item.id));
        }
    }
}

fn check_logs(dir: &Path, report: &mut IntegrityReport) -> Result<()> {
    let (_, malformed) = scan_log(dir)?;
    if malformed > 0 {
        report.warn(format!("operations log has {} malformed line(s)", malformed));
    }
    let (_, invalid) = scan_wal(dir, true)?;
    if invalid > 0 {
        report.warn(format!("write-ahead log has {} invalid entr(ies) that will not be replayed", invalid));
    }
    Ok(())
}

fn check_references(dir: &Path, index: &IndexFile, report: &mut IntegrityReport) -> Result<()> {
    for item in &index.items {
        let Some(name) = &item.metadata_file else {
            continue;
        };
        if name.contains(['/', '\\']) || name.starts_with('.') {
            report.error(format!("item {} references metadata outside the store: {}", item.id, name));
        } else if !dir.join(name).is_file() {
            report.warn(format!("item {} references missing metadata file {}", item.id, name));
        }
    }
    let orphans = find_orphans(dir, &index.items)?;
    if !orphans.is_empty() {
        report.warn(format!("{} orphaned metadata file(s)", orphans.len()));
    }
    Ok(())
}

fn check_checksums(dir: &Path, index: Option<&IndexFile>, report: &mut IntegrityReport) -> Result<()> {
    let mut current: Vec<String> = Vec::new();
    if dir.join(INDEX_FILE).is_file() {
        current.push(INDEX_FILE.to_string());
    }
    if let Some(index) = index {
        current.extend(
            index
                .items
                .iter()
                .filter_map(|item| item.metadata_file.clone())
                .filter(|name| !name.contains(['/', '\\']) && dir.join(name).is_file()),
        );
    }

    let manifest = match read_manifest(dir) {
        Ok(manifest) => manifest,
        Err(e) => {
            report.warn(format!("checksum manifest is unreadable: {}", e));
            None
        }
    };
    let expected = manifest.map(|m| m.files).unwrap_or_default();
    if expected.is_empty() {
        report.warn("no checksum manifest; checksums not verified");
    }

    for name in current {
        let checksum = calculate_file_checksum(&dir.join(&name))?;
        let state = match expected.get(&name) {
            Some(stored) if *stored == checksum => ArtifactState::Ok,
            Some(stored) => {
                report.error(format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    name, stored, checksum
                ));
                ArtifactState::Mismatch
            }
            None => ArtifactState::Untracked,
        };
        report.artifacts.insert(
            name,
            ArtifactCheck {
                checksum: Some(checksum),
                state,
            },
        );
    }
    for name in expected.keys() {
        if !report.artifacts.contains_key(name) && !dir.join(name).is_file() {
            report.warn(format!("{} is listed in the checksum manifest but missing", name));
            report.artifacts.insert(
                name.clone(),
                ArtifactCheck {
                    checksum: None,
                    state: ArtifactState::Missing,
                },
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::checksum::update_checksums;
    use crate::retry::RetryPolicy;
    use crate::types::{vector_norm, IndexSettings, Metadata, StoreItem};
    use std::fs;
    use tempfile::TempDir;

    fn item(id: &str, vector: Vec<f32>) -> StoreItem {
        StoreItem {
            id: id.into(),
            norm: vector_norm(&vector),
            vector,
            metadata: Metadata::new(),
            metadata_file: None,
        }
    }

    fn write_index(dir: &Path, items: Vec<StoreItem>) {
        let mut index = IndexFile::new(IndexSettings::with_dimension(3));
        index.items = items;
        index.save(dir, &RetryPolicy::default()).unwrap();
    }

    #[test]
    fn test_clean_store_is_valid() {
        let dir = TempDir::new().unwrap();
        write_index(dir.path(), vec![item("a", vec![1.0, 0.0, 0.0])]);
        update_checksums(dir.path(), [INDEX_FILE]).unwrap();

        let report = verify_index_integrity(dir.path(), VerifyOptions::default()).unwrap();
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert_eq!(report.artifacts[INDEX_FILE].state, ArtifactState::Ok);
        assert_eq!(report.checksums().len(), 1);
    }

    #[test]
    fn test_structure_errors() {
        let dir = TempDir::new().unwrap();
        write_index(
            dir.path(),
            vec![
                item("a", vec![1.0, 0.0, 0.0]),
                item("a", vec![0.0, 1.0, 0.0]),
                item("b", vec![1.0, 0.0]),
            ],
        );

        let report = verify_index_integrity(dir.path(), VerifyOptions::default()).unwrap();
        assert!(!report.valid);
        assert!(report.errors.iter().any(|e| e.contains("duplicate item id a")));
        assert!(report.errors.iter().any(|e| e.contains("dimension 2")));
    }

    #[test]
    fn test_checksum_mismatch_is_an_error() {
        let dir = TempDir::new().unwrap();
        write_index(dir.path(), vec![item("a", vec![1.0, 0.0, 0.0])]);
        update_checksums(dir.path(), [INDEX_FILE]).unwrap();
        write_index(dir.path(), vec![item("b", vec![1.0, 0.0, 0.0])]);

        let report = verify_index_integrity(dir.path(), VerifyOptions::default()).unwrap();
        assert!(!report.valid);
        assert_eq!(report.artifacts[INDEX_FILE].state, ArtifactState::Mismatch);

        let skip = VerifyOptions {
            validate_checksums: false,
            ..Default::default()
        };
        assert!(verify_index_integrity(dir.path(), skip).unwrap().valid);
    }

    #[test]
    fn test_missing_metadata_file_is_a_warning() {
        let dir = TempDir::new().unwrap();
        let mut it = item("a", vec![1.0, 0.0, 0.0]);
        it.metadata_file = Some("a.0123456789abcdef.meta.json".into());
        write_index(dir.path(), vec![it]);
        fs::write(dir.path().join("stray.0000000000000000.meta.json"), b"{}").unwrap();

        let report = verify_index_integrity(dir.path(), VerifyOptions::default()).unwrap();
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.warnings.iter().any(|w| w.contains("missing metadata file")));
        assert!(report.warnings.iter().any(|w| w.contains("1 orphaned")));
    }

    #[test]
    fn test_unreadable_primary_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(INDEX_FILE), b"not json").unwrap();

        let report = verify_index_integrity(dir.path(), VerifyOptions::default()).unwrap();
        assert!(!report.valid);
        let text = generate_integrity_report(dir.path()).unwrap();
        assert!(text.contains("Status: INVALID"));
        assert!(text.contains("unreadable"));
    }
}
