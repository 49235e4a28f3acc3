//! Segment naming, listing, rotation helpers and line framing shared by the
//! operations log and the write-ahead log.

use crate::error::Result;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Extension appended to compressed sealed segments.
pub const COMPRESSED_EXT: &str = ".zst";

/// Compression level for sealed segments.
const ZSTD_LEVEL: i32 = 3;

/// A sealed or active segment on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub seq: u64,
    pub path: PathBuf,
    pub compressed: bool,
    pub size: u64,
}

/// How segment file names are built: `{prefix}{seq}{suffix}[.zst]`.
#[derive(Clone, Copy, Debug)]
pub struct SegmentNaming {
    pub prefix: &'static str,
    pub suffix: &'static str,
}

impl SegmentNaming {
    pub fn name(&self, seq: u64, compressed: bool) -> String {
        format!(
            "{}{}{}{}",
            self.prefix,
            seq,
            self.suffix,
            if compressed { COMPRESSED_EXT } else { "" }
        )
    }

    /// Parse a file name into `(seq, compressed)`.
    pub fn parse(&self, name: &str) -> Option<(u64, bool)> {
        let rest = name.strip_prefix(self.prefix)?;
        let (rest, compressed) = match rest.strip_suffix(COMPRESSED_EXT) {
            Some(r) => (r, true),
            None => (rest, false),
        };
        let digits = rest.strip_suffix(self.suffix)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(|seq| (seq, compressed))
    }

    /// All matching segments in `dir`, ascending by sequence number.
    pub fn list(&self, dir: &Path) -> Result<Vec<Segment>> {
        let mut segments = Vec::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(segments),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some((seq, compressed)) = self.parse(&name.to_string_lossy()) {
                segments.push(Segment {
                    seq,
                    path: entry.path(),
                    compressed,
                    size: entry.metadata()?.len(),
                });
            }
        }
        segments.sort_by_key(|s| s.seq);
        Ok(segments)
    }
}

/// Read a segment, decompressing if needed.
pub fn read_segment(path: &Path) -> Result<Vec<u8>> {
    let bytes = fs::read(path)?;
    if path.to_string_lossy().ends_with(COMPRESSED_EXT) {
        Ok(zstd::decode_all(io::Cursor::new(bytes))?)
    } else {
        Ok(bytes)
    }
}

/// Compress a sealed segment in place, returning the new path.
pub fn compress_segment(path: &Path, policy: &crate::retry::RetryPolicy) -> Result<PathBuf> {
    let bytes = fs::read(path)?;
    let compressed = zstd::encode_all(io::Cursor::new(bytes), ZSTD_LEVEL)?;
    let target = PathBuf::from(format!("{}{}", path.display(), COMPRESSED_EXT));
    crate::fs::atomic::write(&target, &compressed, policy)?;
    fs::remove_file(path)?;
    Ok(target)
}

/// Delete the oldest sealed segments until at most `max_files` remain.
/// Segments for which `deletable` is false are kept and still count.
pub fn enforce_retention<F>(sealed: &[Segment], max_files: usize, deletable: F) -> Result<Vec<PathBuf>>
where
    F: Fn(&Segment) -> bool,
{
    let mut removed = Vec::new();
    let mut excess = sealed.len().saturating_sub(max_files);
    for segment in sealed {
        if excess == 0 {
            break;
        }
        if !deletable(segment) {
            continue;
        }
        fs::remove_file(&segment.path)?;
        removed.push(segment.path.clone());
        excess -= 1;
    }
    Ok(removed)
}

/// Truncate a trailing partial line left by an interrupted append.
/// Returns the number of bytes dropped.
pub fn trim_torn_tail(path: &Path) -> Result<u64> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(0);
    }

    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    if last[0] == b'\n' {
        return Ok(0);
    }

    let mut content = Vec::with_capacity(len as usize);
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut content)?;
    let keep = content
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos as u64 + 1);
    file.set_len(keep)?;
    file.sync_all()?;

    let dropped = len - keep;
    warn!(path = %path.display(), dropped, "truncated torn log tail");
    Ok(dropped)
}

/// Parse newline-delimited JSON, skipping lines that do not parse.
/// Returns the parsed values and the number of skipped lines.
pub fn parse_lines<T: DeserializeOwned>(bytes: &[u8], source: &Path) -> (Vec<T>, usize) {
    let mut values = Vec::new();
    let mut skipped = 0;
    for (line_no, line) in bytes.split(|&b| b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice(line) {
            Ok(value) => values.push(value),
            Err(e) => {
                skipped += 1;
                warn!(path = %source.display(), line = line_no + 1, error = %e, "skipping malformed log line");
            }
        }
    }
    (values, skipped)
}
