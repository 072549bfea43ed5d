//! Segment file naming and directory scanning.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// Extension carried by every segment file.
pub const SEGMENT_FILE_EXTENSION: &str = "dque";

/// File name for the segment with the given number, zero-padded so that
/// lexicographic and numeric order agree.
pub(crate) fn segment_file_name(number: u64) -> String {
    format!("{number:013}.{SEGMENT_FILE_EXTENSION}")
}

/// Full path of the segment file with the given number inside `dir`.
pub(crate) fn segment_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(segment_file_name(number))
}

/// Parse a directory entry name of the shape `<digits>.dque`.
///
/// Anything else (other extensions, non-numeric stems, the lock sentinel)
/// yields `None`.
pub(crate) fn parse_segment_number(path: &Path) -> Option<u64> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(SEGMENT_FILE_EXTENSION) {
        return None;
    }
    let stem = path.file_stem().and_then(|stem| stem.to_str())?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

/// Scan `dir` for segment files and return the smallest and largest segment
/// numbers found, or `None` when the directory holds no segments.
///
/// Non-matching entries and subdirectories are ignored.
pub(crate) fn scan_segment_range(dir: &Path) -> io::Result<Option<(u64, u64)>> {
    let mut range: Option<(u64, u64)> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(number) = parse_segment_number(&entry.path()) {
            range = Some(match range {
                Some((min, max)) => (min.min(number), max.max(number)),
                None => (number, number),
            });
        }
    }
    Ok(range)
}

/// Sync a directory so a rename inside it survives power loss.
pub(crate) fn fsync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_names_are_zero_padded() {
        assert_eq!(segment_file_name(1), "0000000000001.dque");
        assert_eq!(segment_file_name(13), "0000000000013.dque");
        assert_eq!(segment_file_name(9999999999999), "9999999999999.dque");
    }

    #[test]
    fn parse_accepts_numeric_stems_only() {
        assert_eq!(parse_segment_number(Path::new("0000000000042.dque")), Some(42));
        assert_eq!(parse_segment_number(Path::new("7.dque")), Some(7));
        assert_eq!(parse_segment_number(Path::new("0000000000000.dque")), Some(0));
        assert_eq!(parse_segment_number(Path::new("queue.lock")), None);
        assert_eq!(parse_segment_number(Path::new("12x.dque")), None);
        assert_eq!(parse_segment_number(Path::new("12.txt")), None);
        assert_eq!(parse_segment_number(Path::new(".dque")), None);
        assert_eq!(parse_segment_number(Path::new("-3.dque")), None);
    }

    #[test]
    fn scan_finds_min_and_max_and_ignores_noise() {
        let dir = TempDir::new().expect("tempdir");
        for name in ["0000000000003.dque", "0000000000011.dque", "0000000000007.dque"] {
            std::fs::write(dir.path().join(name), b"").expect("touch");
        }
        std::fs::write(dir.path().join("queue.lock"), b"").expect("touch");
        std::fs::create_dir(dir.path().join("0000000000099.dque")).expect("mkdir");

        let range = scan_segment_range(dir.path()).expect("scan");
        assert_eq!(range, Some((3, 11)));
    }

    #[test]
    fn scan_of_empty_directory_is_none() {
        let dir = TempDir::new().expect("tempdir");
        assert_eq!(scan_segment_range(dir.path()).expect("scan"), None);
    }
}
