//! Binlog segment files on disk.
//!
//! Segments are named `write2file<N>` inside the log directory. These helpers never hold the
//! binlog mutex, so purge tasks can run them while writes continue on the newest segment.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use pika_common::error::{PikaError, PikaResult};
use pika_common::ids::SegmentNumber;
use tracing::info;

/// File-name prefix shared by every segment.
pub const SEGMENT_PREFIX: &str = "write2file";

/// One segment found in the log directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    /// Segment sequence number.
    pub number: SegmentNumber,
    /// Full path of the segment.
    pub path: PathBuf,
    /// Last modification time.
    pub modified: SystemTime,
}

/// Path of segment `number` inside `dir`.
#[must_use]
pub fn segment_path(dir: &Path, number: SegmentNumber) -> PathBuf {
    dir.join(format!("{SEGMENT_PREFIX}{number}"))
}

/// Extracts the sequence number from a segment file name.
#[must_use]
pub fn parse_segment_name(name: &str) -> Option<SegmentNumber> {
    name.strip_prefix(SEGMENT_PREFIX)?.parse().ok()
}

/// Lists segments ordered by number. A missing directory holds no segments.
///
/// # Errors
///
/// Returns `PikaError::Io` when the directory exists but cannot be read.
pub fn list_segments(dir: &Path) -> PikaResult<Vec<SegmentFile>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => {
            return Err(PikaError::io(&format!("list log dir {}", dir.display()), &error));
        }
    };

    let mut segments = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let number = parse_segment_name(entry.file_name().to_str()?)?;
            let modified = entry.metadata().ok()?.modified().ok()?;
            Some(SegmentFile {
                number,
                path: entry.path(),
                modified,
            })
        })
        .collect::<Vec<_>>();
    segments.sort_by_key(|segment| segment.number);
    Ok(segments)
}

/// Number of segments in `dir`.
///
/// # Errors
///
/// Returns `PikaError::Io` when the directory cannot be read.
pub fn segment_count(dir: &Path) -> PikaResult<usize> {
    Ok(list_segments(dir)?.len())
}

/// Highest segment number whose modification time is not after `deadline`.
///
/// # Errors
///
/// Returns `PikaError::Io` when the directory cannot be read.
pub fn max_deadline_index(dir: &Path, deadline: SystemTime) -> PikaResult<Option<SegmentNumber>> {
    Ok(list_segments(dir)?
        .into_iter()
        .filter(|segment| segment.modified <= deadline)
        .map(|segment| segment.number)
        .max())
}

/// Deletes every segment numbered `<= to` and returns the removed numbers.
///
/// A segment that vanished concurrently is skipped.
///
/// # Errors
///
/// Returns `PikaError::Io` when the directory cannot be read or a file cannot be removed.
pub fn remove_segments_up_to(dir: &Path, to: SegmentNumber) -> PikaResult<Vec<SegmentNumber>> {
    let mut removed = Vec::new();
    for segment in list_segments(dir)? {
        if segment.number > to {
            continue;
        }
        match fs::remove_file(&segment.path) {
            Ok(()) => {
                info!(path = %segment.path.display(), "binlog segment deleted");
                removed.push(segment.number);
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                return Err(PikaError::io(
                    &format!("remove segment {}", segment.path.display()),
                    &error,
                ));
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::{
        list_segments, max_deadline_index, parse_segment_name, remove_segments_up_to,
        segment_count, segment_path,
    };
    use googletest::prelude::*;
    use rstest::rstest;
    use std::fs;
    use std::time::{Duration, SystemTime};

    fn seed(dir: &std::path::Path, numbers: &[u32]) {
        for number in numbers {
            fs::write(segment_path(dir, *number), b"x").expect("segment write should succeed");
        }
    }

    #[rstest]
    #[case("write2file0", Some(0))]
    #[case("write2file42", Some(42))]
    #[case("write2file", None)]
    #[case("write2filex", None)]
    #[case("manifest", None)]
    fn segment_names_parse_only_with_numeric_suffix(
        #[case] name: &str,
        #[case] expected: Option<u32>,
    ) {
        assert_that!(parse_segment_name(name), eq(expected));
    }

    #[rstest]
    fn listing_ignores_foreign_files_and_sorts_numerically() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        seed(dir.path(), &[10, 2, 1]);
        fs::write(dir.path().join("manifest"), b"m").expect("write should succeed");

        let numbers = list_segments(dir.path())
            .expect("listing should succeed")
            .into_iter()
            .map(|segment| segment.number)
            .collect::<Vec<_>>();
        assert_that!(&numbers, eq(&vec![1, 2, 10]));
    }

    #[rstest]
    fn missing_directory_has_no_segments() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        let count = segment_count(&dir.path().join("absent")).expect("count should succeed");
        assert_that!(count, eq(0));
    }

    #[rstest]
    fn purge_removes_exactly_segments_up_to_bound() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        seed(dir.path(), &[0, 1, 2, 3, 4, 5]);

        let removed = remove_segments_up_to(dir.path(), 3).expect("purge should succeed");
        assert_that!(&removed, eq(&vec![0, 1, 2, 3]));
        for number in 0..=3 {
            assert_that!(segment_path(dir.path(), number).exists(), eq(false));
        }
        for number in 4..=5 {
            assert_that!(segment_path(dir.path(), number).exists(), eq(true));
        }
    }

    #[rstest]
    fn deadline_index_respects_modification_time() {
        let dir = tempfile::tempdir().expect("tempdir should be created");
        seed(dir.path(), &[3, 7]);

        let future = SystemTime::now() + Duration::from_secs(3600);
        let past = SystemTime::UNIX_EPOCH + Duration::from_secs(60);
        let newest = max_deadline_index(dir.path(), future).expect("scan should succeed");
        let none = max_deadline_index(dir.path(), past).expect("scan should succeed");
        assert_that!(newest, eq(Some(7)));
        assert_that!(none, eq(None));
    }
}
