//! File assembly — concatenating decoded segment files into the final file
//!
//! Runs on the blocking thread pool: assembly is pure sequential disk I/O.
//! Segment files are consumed (deleted) as they are appended, so a crash
//! mid-assembly leaves the remaining segments intact for a retry. Any error
//! removes the partial output before propagating; the destination directory
//! never holds a half-assembled file.

use crate::error::AssembleError;
use crate::queue::AssemblyJob;
use crate::utils::get_unique_path;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Concatenate a file's decoded segments, in segment-number order, into its
/// final destination path.
///
/// The output name is the file's working name; an existing file of the same
/// name is never overwritten, the new file gets a ` (N)` suffix instead.
/// Returns the path the assembled file landed at.
pub fn assemble_file(
    job: &AssemblyJob,
    working_dir: &Path,
    cancel: &CancellationToken,
) -> Result<PathBuf, AssembleError> {
    fs::create_dir_all(&job.dest_dir)?;
    let desired = job.dest_dir.join(&job.working_name);
    let dest = get_unique_path(&desired).map_err(|_| AssembleError::CollisionUnresolved {
        path: desired.clone(),
    })?;
    if dest != desired {
        tracing::info!(
            wanted = %desired.display(),
            actual = %dest.display(),
            "destination name taken, assembling under suffixed name"
        );
    }

    let result = append_segments(job, working_dir, &dest, cancel);
    if result.is_err() {
        // Never leave a half-assembled file behind
        let _ = fs::remove_file(&dest);
    }
    result.map(|()| dest)
}

fn append_segments(
    job: &AssemblyJob,
    working_dir: &Path,
    dest: &Path,
    cancel: &CancellationToken,
) -> Result<(), AssembleError> {
    let mut out = BufWriter::new(File::create(dest)?);

    for &number in &job.segment_numbers {
        if cancel.is_cancelled() {
            return Err(AssembleError::Canceled);
        }
        let segment_path = working_dir.join(format!("{}.segment{:04}", job.working_name, number));
        let mut segment = File::open(&segment_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AssembleError::SegmentFileMissing {
                    path: segment_path.clone(),
                }
            } else {
                AssembleError::Io(e)
            }
        })?;
        std::io::copy(&mut segment, &mut out)?;
        drop(segment);
        // Consumed; the bytes now live in the output file
        fs::remove_file(&segment_path)?;
    }

    out.flush()?;
    tracing::info!(
        archive = %job.archive_name,
        file = %dest.display(),
        segments = job.segment_numbers.len(),
        "file assembled"
    );
    Ok(())
}

/// Rename already-written segment files from a provisional working name to
/// the resolved one. Files that do not exist yet are skipped; later segments
/// are written directly under the new name.
pub fn rename_working_files(working_dir: &Path, old_working_name: &str, new_name: &str) {
    let Ok(entries) = fs::read_dir(working_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(suffix) = name.strip_prefix(old_working_name) else {
            continue;
        };
        if !suffix.starts_with(".segment") {
            continue;
        }
        let new_path = working_dir.join(format!("{new_name}{suffix}"));
        if let Err(e) = fs::rename(entry.path(), &new_path) {
            tracing::warn!(
                from = %entry.path().display(),
                to = %new_path.display(),
                error = %e,
                "segment rename failed"
            );
        }
    }
}

/// Delete leftover segment files for the given working names (archive
/// cancellation cleanup). Missing files are fine; only unexpected I/O errors
/// are logged.
pub fn cleanup_working_files(working_dir: &Path, working_names: &[String]) {
    let Ok(entries) = fs::read_dir(working_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let is_leftover = working_names
            .iter()
            .any(|w| name.starts_with(w.as_str()) && name[w.len()..].starts_with(".segment"));
        if is_leftover
            && let Err(e) = fs::remove_file(entry.path())
        {
            tracing::warn!(path = %entry.path().display(), error = %e, "cleanup failed");
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArchiveId;
    use tempfile::TempDir;

    fn write_segment(dir: &Path, working_name: &str, number: u32, data: &[u8]) {
        fs::write(dir.join(format!("{working_name}.segment{number:04}")), data).unwrap();
    }

    fn job(working_name: &str, dest_dir: PathBuf, segment_numbers: Vec<u32>) -> AssemblyJob {
        AssemblyJob {
            archive: ArchiveId::new(1),
            file: 0,
            archive_name: "test-archive".to_string(),
            working_name: working_name.to_string(),
            dest_dir,
            segment_numbers,
        }
    }

    #[test]
    fn assembles_segments_in_number_order() {
        let working = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        write_segment(working.path(), "file.bin", 2, b" world");
        write_segment(working.path(), "file.bin", 1, b"hello");

        let job = job("file.bin", dest.path().to_path_buf(), vec![1, 2]);
        let path = assemble_file(&job, working.path(), &CancellationToken::new()).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"hello world");
        assert_eq!(path, dest.path().join("file.bin"));
    }

    #[test]
    fn segment_files_are_deleted_as_consumed() {
        let working = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        write_segment(working.path(), "f.bin", 1, b"a");
        write_segment(working.path(), "f.bin", 2, b"b");

        let job = job("f.bin", dest.path().to_path_buf(), vec![1, 2]);
        assemble_file(&job, working.path(), &CancellationToken::new()).unwrap();

        assert!(!working.path().join("f.bin.segment0001").exists());
        assert!(!working.path().join("f.bin.segment0002").exists());
    }

    #[test]
    fn zero_byte_placeholder_segments_assemble_cleanly() {
        let working = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        write_segment(working.path(), "f.bin", 1, b"data");
        write_segment(working.path(), "f.bin", 2, b"");
        write_segment(working.path(), "f.bin", 3, b"more");

        let job = job("f.bin", dest.path().to_path_buf(), vec![1, 2, 3]);
        let path = assemble_file(&job, working.path(), &CancellationToken::new()).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"datamore");
    }

    #[test]
    fn existing_destination_is_not_overwritten() {
        let working = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        fs::write(dest.path().join("movie.mkv"), b"precious").unwrap();
        write_segment(working.path(), "movie.mkv", 1, b"new content");

        let job = job("movie.mkv", dest.path().to_path_buf(), vec![1]);
        let path = assemble_file(&job, working.path(), &CancellationToken::new()).unwrap();

        assert_eq!(path, dest.path().join("movie (1).mkv"));
        assert_eq!(
            fs::read(dest.path().join("movie.mkv")).unwrap(),
            b"precious",
            "the pre-existing file must survive untouched"
        );
        assert_eq!(fs::read(&path).unwrap(), b"new content");
    }

    #[test]
    fn missing_segment_file_is_an_error_and_leaves_no_partial_output() {
        let working = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        write_segment(working.path(), "f.bin", 1, b"a");
        // segment 2 never written

        let job = job("f.bin", dest.path().to_path_buf(), vec![1, 2]);
        let err = assemble_file(&job, working.path(), &CancellationToken::new()).unwrap_err();

        assert!(matches!(err, AssembleError::SegmentFileMissing { .. }));
        assert!(
            !dest.path().join("f.bin").exists(),
            "partial output must be removed on failure"
        );
    }

    #[test]
    fn cancellation_aborts_and_removes_partial_output() {
        let working = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        write_segment(working.path(), "f.bin", 1, b"a");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let job = job("f.bin", dest.path().to_path_buf(), vec![1]);
        let err = assemble_file(&job, working.path(), &cancel).unwrap_err();

        assert!(matches!(err, AssembleError::Canceled));
        assert!(!dest.path().join("f.bin").exists());
        assert!(
            working.path().join("f.bin.segment0001").exists(),
            "unconsumed segments stay on disk after cancellation"
        );
    }

    #[test]
    fn cleanup_removes_only_matching_segment_files() {
        let working = TempDir::new().unwrap();
        write_segment(working.path(), "a.bin", 1, b"x");
        write_segment(working.path(), "a.bin", 2, b"y");
        write_segment(working.path(), "keep.bin", 1, b"z");
        fs::write(working.path().join("unrelated.txt"), b"w").unwrap();

        cleanup_working_files(working.path(), &["a.bin".to_string()]);

        assert!(!working.path().join("a.bin.segment0001").exists());
        assert!(!working.path().join("a.bin.segment0002").exists());
        assert!(working.path().join("keep.bin.segment0001").exists());
        assert!(working.path().join("unrelated.txt").exists());
    }

    #[test]
    fn cleanup_tolerates_missing_working_directory() {
        cleanup_working_files(Path::new("/nonexistent/for/this/test"), &["x".to_string()]);
    }

    #[test]
    fn rename_moves_all_segments_to_the_resolved_name() {
        let working = TempDir::new().unwrap();
        write_segment(working.path(), "tmp-name", 1, b"a");
        write_segment(working.path(), "tmp-name", 3, b"c");
        write_segment(working.path(), "other", 1, b"x");

        rename_working_files(working.path(), "tmp-name", "movie.mkv");

        assert_eq!(
            fs::read(working.path().join("movie.mkv.segment0001")).unwrap(),
            b"a"
        );
        assert_eq!(
            fs::read(working.path().join("movie.mkv.segment0003")).unwrap(),
            b"c"
        );
        assert!(working.path().join("other.segment0001").exists());
        assert!(!working.path().join("tmp-name.segment0001").exists());
    }

    #[test]
    fn rename_with_no_matching_segments_is_a_no_op() {
        let working = TempDir::new().unwrap();
        fs::write(working.path().join("unrelated.txt"), b"w").unwrap();
        rename_working_files(working.path(), "tmp-name", "movie.mkv");
        assert!(working.path().join("unrelated.txt").exists());
    }
}
