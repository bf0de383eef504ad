//! Filesystem helpers: collision-free paths and disk space probes

use crate::error::{AssembleError, Result};
use std::path::{Path, PathBuf};

/// Upper bound on collision-suffix attempts before giving up
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Find a path at which a new file can be created without clobbering an
/// existing one.
///
/// Returns `path` itself when it is free; otherwise appends ` (1)`, ` (2)`,
/// ... before the extension until an unused name is found. The assembled
/// output always wins a name this way; nothing already on disk is ever
/// overwritten.
pub fn get_unique_path(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        return Ok(path.to_path_buf());
    }

    let stem = path.file_stem().and_then(|s| s.to_str()).ok_or_else(|| {
        AssembleError::CollisionUnresolved {
            path: path.to_path_buf(),
        }
    })?;
    let extension = path.extension().and_then(|e| e.to_str());
    let parent = path.parent().ok_or_else(|| AssembleError::CollisionUnresolved {
        path: path.to_path_buf(),
    })?;

    for i in 1..=MAX_RENAME_ATTEMPTS {
        let candidate = match extension {
            Some(ext) => format!("{stem} ({i}).{ext}"),
            None => format!("{stem} ({i})"),
        };
        let candidate = parent.join(candidate);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(AssembleError::CollisionUnresolved {
        path: path.to_path_buf(),
    }
    .into())
}

/// Whether an I/O error means the filesystem ran out of space
pub fn is_disk_full(e: &std::io::Error) -> bool {
    if e.kind() == std::io::ErrorKind::StorageFull {
        return true;
    }
    // ENOSPC surfaces as a raw OS error on some platforms/kinds
    #[cfg(unix)]
    if e.raw_os_error() == Some(libc::ENOSPC) {
        return true;
    }
    false
}

/// Query the free disk space available at `path`.
///
/// Uses statvfs on unix and GetDiskFreeSpaceExW on Windows.
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid null-terminated C string, stat is zeroed
        // before the call, and the struct is only read after statvfs reports
        // success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            // f_bavail: blocks available to unprivileged users; f_frsize is
            // the fragment size and is preferred over f_bsize
            Ok(stat.f_bavail.saturating_mul(stat.f_frsize))
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is null-terminated, all out-pointers reference
        // valid aligned u64s, and the values are only read after the call
        // reports success.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut _total_bytes: u64 = 0;
            let mut _total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut _total_bytes as *mut u64 as *mut _,
                &mut _total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }
            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "disk space checking is not supported on this platform",
        ))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn unique_path_returns_free_path_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("movie.mkv");
        assert_eq!(get_unique_path(&path).unwrap(), path);
    }

    #[test]
    fn unique_path_suffixes_before_the_extension() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("movie.mkv");
        fs::write(&path, "original").unwrap();

        let unique = get_unique_path(&path).unwrap();
        assert_eq!(unique, temp_dir.path().join("movie (1).mkv"));

        fs::write(&unique, "first").unwrap();
        let unique2 = get_unique_path(&path).unwrap();
        assert_eq!(unique2, temp_dir.path().join("movie (2).mkv"));
    }

    #[test]
    fn unique_path_handles_extensionless_names() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("README");
        fs::write(&path, "x").unwrap();

        let unique = get_unique_path(&path).unwrap();
        assert_eq!(unique, temp_dir.path().join("README (1)"));
    }

    #[test]
    fn unique_path_only_splits_the_last_extension() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("backup.tar.gz");
        fs::write(&path, "x").unwrap();

        let unique = get_unique_path(&path).unwrap();
        assert_eq!(unique, temp_dir.path().join("backup.tar (1).gz"));
    }

    #[test]
    fn unique_path_skips_existing_suffixes() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("file.txt");
        fs::write(&path, "x").unwrap();
        fs::write(temp_dir.path().join("file (1).txt"), "x").unwrap();
        fs::write(temp_dir.path().join("file (2).txt"), "x").unwrap();

        let unique = get_unique_path(&path).unwrap();
        assert_eq!(unique, temp_dir.path().join("file (3).txt"));
    }

    #[test]
    fn available_space_reports_a_plausible_value() {
        let temp_dir = TempDir::new().unwrap();
        let available = get_available_space(temp_dir.path()).unwrap();
        assert!(available > 0);
        assert!(
            available < 1_000_000_000_000_000,
            "available space seems unreasonably large"
        );
    }

    #[test]
    fn available_space_fails_for_missing_path() {
        let result = get_available_space(Path::new("/nonexistent/path/for/this/test"));
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn enospc_is_recognized_as_disk_full() {
        let err = std::io::Error::from_raw_os_error(libc::ENOSPC);
        assert!(is_disk_full(&err));
        let other = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(!is_disk_full(&other));
    }
}
