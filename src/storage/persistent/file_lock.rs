//! Single-writer guard for a store directory.
//!
//! The OS releases the lock together with the handle, so dropping the guard
//! or the process dying frees the directory. The holder writes its pid into
//! the lock file so a refused open can name it.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::Path;

use crate::storage::StorageError;

const LOCK_FILE: &str = ".lock";

/// Exclusive claim on a store directory, held while the store is open.
#[derive(Debug)]
pub(crate) struct FileLock {
    _file: File,
}

impl FileLock {
    /// Claims `dir` without blocking.
    ///
    /// # Errors
    ///
    /// `StorageError::Locked` naming the holder's pid when another handle has
    /// the directory, `StorageError::BackendError` for any other I/O failure.
    pub(crate) fn acquire(dir: &Path) -> Result<Self, StorageError> {
        let backend =
            |e: io::Error| StorageError::BackendError(format!("cannot lock {}: {e}", dir.display()));

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))
            .map_err(backend)?;
        match exclusive(&file) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                return Err(StorageError::Locked(match holder(dir) {
                    Some(pid) => format!("{} (held by pid {pid})", dir.display()),
                    None => dir.display().to_string(),
                }));
            }
            Err(e) => return Err(backend(e)),
        }

        stamp_pid(&mut file).map_err(backend)?;
        Ok(Self { _file: file })
    }
}

fn stamp_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    write!(file, "{}", std::process::id())?;
    file.flush()
}

/// Pid left in the lock file by the current or last holder.
fn holder(dir: &Path) -> Option<u32> {
    fs::read_to_string(dir.join(LOCK_FILE)).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and valid for this call.
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        Ok(())
    } else {
        // EWOULDBLOCK surfaces as ErrorKind::WouldBlock.
        Err(io::Error::last_os_error())
    }
}

#[cfg(windows)]
fn exclusive(file: &File) -> io::Result<()> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::{ERROR_LOCK_VIOLATION, HANDLE};
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    // SAFETY: the handle is owned by `file`; OVERLAPPED is plain data.
    let locked = unsafe {
        let mut overlapped = std::mem::zeroed::<OVERLAPPED>();
        LockFileEx(
            file.as_raw_handle() as HANDLE,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };
    if locked != 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == i32::try_from(ERROR_LOCK_VIOLATION).ok() {
        return Err(io::Error::new(ErrorKind::WouldBlock, err));
    }
    Err(err)
}

#[cfg(not(any(unix, windows)))]
fn exclusive(_file: &File) -> io::Result<()> {
    Err(io::Error::new(
        ErrorKind::Unsupported,
        "directory locking is not available on this platform",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_directory_is_claimed_once_until_dropped() {
        let dir = tempdir().unwrap();
        {
            let _held = FileLock::acquire(dir.path()).unwrap();
            let err = FileLock::acquire(dir.path()).unwrap_err();
            assert!(matches!(err, StorageError::Locked(_)));
            #[cfg(unix)]
            {
                assert_eq!(holder(dir.path()), Some(std::process::id()));
                assert!(err.to_string().contains(&format!("pid {}", std::process::id())));
            }
        }
        assert!(FileLock::acquire(dir.path()).is_ok());
    }

    #[test]
    fn test_missing_directory_is_a_backend_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent");
        let err = FileLock::acquire(&missing).unwrap_err();
        assert!(matches!(err, StorageError::BackendError(_)));
    }
}
