use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Exclusive advisory lock on the database `LOCK` file.
///
/// Held for the lifetime of a writable database; released when dropped.
pub struct FileLock {
    _file: File,
    path: PathBuf,
}

impl FileLock {
    /// Creates the lock file if needed and locks it without blocking.
    /// The file records the owning process id for debugging.
    pub fn lock<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        Self::try_lock(&file)?;

        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    #[cfg(unix)]
    fn try_lock(file: &File) -> io::Result<()> {
        use libc::{flock, LOCK_EX, LOCK_NB};

        let fd = file.as_raw_fd();
        let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(windows)]
    fn try_lock(file: &File) -> io::Result<()> {
        use std::os::windows::io::AsRawHandle;
        use winapi::um::fileapi::LockFileEx;
        use winapi::um::minwinbase::OVERLAPPED;
        use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

        let handle = file.as_raw_handle();
        let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
        let result = unsafe {
            LockFileEx(
                handle as *mut _,
                LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
                0,
                !0,
                !0,
                &mut overlapped,
            )
        };

        if result == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(any(unix, windows)))]
    fn try_lock(_file: &File) -> io::Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;
    use std::fs;

    #[test]
    fn test_lock_writes_pid() -> io::Result<()> {
        let dir = TempDir::new()?;
        let lock_path = dir.child("LOCK");

        let lock = FileLock::lock(&lock_path)?;
        assert_eq!(lock.path(), lock_path.as_path());
        let content = fs::read_to_string(&lock_path)?;
        assert!(content.contains(&std::process::id().to_string()));
        Ok(())
    }

    #[test]
    fn test_double_lock() -> io::Result<()> {
        let dir = TempDir::new()?;
        let lock_path = dir.child("LOCK");

        let first = FileLock::lock(&lock_path)?;
        assert!(FileLock::lock(&lock_path).is_err());

        // the failed attempt must not clobber the owner's pid
        let content = fs::read_to_string(&lock_path)?;
        assert!(content.contains(&std::process::id().to_string()));
        drop(first);
        Ok(())
    }

    #[test]
    fn test_auto_unlock_on_drop() -> io::Result<()> {
        let dir = TempDir::new()?;
        let lock_path = dir.child("LOCK");

        {
            let _lock = FileLock::lock(&lock_path)?;
            assert!(lock_path.exists());
        }

        let _again = FileLock::lock(&lock_path)?;
        Ok(())
    }
}
