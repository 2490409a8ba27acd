// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{Error, Result};
use std::{fs::File, path::Path};

/// Advisory lock on an open file, released on drop (or process exit).
///
/// Writers take exclusive locks, readers shared locks. Locks only exclude
/// other cooperating processes; within one process the single-writer rule
/// is enforced by ownership of the engine handle.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl FileLock {
    /// Creates the lock file if needed and takes the lock, non-blocking.
    ///
    /// Returns [`Error::Conflict`] when another process holds it.
    pub fn take(path: &Path, mode: LockMode) -> Result<Self> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        Self::lock_file(&file, mode, path)?;

        Ok(Self { _file: file })
    }

    #[cfg(unix)]
    fn lock_file(file: &File, mode: LockMode, path: &Path) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        let op = match mode {
            LockMode::Shared => libc::LOCK_SH,
            LockMode::Exclusive => libc::LOCK_EX,
        };

        // SAFETY: fd is valid for the lifetime of `file`
        let rc = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(Error::Conflict(format!("{} is locked", path.display())));
            }

            return Err(Error::Io(err));
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn lock_file(_file: &File, _mode: LockMode, _path: &Path) -> Result<()> {
        Ok(())
    }
}

/// Locks an already-open file descriptor (used by the mapped files).
#[cfg(unix)]
pub fn lock_fd(file: &File, mode: LockMode) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    let op = match mode {
        LockMode::Shared => libc::LOCK_SH,
        LockMode::Exclusive => libc::LOCK_EX,
    };

    // SAFETY: fd is valid for the lifetime of `file`
    let rc = unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn lock_fd(_file: &File, _mode: LockMode) -> std::io::Result<()> {
    Ok(())
}
