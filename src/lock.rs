use crate::error::Error;
use log::{debug, warn};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// An exclusive lock file holding the owner's pid, removed again when dropped.
///
/// Only guards runs that share `dir`, so every scheduled host must point at the same directory.
/// A lock whose owner process no longer exists is taken over.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(dir: &Path, name: &str) -> Result<Self, Error> {
        let path = dir.join(format!("{}.lock", name));

        if let Some(lock) = try_create(&path)? {
            return Ok(lock);
        }
        if clear_stale(&path)? {
            if let Some(lock) = try_create(&path)? {
                return Ok(lock);
            }
        }
        Err(Error::LockHeld {
            path: path.display().to_string(),
        })
    }
}

fn try_create(path: &Path) -> Result<Option<RunLock>, Error> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            writeln!(file, "{}", std::process::id())?;
            debug!("acquired {}", path.display());
            Ok(Some(RunLock {
                path: path.to_path_buf(),
            }))
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Removes `path` when the pid inside it belongs to no running process.
/// A file without a readable pid counts as held.
fn clear_stale(path: &Path) -> Result<bool, Error> {
    let owner = match fs::read_to_string(path) {
        Ok(contents) => contents.trim().parse::<u32>().ok(),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
        Err(err) => return Err(err.into()),
    };

    match owner {
        Some(pid) if !is_process_alive(pid) => {
            warn!("taking over {} left behind by process {}", path.display(), pid);
            match fs::remove_file(path) {
                Ok(()) => Ok(true),
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
                Err(err) => Err(err.into()),
            }
        }
        _ => Ok(false),
    }
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return true;
    };
    if pid <= 0 {
        return true;
    }
    // SAFETY: signal 0 only checks that the process exists
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    true
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("failed to release {}: {}", self.path.display(), err);
        }
    }
}
