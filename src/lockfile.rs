// Copyright 2022 The Fuchsia Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A create-exclusive lockfile that serializes publishers of a repository.
//! The owning process writes its identity into the file so a contender can
//! tell a live owner from a stale one.

use std::fs::{remove_file, File, Metadata, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use nix::errno::Errno;
use nix::unistd::{self, Pid};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// An ownerless lockfile older than this is assumed to be debris from a
/// crashed writer.
const OWNERLESS_STALE_AGE: Duration = Duration::from_secs(10);

/// Holds the publish lock for a repository while in scope; the lockfile is
/// removed again on drop.
#[derive(Debug)]
pub struct Lockfile {
    path: PathBuf,
    handle: File,
}

/// An error while creating a lockfile, including the underlying io error and,
/// when readable, the identity of the current owner.
#[derive(thiserror::Error, Debug)]
#[error(
    "obtaining lock on {} (existing owner if present: {:?}, our pid is {})",
    .lock_path.display(),
    .owner,
    std::process::id()
)]
pub struct LockfileCreateError {
    /// The underlying error attempting to create the lockfile.
    #[source]
    pub error: std::io::Error,
    /// The lockfile path being attempted.
    pub lock_path: PathBuf,
    /// The lockfile's current owner, read from the file when possible.
    pub owner: Option<LockContext>,
    /// Filesystem metadata of the lockfile, if it was available.
    pub metadata: Option<Metadata>,
}

impl LockfileCreateError {
    fn new(lock_path: &Path, error: std::io::Error) -> Self {
        let owner = match error.kind() {
            ErrorKind::AlreadyExists => {
                File::open(lock_path).ok().and_then(|f| serde_json::from_reader(f).ok())
            }
            _ => None,
        };
        let metadata = std::fs::metadata(lock_path).ok();
        Self { error, lock_path: lock_path.to_owned(), owner, metadata }
    }

    /// Whether the lockfile this error describes is still plausibly owned.
    /// Stale files should be removed and the lock retried.
    pub fn is_valid(&self, at: SystemTime, my_pid: u32) -> bool {
        if let Some(ctx) = self.owner.as_ref() {
            if ctx.pid == my_pid {
                info!(
                    "overlapping access to lockfile {} from our own process",
                    self.lock_path.display()
                );
            }
        }
        let ctime = self.metadata.as_ref().and_then(|metadata| metadata.created().ok());
        match (self.owner.as_ref(), ctime) {
            (None, Some(ctime)) if ctime + OWNERLESS_STALE_AGE < at => {
                warn!(
                    "ownerless lockfile {} is older than {:?}, treating it as stale",
                    self.lock_path.display(),
                    OWNERLESS_STALE_AGE
                );
                false
            }
            (Some(ctx), _)
                if unistd::getpgid(Some(Pid::from_raw(ctx.pid as i32)))
                    == Err(nix::Error::Sys(Errno::ESRCH)) =>
            {
                warn!(
                    "lockfile {} was created by pid {} which no longer exists, \
                     treating it as stale",
                    self.lock_path.display(),
                    ctx.pid
                );
                false
            }
            _ => true,
        }
    }

    /// Remove the offending lockfile, consuming the error if removal
    /// succeeded (or the file was already gone).
    pub fn remove_lock(self) -> Result<(), Self> {
        match remove_file(&self.lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("removing lockfile {}: {:?}", self.lock_path.display(), e);
                Err(self)
            }
        }
    }
}

/// The identity written into a lockfile by its owner. Not guaranteed unique
/// across time, so equality with the current context only proves a file was
/// *not* written by this process when it differs.
#[derive(Clone, Serialize, Deserialize, Debug, Hash, PartialOrd, PartialEq)]
pub struct LockContext {
    /// The owning process id.
    pub pid: u32,
}

impl LockContext {
    /// The context of the current process.
    pub fn current() -> Self {
        Self { pid: std::process::id() }
    }

    fn write_to<W: Write>(&self, mut handle: W) -> Result<(), std::io::Error> {
        let context_str = serde_json::to_string(self)
            .map_err(|e| std::io::Error::new(ErrorKind::Other, e))?;
        handle.write_all(context_str.as_bytes())
    }
}

impl Lockfile {
    /// Create the lockfile at `lock_path`, failing immediately if it already
    /// exists. Use [`Lockfile::lock`] to retry until a deadline instead.
    pub fn new(lock_path: &Path, context: LockContext) -> Result<Self, LockfileCreateError> {
        OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(lock_path)
            .and_then(|handle| {
                // Wrap the handle first so a failed context write still
                // removes the file in drop().
                let mut lock_file = Self { path: lock_path.to_owned(), handle };
                context.write_to(&mut lock_file.handle)?;
                lock_file.handle.flush()?;
                Ok(lock_file)
            })
            .map_err(|e| LockfileCreateError::new(lock_path, e))
    }

    /// Create the lockfile at `lock_path`, retrying with increasing sleeps
    /// until it succeeds or `timeout` has elapsed. Stale lockfiles are
    /// removed and stolen.
    pub fn lock(lock_path: &Path, timeout: Duration) -> Result<Self, LockfileCreateError> {
        let end_time = Instant::now() + timeout;
        let context = LockContext::current();
        let mut sleep_time = Duration::from_millis(10);
        loop {
            match Self::new(lock_path, context.clone()) {
                Ok(lockfile) => return Ok(lockfile),
                Err(e) if !e.is_valid(SystemTime::now(), context.pid) => {
                    // Steal the stale lock and immediately retry. Any removal
                    // failure other than not-found points at a filesystem
                    // problem, so bail.
                    info!("removing stale lockfile {}", lock_path.display());
                    e.remove_lock()?;
                }
                Err(e) if Instant::now() > end_time => return Err(e),
                _ => {
                    thread::sleep(sleep_time);
                    let remaining = end_time
                        .checked_duration_since(Instant::now())
                        .unwrap_or_default();
                    sleep_time = (sleep_time * 2).min(remaining.max(Duration::from_millis(1)));
                }
            }
        }
    }

    fn raw_unlock(lock_path: &Path) -> Result<(), std::io::Error> {
        match remove_file(lock_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Explicitly remove the lockfile, consuming the lock. The removal in
    /// drop() is a no-op afterwards.
    pub fn unlock(self) -> Result<(), std::io::Error> {
        Self::raw_unlock(&self.path)
    }

    /// The path of the held lockfile.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        if let Err(e) = Self::raw_unlock(&self.path) {
            warn!("removing lockfile {}: {:#?}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_lockfile_works() -> Result<(), anyhow::Error> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("repo.lock");
        let lock = Lockfile::new(&path, LockContext::current())?;
        assert!(path.is_file(), "lockfile {path:?} should exist");

        assert!(
            Lockfile::new(&path, LockContext::current()).is_err(),
            "should not be able to create lockfile at {path:?} while one exists"
        );
        lock.unlock()?;
        assert!(!path.is_file(), "lockfile {path:?} shouldn't exist");

        assert!(
            Lockfile::new(&path, LockContext::current()).is_ok(),
            "should be able to make a new lockfile once the old one is unlocked"
        );

        Ok(())
    }

    #[test]
    fn lock_with_timeout() -> Result<(), anyhow::Error> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("repo.lock");
        let lock = Lockfile::lock(&path, Duration::from_secs(1))?;

        Lockfile::lock(&path, Duration::from_millis(100))
            .err()
            .expect("shouldn't be able to re-lock a held lockfile");

        lock.unlock()?;
        assert!(!path.is_file(), "lockfile {path:?} shouldn't exist");

        Lockfile::lock(&path, Duration::from_secs(1))?;

        Ok(())
    }

    #[test]
    fn lock_file_validity() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("repo.lock");
        let _lock = Lockfile::new(&path, LockContext::current()).unwrap();

        let err = Lockfile::new(&path, LockContext::current())
            .err()
            .expect("should not be able to re-create lockfile");

        let now = SystemTime::now();
        let real_pid = std::process::id();
        assert!(
            err.is_valid(now, real_pid),
            "a just-created lockfile should be valid from the same process"
        );
        assert!(
            err.is_valid(now, real_pid + 1),
            "a just-created lockfile should be valid from another process"
        );
    }

    #[test]
    fn ownerless_lockfile_goes_stale() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("repo.lock");
        let _lock = File::create(&path).expect("creating empty lock file");

        let err = Lockfile::new(&path, LockContext::current())
            .err()
            .expect("should not be able to re-create lockfile");

        let now = SystemTime::now();
        let real_pid = std::process::id();
        assert!(
            err.is_valid(now, real_pid),
            "a fresh ownerless lockfile should be considered valid"
        );
        assert!(
            !err.is_valid(now + Duration::from_secs(9999), real_pid),
            "an ownerless lockfile from long ago should be invalid"
        );
    }

    #[test]
    fn non_running_pid_lockfile_is_stale() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("repo.lock");
        let _lock = Lockfile::new(&path, LockContext { pid: u32::MAX }).unwrap();

        let err = Lockfile::new(&path, LockContext::current())
            .err()
            .expect("should not be able to re-create lockfile");

        assert!(
            !err.is_valid(SystemTime::now(), std::process::id()),
            "a lockfile owned by a dead pid should be invalid"
        );
    }

    #[test]
    fn stale_lock_is_stolen_by_lock() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("repo.lock");
        // A leftover lockfile from a writer that no longer exists.
        std::fs::write(&path, serde_json::to_vec(&LockContext { pid: u32::MAX }).unwrap())
            .unwrap();

        let stolen = Lockfile::lock(&path, Duration::from_secs(1)).unwrap();
        assert_eq!(stolen.path(), path);
    }

    #[test]
    fn force_delete_nonexistent_lockfile_ok() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("repo.lock");
        let bogus_error = LockfileCreateError::new(
            &path,
            std::io::Error::new(ErrorKind::Other, "stuff"),
        );
        bogus_error.remove_lock().expect("removing non-existent lock file");
    }
}
