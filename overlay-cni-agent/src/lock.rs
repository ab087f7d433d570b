use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::Result;

pub const DEFAULT_LOCK_FILE: &str = "/var/run/overlay-cni/reconciler.lock";
pub const DEFAULT_PID_FILE: &str = "/var/run/overlay-cni/reconciler.pid";

/// Held by the one reconciler allowed to run on a node. Dropping it removes
/// the pid file and releases the lock.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    pid_file: PathBuf,
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.pid_file)
            && e.kind() != ErrorKind::NotFound
        {
            warn!(%e, "failed to remove pid file {}", self.pid_file.display());
        }
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(%e, "failed to release instance lock");
        }
    }
}

/// What [`probe`] found on disk.
#[derive(Debug, PartialEq, Eq)]
pub enum Instance {
    /// Nobody holds the lock.
    Free,
    /// The lock is held. `pid` is read from the pid file when it names a live
    /// process.
    Running { pid: Option<u32> },
}

fn open_lock(lock_file: &Path) -> Result<File> {
    if let Some(parent) = lock_file.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_file)?)
}

/// Takes the instance lock without blocking and records our pid. Returns
/// `None` when another process holds it.
pub fn acquire(lock_file: &Path, pid_file: &Path) -> Result<Option<InstanceLock>> {
    let file = open_lock(lock_file)?;
    match file.try_lock_exclusive() {
        Ok(()) => {}
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if let Some(parent) = pid_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(pid_file, std::process::id().to_string())?;
    debug!("holding instance lock {}", lock_file.display());
    Ok(Some(InstanceLock {
        file,
        pid_file: pid_file.to_owned(),
    }))
}

/// Reports whether a reconciler holds the lock, without taking it.
pub fn probe(lock_file: &Path, pid_file: &Path) -> Result<Instance> {
    let file = open_lock(lock_file)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            FileExt::unlock(&file)?;
            return Ok(Instance::Free);
        }
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => {}
        Err(e) => return Err(e.into()),
    }
    let pid = read_pid(pid_file)?;
    match pid {
        Some(pid) if pid_alive(pid) => Ok(Instance::Running { pid: Some(pid) }),
        Some(pid) => {
            warn!(pid, "pid file names a process that is gone");
            Ok(Instance::Running { pid: None })
        }
        None => Ok(Instance::Running { pid: None }),
    }
}

fn read_pid(pid_file: &Path) -> Result<Option<u32>> {
    match fs::read_to_string(pid_file) {
        Ok(s) => Ok(s.trim().parse().ok()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}
