//! Single-instance lock. One file, one PID, owner-only.

use anon_common::Fault;
use anyhow::{Context, Result};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
    pid: i32,
}

impl ProcessLock {
    /// Acquire the lock, reaping a stale entry whose PID is no longer live.
    pub fn acquire<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();

        if let Ok(content) = std::fs::read_to_string(&path) {
            match content.trim().parse::<i32>() {
                Ok(pid) if pid > 1 && pid_alive(pid) => {
                    return Err(Fault::LockContention(pid).into());
                }
                Ok(pid) => {
                    warn!(pid, "reaping stale lock");
                    std::fs::remove_file(&path).ok();
                }
                Err(_) => {
                    warn!(path = %path.display(), "reaping unparsable lock file");
                    std::fs::remove_file(&path).ok();
                }
            }
        }

        let pid = std::process::id() as i32;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .with_context(|| format!("failed to create lock file {}", path.display()))?;
        writeln!(file, "{pid}")?;
        info!(pid, "system lock acquired");

        Ok(Self { path, pid })
    }

    /// Release explicitly; also happens on drop.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        // Only remove the file if it still records us.
        if let Ok(content) = std::fs::read_to_string(&self.path)
            && content.trim().parse::<i32>() == Ok(self.pid)
        {
            std::fs::remove_file(&self.path).ok();
        }
    }
}

/// Signal 0 probe: does the kernel still know this PID?
pub fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_own_pid_and_drop_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anonmanager.lock");

        let lock = ProcessLock::acquire(&path).unwrap();
        let recorded: i32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(recorded, std::process::id() as i32);

        drop(lock);
        assert!(!path.exists());
    }

    #[test]
    fn contention_when_holder_is_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anonmanager.lock");
        // Our own PID is certainly alive.
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        let err = ProcessLock::acquire(&path).unwrap_err();
        let fault = err.downcast_ref::<Fault>().unwrap();
        assert!(matches!(fault, Fault::LockContention(_)));
    }

    #[test]
    fn stale_lock_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anonmanager.lock");
        // PID near i32::MAX will not exist.
        std::fs::write(&path, "2147483000\n").unwrap();

        let _lock = ProcessLock::acquire(&path).unwrap();
        let recorded: i32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(recorded, std::process::id() as i32);
    }

    #[test]
    fn garbage_lock_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anonmanager.lock");
        std::fs::write(&path, "not a pid\n").unwrap();

        assert!(ProcessLock::acquire(&path).is_ok());
    }
}
