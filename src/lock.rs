/// PID-file lock protocol for a single script.
///
/// The lock file lives at `<lock_dir>/<script><suffix>` and holds the owner's
/// pid as decimal text. A lock whose owner is missing from the process
/// registry is stale and is taken over by the next `lock()` call.
///
/// `lock()` is a single point-in-time check followed by a write. Two processes
/// calling it in the same instant can both observe a stale (or missing) lock
/// and both succeed; the last writer's pid ends up in the file.
use crate::error::{require_dir, GuardError};
use crate::journal::ScriptLog;
use crate::registry::{ProcessRegistry, ProcessTable};
use std::path::{Path, PathBuf};

pub const DEFAULT_LOCK_SUFFIX: &str = ".PID";

pub struct LockManager {
    lock_dir: PathBuf,
    suffix: String,
    script_name: String,
    pid: u32,
    registry: Box<dyn ProcessRegistry>,
}

/// What the lock file currently says about ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// No lock file.
    None,
    /// Lock file records this pid.
    Pid(u32),
    /// Lock file exists but its contents are not a pid.
    Unreadable,
}

impl LockManager {
    /// Create a manager backed by the host process table.
    pub fn new(lock_dir: impl Into<PathBuf>, script_name: &str, pid: u32) -> Self {
        Self::with_registry(lock_dir, script_name, pid, Box::new(ProcessTable))
    }

    pub fn with_registry(
        lock_dir: impl Into<PathBuf>,
        script_name: &str,
        pid: u32,
        registry: Box<dyn ProcessRegistry>,
    ) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            suffix: DEFAULT_LOCK_SUFFIX.to_string(),
            script_name: script_name.to_string(),
            pid,
            registry,
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Change the lock directory. Fails without changing anything unless
    /// `dir` is an existing directory.
    pub fn set_lock_dir(&mut self, dir: impl Into<PathBuf>) -> Result<(), GuardError> {
        self.lock_dir = require_dir(dir)?;
        Ok(())
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn set_suffix(&mut self, suffix: &str) {
        self.suffix = suffix.to_string();
    }

    /// Path of this script's lock file.
    pub fn path(&self) -> PathBuf {
        self.lock_dir.join(format!("{}{}", self.script_name, self.suffix))
    }

    /// True if a lock file exists, whether or not its owner is alive.
    pub fn is_locked(&self) -> bool {
        self.path().exists()
    }

    /// Read the recorded owner.
    pub fn owner(&self) -> Owner {
        match std::fs::read_to_string(self.path()) {
            Ok(contents) => contents
                .trim()
                .parse()
                .map(Owner::Pid)
                .unwrap_or(Owner::Unreadable),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Owner::None,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %self.path().display(),
                    "failed to read lock file"
                );
                Owner::Unreadable
            }
        }
    }

    /// Whether `pid` is currently running according to the registry.
    pub fn is_running(&self, pid: u32) -> bool {
        self.registry.is_live(pid)
    }

    /// Try to take the lock for this process. Never blocks or retries.
    ///
    /// Returns false only when another live process owns the lock, or when
    /// the lock file cannot be written.
    pub fn lock(&self, log: &ScriptLog) -> bool {
        match self.owner() {
            Owner::None => {}
            Owner::Pid(owner) if owner == self.pid => {
                log.write(&format!("lock already held by this process, PID:{owner}"));
            }
            Owner::Pid(owner) if self.is_running(owner) => {
                log.write(&format!(
                    "running as PID:{} attempted to attain a lock but one was already provided for PID:{owner}",
                    self.pid
                ));
                tracing::info!(owner, script = %self.script_name, "lock held by live process");
                return false;
            }
            Owner::Pid(owner) => {
                log.write(&format!("running as PID:{owner} unexpectedly died"));
                tracing::warn!(owner, script = %self.script_name, "taking over stale lock");
            }
            Owner::Unreadable => {
                log.write("lock file has no readable owner PID, taking it over");
                tracing::warn!(script = %self.script_name, "taking over unreadable lock");
            }
        }

        let path = self.path();
        if let Err(e) = std::fs::write(&path, self.pid.to_string()) {
            log.write(&format!("could not write lock with PID:{}: {e}", self.pid));
            tracing::error!(error = %e, path = %path.display(), "failed to write lock file");
            return false;
        }
        log.write(&format!("acquired lock with PID:{}", self.pid));
        true
    }

    /// Remove the lock file. Succeeds trivially when there is none.
    pub fn unlock(&self, log: &ScriptLog) -> bool {
        let path = self.path();
        let owner = match self.owner() {
            Owner::None => {
                log.write("tried to release lock, but no lock was found.");
                return true;
            }
            Owner::Pid(pid) => pid.to_string(),
            Owner::Unreadable => "?".to_string(),
        };

        match std::fs::remove_file(&path) {
            Ok(()) => {
                log.write(&format!("lock with PID:{owner} has been released."));
                true
            }
            Err(e) => {
                log.write(&format!("lock exists with PID:{owner} but it could not be released."));
                tracing::warn!(error = %e, path = %path.display(), "failed to remove lock file");
                false
            }
        }
    }
}
