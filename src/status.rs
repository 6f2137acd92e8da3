/// Lock status report for a script, printed by `cronguard --status`.
use crate::guard::ProcessGuard;
use crate::lock::Owner;
use serde::Serialize;
use std::path::PathBuf;

/// Exit codes for `--status`.
pub const STATUS_UNLOCKED: i32 = 0;
pub const STATUS_LOCKED: i32 = 1;
pub const STATUS_STALE: i32 = 3;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LockStatus {
    pub script: String,
    pub lock_file: PathBuf,
    pub locked: bool,
    pub owner_pid: Option<u32>,
    pub owner_alive: bool,
}

impl LockStatus {
    /// Inspect the guard's lock file without modifying it.
    pub fn probe(guard: &ProcessGuard) -> Self {
        let lock_file = guard.lock_file();
        let owner = guard.owner();
        let owner_pid = match owner {
            Owner::Pid(pid) => Some(pid),
            Owner::None | Owner::Unreadable => None,
        };
        Self {
            script: guard.script_name().to_string(),
            lock_file,
            locked: owner != Owner::None,
            owner_pid,
            owner_alive: owner_pid.is_some_and(|pid| guard.is_running(pid)),
        }
    }

    pub fn is_stale(&self) -> bool {
        self.locked && !self.owner_alive
    }

    pub fn exit_code(&self) -> i32 {
        if !self.locked {
            STATUS_UNLOCKED
        } else if self.owner_alive {
            STATUS_LOCKED
        } else {
            STATUS_STALE
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_text(&self) -> String {
        let state = match (self.locked, self.owner_pid) {
            (false, _) => "unlocked".to_string(),
            (true, Some(pid)) if self.owner_alive => format!("locked by running PID {pid}"),
            (true, Some(pid)) => format!("stale lock from PID {pid} (not running)"),
            (true, None) => "stale lock with unreadable owner".to_string(),
        };
        format!("{}: {} [{}]", self.script, state, self.lock_file.display())
    }
}
