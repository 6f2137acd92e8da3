/// Live process enumeration, used to decide whether a lock owner is still running.
use std::collections::HashSet;
use std::path::Path;
use std::process::Command;

/// Source of the set of currently running process ids.
///
/// Implementations must not fail: when the OS cannot be queried they return
/// an empty set, which makes every recorded lock owner look dead.
pub trait ProcessRegistry {
    fn live_pids(&self) -> HashSet<u32>;

    /// Whether `pid` is in the current live set.
    fn is_live(&self, pid: u32) -> bool {
        self.live_pids().contains(&pid)
    }
}

impl<F> ProcessRegistry for F
where
    F: Fn() -> HashSet<u32>,
{
    fn live_pids(&self) -> HashSet<u32> {
        self()
    }
}

/// The host's process table.
///
/// Reads `/proc` when it is mounted, otherwise falls back to `ps -e`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessTable;

impl ProcessRegistry for ProcessTable {
    fn live_pids(&self) -> HashSet<u32> {
        let proc_root = Path::new("/proc");
        if proc_root.join("self").exists() {
            match pids_from_proc(proc_root) {
                Ok(pids) => return pids,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to enumerate /proc, falling back to ps");
                }
            }
        }
        pids_from_ps()
    }
}

fn pids_from_proc(root: &Path) -> std::io::Result<HashSet<u32>> {
    let mut pids = HashSet::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
            pids.insert(pid);
        }
    }
    Ok(pids)
}

fn pids_from_ps() -> HashSet<u32> {
    let output = match Command::new("ps").args(["-e", "-o", "pid="]).output() {
        Ok(o) if o.status.success() => o,
        Ok(o) => {
            tracing::warn!(
                status = %o.status,
                "ps exited unsuccessfully, treating process table as empty"
            );
            return HashSet::new();
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to run ps, treating process table as empty");
            return HashSet::new();
        }
    };
    parse_ps_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse one pid per line, ignoring headers and blank lines.
fn parse_ps_output(text: &str) -> HashSet<u32> {
    text.lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|field| field.parse().ok())
        .collect()
}
