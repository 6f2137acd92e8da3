/// Supervised execution of an external program under the guard: take the
/// lock, spawn the program in its own process group, poll for signals while
/// it runs, release the lock once it exits.
///
/// The lock is never released while the program's process group is alive:
/// a terminate or restart signal first stops the group, escalating to SIGKILL
/// after the grace period, and only then reaches the guard's own handling.
use crate::error::GuardError;
use crate::guard::ProcessGuard;
use crate::signals::{is_shutdown_signal, signal_name};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};

/// How often a stopping program is checked for exit.
const STOP_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Timing of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Supervision {
    /// Time between poll points while the program runs.
    pub poll_interval: Duration,
    /// Time a stopped program gets between SIGTERM and SIGKILL.
    pub grace_period: Duration,
}

/// Result of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another live process holds the lock; nothing was run.
    Busy,
    /// The program ran to completion.
    Exited { code: i32 },
}

/// Exit code for a program status: its own code, or 128 + signal number
/// when it was killed.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Run `program` with `args` under `guard`.
///
/// While the program runs, a terminate or restart signal delivered to this
/// process stops the program's process group (see [`stop_program`]); the
/// guard then releases the lock, runs bound callbacks and exits. Other
/// signals go to the guard's handling and the run continues.
pub fn run_supervised(
    guard: &mut ProcessGuard,
    program: &str,
    args: &[String],
    timing: Supervision,
) -> Result<RunOutcome, GuardError> {
    if !guard.lock() {
        return Ok(RunOutcome::Busy);
    }

    let mut child = match Command::new(program).args(args).process_group(0).spawn() {
        Ok(child) => child,
        Err(e) => {
            guard.log(&format!("failed to start {program}: {e}"));
            guard.unlock();
            return Err(GuardError::Spawn {
                program: program.to_string(),
                source: e,
            });
        }
    };
    let child_pid = child.id();
    guard.log(&format!("started {program} as PID:{child_pid}"));
    tracing::info!(program, pid = child_pid, "supervised program started");

    let start = Instant::now();
    let status = loop {
        for signal in guard.take_pending() {
            if is_shutdown_signal(signal) {
                guard.log(&format!(
                    "received {}, stopping PID:{child_pid}",
                    signal_name(signal)
                ));
                stop_program(guard, &mut child, timing.grace_period);
            }
            guard.deliver(signal);
        }
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => std::thread::sleep(timing.poll_interval),
            Err(e) => {
                guard.log(&format!("lost track of PID:{child_pid}: {e}"));
                guard.unlock();
                return Err(GuardError::Wait { source: e });
            }
        }
    };

    let code = exit_code(status);
    guard.log(&format!("{program} exited with {status}"));
    tracing::info!(
        program,
        code,
        duration_secs = start.elapsed().as_secs(),
        "supervised program finished"
    );
    guard.unlock();
    Ok(RunOutcome::Exited { code })
}

/// Stop a program spawned in its own process group: SIGTERM the group and
/// wait up to `grace_period` for the program to exit. A program still running
/// after that is killed with SIGKILL. Either way the rest of the group is then
/// sent SIGKILL, and the program has been reaped when this returns.
pub fn stop_program(guard: &ProcessGuard, child: &mut Child, grace_period: Duration) {
    let pid = child.id();
    let group = Pid::from_raw(pid as i32);
    if let Err(e) = killpg(group, Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "failed to signal process group");
    }

    let deadline = Instant::now() + grace_period;
    let exited = loop {
        match child.try_wait() {
            Ok(Some(_)) => break true,
            Ok(None) if Instant::now() >= deadline => break false,
            Ok(None) => std::thread::sleep(STOP_CHECK_INTERVAL),
            Err(e) => {
                tracing::warn!(pid, error = %e, "failed to poll stopping program");
                break false;
            }
        }
    };

    if exited {
        guard.log(&format!("PID:{pid} stopped."));
    } else {
        guard.log(&format!(
            "PID:{pid} still running after {}ms, sending SIGKILL.",
            grace_period.as_millis()
        ));
        tracing::warn!(pid, grace_ms = grace_period.as_millis() as u64, "killing process group");
    }
    // Leftover group members are not allowed to outlive the lock.
    if let Err(e) = killpg(group, Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "process group already empty");
    }
    if !exited {
        if let Err(e) = child.wait() {
            tracing::warn!(pid, error = %e, "failed to reap killed program");
        }
    }
}
