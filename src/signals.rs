/// Signal dispatch: per-signal ordered callback bindings plus the built-in
/// shutdown and restart handling.
///
/// SIGTERM: log, release the lock, run bound callbacks, then terminate.
/// SIGHUP: same sequence, logged as a restart. The process still exits; it
///         is up to the scheduler to start the script again.
/// Anything else: log and run bound callbacks, then return to the job.
use crate::journal::ScriptLog;
use crate::lock::LockManager;
use nix::libc;
use nix::sys::signal::Signal;
use std::collections::{BTreeMap, HashMap};

/// Result returned by a signal callback. Errors are logged and do not stop
/// the remaining callbacks.
pub type CallbackResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Callback = Box<dyn FnMut(i32) -> CallbackResult>;

/// What the caller must do after a signal has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Resume the interrupted job.
    Continue,
    /// Exit the process; cleanup has already run.
    Terminate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatcherState {
    /// No OS interception installed.
    #[default]
    Unregistered,
    /// Intercepting signals.
    Active,
    /// A terminate or restart signal has been handled.
    Terminated,
}

#[derive(Default)]
struct Bindings {
    next_index: usize,
    slots: BTreeMap<usize, Callback>,
}

#[derive(Default)]
pub struct SignalDispatcher {
    bindings: HashMap<i32, Bindings>,
    state: DispatcherState,
}

impl SignalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DispatcherState {
        self.state
    }

    pub(crate) fn activate(&mut self) {
        if self.state == DispatcherState::Unregistered {
            self.state = DispatcherState::Active;
        }
    }

    /// Append a callback for `signal` and return its index. Indices start at
    /// 0 and are never reused while the signal has any binding left.
    pub fn bind_signal<F>(&mut self, signal: i32, callback: F) -> usize
    where
        F: FnMut(i32) -> CallbackResult + 'static,
    {
        let bindings = self.bindings.entry(signal).or_default();
        let index = bindings.next_index;
        bindings.next_index += 1;
        bindings.slots.insert(index, Box::new(callback));
        index
    }

    /// Remove the callback at `index`, or every callback for `signal` when
    /// `index` is `None`. Unbinding never fails; unknown signals and indices
    /// are ignored and `true` is returned. Once a signal has no callbacks
    /// left, its next binding gets index 0 again.
    pub fn unbind_signal(&mut self, signal: i32, index: Option<usize>) -> bool {
        match index {
            None => {
                self.bindings.remove(&signal);
            }
            Some(index) => {
                if let Some(bindings) = self.bindings.get_mut(&signal) {
                    bindings.slots.remove(&index);
                    if bindings.slots.is_empty() {
                        self.bindings.remove(&signal);
                    }
                }
            }
        }
        true
    }

    /// Indices currently bound to `signal`, ascending.
    pub fn bound_indices(&self, signal: i32) -> Vec<usize> {
        self.bindings
            .get(&signal)
            .map(|b| b.slots.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Run every callback bound to `signal` in ascending index order.
    pub fn exec_signals(&mut self, signal: i32, log: &ScriptLog) {
        let Some(bindings) = self.bindings.get_mut(&signal) else {
            return;
        };
        for (index, callback) in bindings.slots.iter_mut() {
            log.write(&format!(
                "executing signal callback for signal: {signal} at index: {index}"
            ));
            if let Err(e) = callback(signal) {
                log.write(&format!(
                    "signal callback for signal: {signal} at index: {index} failed: {e}"
                ));
                tracing::warn!(signal, index, error = %e, "signal callback failed");
            }
        }
    }

    /// Built-in handling for a delivered signal.
    pub fn handle(&mut self, signal: i32, locks: &LockManager, log: &ScriptLog) -> Disposition {
        tracing::info!(signal = %signal_name(signal), "handling signal");
        match signal {
            libc::SIGHUP => {
                log.write("caught restart signal - halting script.");
                self.shut_down(signal, locks, log)
            }
            libc::SIGTERM => {
                log.write("caught termination signal - halting script.");
                self.shut_down(signal, locks, log)
            }
            _ => {
                log.write(&format!(
                    "caught unknown signal: {signal} ({})",
                    signal_name(signal)
                ));
                self.exec_signals(signal, log);
                Disposition::Continue
            }
        }
    }

    fn shut_down(&mut self, signal: i32, locks: &LockManager, log: &ScriptLog) -> Disposition {
        locks.unlock(log);
        self.exec_signals(signal, log);
        self.state = DispatcherState::Terminated;
        Disposition::Terminate
    }
}

/// Signals whose built-in handling releases the lock and ends the process.
pub fn is_shutdown_signal(signal: i32) -> bool {
    matches!(signal, libc::SIGTERM | libc::SIGHUP)
}

/// Symbolic name of a signal number, e.g. `SIGTERM`, or the number itself.
pub fn signal_name(signal: i32) -> String {
    Signal::try_from(signal)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| signal.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;
    use tempfile::TempDir;

    const ME: u32 = 77;

    fn setup() -> (TempDir, LockManager, ScriptLog) {
        let dir = tempfile::tempdir().unwrap();
        let registry = || HashSet::from([ME]);
        let locks = LockManager::with_registry(dir.path(), "job", ME, Box::new(registry));
        let log = ScriptLog::new(dir.path(), "job", ME);
        (dir, locks, log)
    }

    fn log_lines(log: &ScriptLog) -> Vec<String> {
        std::fs::read_to_string(log.current_path())
            .unwrap_or_default()
            .lines()
            .map(|l| l.split_once("} ").map(|(_, m)| m).unwrap_or(l).to_string())
            .collect()
    }

    fn recorder(
        calls: &Rc<RefCell<Vec<(usize, i32)>>>,
        tag: usize,
    ) -> impl FnMut(i32) -> CallbackResult {
        let calls = Rc::clone(calls);
        move |signal| {
            calls.borrow_mut().push((tag, signal));
            Ok(())
        }
    }

    #[test]
    fn test_bind_assigns_sequential_indices() {
        let mut dispatcher = SignalDispatcher::new();
        let calls = Rc::new(RefCell::new(Vec::new()));
        assert_eq!(dispatcher.bind_signal(libc::SIGUSR1, recorder(&calls, 0)), 0);
        assert_eq!(dispatcher.bind_signal(libc::SIGUSR1, recorder(&calls, 1)), 1);
        assert_eq!(dispatcher.bind_signal(libc::SIGUSR1, recorder(&calls, 2)), 2);
        assert_eq!(dispatcher.bind_signal(libc::SIGUSR2, recorder(&calls, 0)), 0);
    }

    #[test]
    fn test_unbind_middle_runs_remaining_in_order() {
        let (_dir, _locks, log) = setup();
        let mut dispatcher = SignalDispatcher::new();
        let calls = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..3 {
            dispatcher.bind_signal(libc::SIGUSR1, recorder(&calls, tag));
        }

        assert!(dispatcher.unbind_signal(libc::SIGUSR1, Some(1)));
        assert_eq!(dispatcher.bound_indices(libc::SIGUSR1), vec![0, 2]);

        dispatcher.exec_signals(libc::SIGUSR1, &log);
        assert_eq!(*calls.borrow(), vec![(0, libc::SIGUSR1), (2, libc::SIGUSR1)]);
        assert_eq!(
            log_lines(&log),
            vec![
                format!("executing signal callback for signal: {} at index: 0", libc::SIGUSR1),
                format!("executing signal callback for signal: {} at index: 2", libc::SIGUSR1),
            ]
        );
    }

    #[test]
    fn test_index_not_reused_after_unbind() {
        let mut dispatcher = SignalDispatcher::new();
        let calls = Rc::new(RefCell::new(Vec::new()));
        for tag in 0..3 {
            dispatcher.bind_signal(libc::SIGUSR1, recorder(&calls, tag));
        }
        dispatcher.unbind_signal(libc::SIGUSR1, Some(1));
        assert_eq!(dispatcher.bind_signal(libc::SIGUSR1, recorder(&calls, 3)), 3);
        assert_eq!(dispatcher.bound_indices(libc::SIGUSR1), vec![0, 2, 3]);
    }

    #[test]
    fn test_unbind_all_then_exec_runs_nothing() {
        let (_dir, _locks, log) = setup();
        let mut dispatcher = SignalDispatcher::new();
        let calls = Rc::new(RefCell::new(Vec::new()));
        dispatcher.bind_signal(libc::SIGUSR1, recorder(&calls, 0));
        dispatcher.bind_signal(libc::SIGUSR1, recorder(&calls, 1));

        assert!(dispatcher.unbind_signal(libc::SIGUSR1, None));
        dispatcher.exec_signals(libc::SIGUSR1, &log);
        assert!(calls.borrow().is_empty());
        assert!(log_lines(&log).is_empty());

        // Counter restarts once the signal has no bindings.
        assert_eq!(dispatcher.bind_signal(libc::SIGUSR1, recorder(&calls, 0)), 0);
    }

    #[test]
    fn test_unbinding_last_index_one_by_one_resets_counter() {
        let mut dispatcher = SignalDispatcher::new();
        let calls = Rc::new(RefCell::new(Vec::new()));
        dispatcher.bind_signal(libc::SIGUSR1, recorder(&calls, 0));
        dispatcher.bind_signal(libc::SIGUSR1, recorder(&calls, 1));

        dispatcher.unbind_signal(libc::SIGUSR1, Some(0));
        assert_eq!(dispatcher.bound_indices(libc::SIGUSR1), vec![1]);
        dispatcher.unbind_signal(libc::SIGUSR1, Some(1));
        assert!(dispatcher.bound_indices(libc::SIGUSR1).is_empty());

        assert_eq!(dispatcher.bind_signal(libc::SIGUSR1, recorder(&calls, 2)), 0);
    }

    #[test]
    fn test_unbind_unknown_is_noop_success() {
        let mut dispatcher = SignalDispatcher::new();
        assert!(dispatcher.unbind_signal(libc::SIGUSR2, None));
        assert!(dispatcher.unbind_signal(libc::SIGUSR2, Some(5)));
    }

    #[test]
    fn test_failing_callback_does_not_stop_others() {
        let (_dir, _locks, log) = setup();
        let mut dispatcher = SignalDispatcher::new();
        let calls = Rc::new(RefCell::new(Vec::new()));
        dispatcher.bind_signal(libc::SIGUSR1, |_| Err("flush failed".into()));
        dispatcher.bind_signal(libc::SIGUSR1, recorder(&calls, 1));

        dispatcher.exec_signals(libc::SIGUSR1, &log);
        assert_eq!(*calls.borrow(), vec![(1, libc::SIGUSR1)]);

        let lines = log_lines(&log);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with("at index: 0 failed: flush failed"));
    }

    #[test]
    fn test_termination_unlocks_then_runs_callbacks() {
        let (_dir, locks, log) = setup();
        assert!(locks.lock(&log));

        let mut dispatcher = SignalDispatcher::new();
        dispatcher.activate();
        let calls = Rc::new(RefCell::new(Vec::new()));
        dispatcher.bind_signal(libc::SIGTERM, recorder(&calls, 0));

        let disposition = dispatcher.handle(libc::SIGTERM, &locks, &log);
        assert_eq!(disposition, Disposition::Terminate);
        assert_eq!(dispatcher.state(), DispatcherState::Terminated);
        assert!(!locks.is_locked());
        assert_eq!(*calls.borrow(), vec![(0, libc::SIGTERM)]);

        let lines = log_lines(&log);
        assert_eq!(
            lines[1..],
            [
                "caught termination signal - halting script.".to_string(),
                format!("lock with PID:{ME} has been released."),
                format!("executing signal callback for signal: {} at index: 0", libc::SIGTERM),
            ]
        );
    }

    #[test]
    fn test_restart_signal_also_terminates() {
        let (_dir, locks, log) = setup();
        locks.lock(&log);
        let mut dispatcher = SignalDispatcher::new();

        assert_eq!(
            dispatcher.handle(libc::SIGHUP, &locks, &log),
            Disposition::Terminate
        );
        assert!(!locks.is_locked());
        assert!(log_lines(&log)
            .contains(&"caught restart signal - halting script.".to_string()));
    }

    #[test]
    fn test_unknown_signal_keeps_lock_and_continues() {
        let (_dir, locks, log) = setup();
        locks.lock(&log);
        let mut dispatcher = SignalDispatcher::new();
        dispatcher.activate();
        let calls = Rc::new(RefCell::new(Vec::new()));
        dispatcher.bind_signal(libc::SIGUSR1, recorder(&calls, 0));

        assert_eq!(
            dispatcher.handle(libc::SIGUSR1, &locks, &log),
            Disposition::Continue
        );
        assert_eq!(dispatcher.state(), DispatcherState::Active);
        assert!(locks.is_locked());
        assert_eq!(*calls.borrow(), vec![(0, libc::SIGUSR1)]);
        assert!(log_lines(&log)
            .contains(&format!("caught unknown signal: {} (SIGUSR1)", libc::SIGUSR1)));
    }

    #[test]
    fn test_shutdown_signals() {
        assert!(is_shutdown_signal(libc::SIGTERM));
        assert!(is_shutdown_signal(libc::SIGHUP));
        assert!(!is_shutdown_signal(libc::SIGUSR1));
        assert!(!is_shutdown_signal(libc::SIGINT));
    }

    #[test]
    fn test_signal_name() {
        assert_eq!(signal_name(libc::SIGTERM), "SIGTERM");
        assert_eq!(signal_name(9999), "9999");
    }
}
