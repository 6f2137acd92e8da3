/// The process-wide guard: wires the script's identity, its log, its lock and
/// the signal dispatcher together, and owns the OS signal interception.
///
/// Signals are never handled pre-emptively. The OS handler only records that
/// a signal arrived; the dispatcher runs when the job reaches a poll point,
/// i.e. calls [`ProcessGuard::poll`]. A job that computes for a long time
/// between polls delays its own shutdown (and lock release) by that long.
///
/// Dropping an installed guard gives the intercepted signals back their
/// default action, so a SIGTERM after that point kills the process again.
use crate::config::GuardConfig;
use crate::error::{require_dir, GuardError};
use crate::handle::ProcessHandle;
use crate::journal::ScriptLog;
use crate::lock::{LockManager, Owner};
use crate::registry::{ProcessRegistry, ProcessTable};
use crate::signals::{
    signal_name, CallbackResult, DispatcherState, Disposition, SignalDispatcher,
};
use signal_hook::consts::FORBIDDEN;
use signal_hook::iterator::Signals;
use signal_hook::low_level::{self, emulate_default_handler};
use signal_hook::SigId;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

/// Set while an installed guard is alive in this process.
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Default-action handlers put in place by the last dropped guard.
static RESTORED: Mutex<Vec<SigId>> = Mutex::new(Vec::new());

/// Exit status used when a terminate or restart signal ends the process.
pub const SIGNAL_EXIT_CODE: i32 = 0;

pub struct ProcessGuard {
    handle: ProcessHandle,
    log: ScriptLog,
    locks: LockManager,
    dispatcher: SignalDispatcher,
    os_signals: Option<Signals>,
    intercepted: Vec<i32>,
    installed: bool,
}

impl std::fmt::Debug for ProcessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGuard")
            .field("handle", &self.handle)
            .field("log_dir", &self.log.dir())
            .field("lock_file", &self.locks.path())
            .field("intercepted", &self.intercepted)
            .field("installed", &self.installed)
            .finish()
    }
}

impl ProcessGuard {
    /// Install the guard for this process and start intercepting the
    /// configured signals. Only one installed guard may exist at a time;
    /// while it lives, further calls fail with [`GuardError::AlreadyInstalled`].
    /// A call that fails for any other reason leaves the slot free, and so
    /// does dropping the guard.
    pub fn install(handle: ProcessHandle, config: &GuardConfig) -> Result<Self, GuardError> {
        if INSTALLED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(GuardError::AlreadyInstalled);
        }

        let result = Self::detached(handle, config).and_then(|mut guard| {
            let signals = config.intercepted_signals()?;
            guard.intercept(&signals)?;
            guard.installed = true;
            Ok(guard)
        });
        match result {
            Ok(guard) => {
                drop_restored_handlers();
                Ok(guard)
            }
            Err(e) => {
                INSTALLED.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Build a guard without claiming the process-wide slot and without
    /// intercepting any OS signal. [`poll`](Self::poll) is a no-op on it;
    /// signals can still be fed in through [`dispatch`](Self::dispatch).
    pub fn detached(handle: ProcessHandle, config: &GuardConfig) -> Result<Self, GuardError> {
        Self::with_registry(handle, config, Box::new(ProcessTable))
    }

    /// Like [`detached`](Self::detached), judging lock staleness against `registry`.
    pub fn with_registry(
        handle: ProcessHandle,
        config: &GuardConfig,
        registry: Box<dyn ProcessRegistry>,
    ) -> Result<Self, GuardError> {
        let log_dir = require_dir(&config.paths.log_dir)?;
        let lock_dir = require_dir(&config.paths.lock_dir)?;

        let log = ScriptLog::new(log_dir, handle.script_name(), handle.pid());
        let mut locks =
            LockManager::with_registry(lock_dir, handle.script_name(), handle.pid(), registry);
        locks.set_suffix(&config.paths.lock_suffix);

        Ok(Self {
            handle,
            log,
            locks,
            dispatcher: SignalDispatcher::new(),
            os_signals: None,
            intercepted: Vec::new(),
            installed: false,
        })
    }

    fn intercept(&mut self, signals: &[i32]) -> Result<(), GuardError> {
        let hook = Signals::new(Vec::<i32>::new()).map_err(|e| GuardError::SignalRegistration {
            signal: signals.first().copied().unwrap_or_default(),
            source: e,
        })?;
        self.os_signals = Some(hook);
        for &signal in signals {
            self.add_os_signal(signal)?;
        }
        self.dispatcher.activate();
        tracing::info!(
            script = %self.handle.script_name(),
            pid = self.handle.pid(),
            signals = ?self.intercepted.iter().map(|s| signal_name(*s)).collect::<Vec<_>>(),
            "process guard installed"
        );
        Ok(())
    }

    fn add_os_signal(&mut self, signal: i32) -> Result<(), GuardError> {
        let Some(hook) = self.os_signals.as_ref() else {
            return Ok(());
        };
        if self.intercepted.contains(&signal) {
            return Ok(());
        }
        if FORBIDDEN.contains(&signal) {
            return Err(GuardError::SignalRegistration {
                signal,
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "signal cannot be intercepted",
                ),
            });
        }
        hook.add_signal(signal)
            .map_err(|e| GuardError::SignalRegistration { signal, source: e })?;
        self.intercepted.push(signal);
        Ok(())
    }

    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn pid(&self) -> u32 {
        self.handle.pid()
    }

    pub fn script_name(&self) -> &str {
        self.handle.script_name()
    }

    pub fn params(&self) -> &[String] {
        self.handle.params()
    }

    /// Signals routed to the dispatcher by the OS.
    pub fn intercepted(&self) -> &[i32] {
        &self.intercepted
    }

    pub fn state(&self) -> DispatcherState {
        self.dispatcher.state()
    }

    /// Append a line to the script log.
    pub fn log(&self, message: &str) {
        self.log.write(message);
    }

    pub fn log_file(&self) -> PathBuf {
        self.log.current_path()
    }

    pub fn log_path(&self) -> &Path {
        self.log.dir()
    }

    /// Change the log directory; the previous one is kept on error.
    pub fn set_log_path(&mut self, dir: impl Into<PathBuf>) -> Result<&mut Self, GuardError> {
        let dir = require_dir(dir)?;
        self.log.set_dir(dir);
        Ok(self)
    }

    pub fn lock_path(&self) -> &Path {
        self.locks.lock_dir()
    }

    /// Change the lock directory; the previous one is kept on error.
    pub fn set_lock_path(&mut self, dir: impl Into<PathBuf>) -> Result<&mut Self, GuardError> {
        self.locks.set_lock_dir(dir)?;
        Ok(self)
    }

    pub fn lock_suffix(&self) -> &str {
        self.locks.suffix()
    }

    pub fn set_lock_suffix(&mut self, suffix: &str) -> &mut Self {
        self.locks.set_suffix(suffix);
        self
    }

    pub fn lock_file(&self) -> PathBuf {
        self.locks.path()
    }

    pub fn is_locked(&self) -> bool {
        self.locks.is_locked()
    }

    pub fn owner(&self) -> Owner {
        self.locks.owner()
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.locks.is_running(pid)
    }

    pub fn lock(&self) -> bool {
        self.locks.lock(&self.log)
    }

    pub fn unlock(&self) -> bool {
        self.locks.unlock(&self.log)
    }

    /// Bind a callback to `signal`. If the guard is intercepting OS signals
    /// and `signal` is not yet among them, it is registered first.
    pub fn bind_signal<F>(&mut self, signal: i32, callback: F) -> Result<usize, GuardError>
    where
        F: FnMut(i32) -> CallbackResult + 'static,
    {
        self.add_os_signal(signal)?;
        Ok(self.dispatcher.bind_signal(signal, callback))
    }

    pub fn unbind_signal(&mut self, signal: i32, index: Option<usize>) -> bool {
        self.dispatcher.unbind_signal(signal, index)
    }

    pub fn exec_signals(&mut self, signal: i32) {
        self.dispatcher.exec_signals(signal, &self.log);
    }

    /// Run the built-in handling for `signal` and report whether the caller
    /// should exit. Does not exit by itself.
    pub fn dispatch(&mut self, signal: i32) -> Disposition {
        self.dispatcher.handle(signal, &self.locks, &self.log)
    }

    /// Drain the signals that arrived since the last drain, without handling
    /// them. Always empty on a detached guard.
    pub fn take_pending(&mut self) -> Vec<i32> {
        match self.os_signals.as_mut() {
            Some(hook) => hook.pending().collect(),
            None => Vec::new(),
        }
    }

    /// Handle `signal` the way a poll point does: a terminate or restart
    /// signal ends the process after cleanup and callbacks have run.
    pub fn deliver(&mut self, signal: i32) {
        if self.dispatch(signal) == Disposition::Terminate {
            tracing::info!(
                signal = %signal_name(signal),
                script = %self.handle.script_name(),
                "exiting after signal"
            );
            std::process::exit(SIGNAL_EXIT_CODE);
        }
    }

    /// Poll point: handle every signal that arrived since the last poll.
    pub fn poll(&mut self) {
        for signal in self.take_pending() {
            self.deliver(signal);
        }
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        if !self.installed {
            return;
        }
        // Signals already received are still owed their handling.
        self.poll();
        restore_default_handlers(&self.intercepted);
        self.os_signals = None;
        INSTALLED.store(false, Ordering::SeqCst);
        tracing::debug!(
            script = %self.handle.script_name(),
            pid = self.handle.pid(),
            "process guard released"
        );
    }
}

/// Route each of `signals` to its default action. Unregistering the
/// interception alone would leave them silently ignored.
fn restore_default_handlers(signals: &[i32]) {
    let mut restored = RESTORED.lock().unwrap_or_else(PoisonError::into_inner);
    for &signal in signals {
        // SAFETY: the handler only calls `emulate_default_handler`, which is
        // async-signal-safe.
        let registered = unsafe {
            low_level::register(signal, move || {
                let _ = emulate_default_handler(signal);
            })
        };
        match registered {
            Ok(id) => restored.push(id),
            Err(e) => tracing::warn!(
                signal = %signal_name(signal),
                error = %e,
                "failed to restore default signal action"
            ),
        }
    }
}

/// Remove the handlers installed by [`restore_default_handlers`], once a new
/// guard intercepts signals again.
fn drop_restored_handlers() {
    let mut restored = RESTORED.lock().unwrap_or_else(PoisonError::into_inner);
    for id in restored.drain(..) {
        low_level::unregister(id);
    }
}
