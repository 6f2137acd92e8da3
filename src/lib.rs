//! Per-script singleton guard for cron-style jobs.
//!
//! A job installs a [`ProcessGuard`] once at startup, calls
//! [`ProcessGuard::lock`] before doing work, and calls [`ProcessGuard::poll`]
//! at points where it is safe to be interrupted. SIGTERM and SIGHUP arriving
//! between polls are handled at the next poll: the event is logged, the lock
//! released, bound callbacks run, and the process exits.
//!
//! ```no_run
//! use cronguard::{GuardConfig, ProcessGuard, ProcessHandle};
//!
//! let config = GuardConfig::default();
//! let mut guard = ProcessGuard::install(ProcessHandle::current()?, &config)?;
//! if !guard.lock() {
//!     return Ok(());
//! }
//! for batch in 0..10 {
//!     guard.poll();
//!     guard.log(&format!("processing batch {batch}"));
//! }
//! guard.unlock();
//! # Ok::<(), cronguard::GuardError>(())
//! ```
pub mod config;
pub mod error;
pub mod guard;
pub mod handle;
pub mod journal;
pub mod lock;
pub mod registry;
pub mod runner;
pub mod signals;
pub mod status;

pub use config::GuardConfig;
pub use error::GuardError;
pub use guard::ProcessGuard;
pub use handle::ProcessHandle;
pub use lock::{LockManager, Owner};
pub use registry::{ProcessRegistry, ProcessTable};
pub use signals::{CallbackResult, Disposition, SignalDispatcher};
