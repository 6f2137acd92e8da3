use crate::error::GuardError;
use std::path::Path;

/// Identity of the running script: its pid, the base name of the program
/// it was invoked as, and the remaining invocation arguments.
#[derive(Debug, PartialEq, Eq)]
pub struct ProcessHandle {
    pid: u32,
    script_name: String,
    params: Vec<String>,
}

impl ProcessHandle {
    /// Build a handle from an explicit pid and argument list. The first
    /// argument is the program name; only its base name is kept.
    pub fn from_args<I, S>(pid: u32, args: I) -> Result<Self, GuardError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args = args.into_iter().map(Into::into);
        let program = args.next().ok_or(GuardError::MissingProgramName)?;
        let script_name = Path::new(&program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .ok_or(GuardError::MissingProgramName)?;
        Ok(Self {
            pid,
            script_name,
            params: args.collect(),
        })
    }

    /// Handle for the current process, from its pid and `std::env::args()`.
    pub fn current() -> Result<Self, GuardError> {
        Self::from_args(std::process::id(), std::env::args())
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn script_name(&self) -> &str {
        &self.script_name
    }

    pub fn params(&self) -> &[String] {
        &self.params
    }
}
