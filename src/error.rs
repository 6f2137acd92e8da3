use std::path::PathBuf;

/// Errors surfaced by the guard. Expected outcomes such as lock contention
/// or a stale lock are not errors; they are reported through return values
/// and the script log.
#[derive(Debug)]
pub enum GuardError {
    /// A configured log or lock path is not an existing directory.
    NotADirectory { path: PathBuf },
    /// A guard was already installed in this process.
    AlreadyInstalled,
    /// The invocation argument list was empty.
    MissingProgramName,
    /// A signal name in the configuration could not be parsed.
    UnknownSignal { name: String },
    /// The OS refused to intercept a signal.
    SignalRegistration {
        signal: i32,
        source: std::io::Error,
    },
    /// Failed to read the configuration file.
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The configuration file is not valid TOML for `GuardConfig`.
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },
    /// Failed to spawn the supervised program.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// Failed while waiting on the supervised program.
    Wait { source: std::io::Error },
}

impl std::fmt::Display for GuardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GuardError::NotADirectory { path } => {
                write!(f, "{} does not exist or is not a directory", path.display())
            }
            GuardError::AlreadyInstalled => {
                write!(f, "a process guard is already installed in this process")
            }
            GuardError::MissingProgramName => {
                write!(f, "invocation arguments are empty, no program name to derive")
            }
            GuardError::UnknownSignal { name } => write!(f, "unknown signal name: {name}"),
            GuardError::SignalRegistration { signal, source } => {
                write!(f, "failed to intercept signal {signal}: {source}")
            }
            GuardError::ConfigRead { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            GuardError::ConfigParse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            GuardError::Spawn { program, source } => {
                write!(f, "failed to spawn {program}: {source}")
            }
            GuardError::Wait { source } => {
                write!(f, "failed to wait on supervised program: {source}")
            }
        }
    }
}

impl std::error::Error for GuardError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GuardError::SignalRegistration { source, .. } => Some(source),
            GuardError::ConfigRead { source, .. } => Some(source),
            GuardError::ConfigParse { source, .. } => Some(source),
            GuardError::Spawn { source, .. } => Some(source),
            GuardError::Wait { source } => Some(source),
            GuardError::NotADirectory { .. }
            | GuardError::AlreadyInstalled
            | GuardError::MissingProgramName
            | GuardError::UnknownSignal { .. } => None,
        }
    }
}

/// Check that `path` names an existing directory.
pub(crate) fn require_dir(path: impl Into<PathBuf>) -> Result<PathBuf, GuardError> {
    let path = path.into();
    if path.is_dir() {
        Ok(path)
    } else {
        Err(GuardError::NotADirectory { path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_dir_accepts_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = require_dir(dir.path()).unwrap();
        assert_eq!(path, dir.path());
    }

    #[test]
    fn test_require_dir_rejects_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = require_dir(&missing).unwrap_err();
        assert!(matches!(err, GuardError::NotADirectory { ref path } if *path == missing));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_require_dir_rejects_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain.txt");
        std::fs::write(&file, "x").unwrap();
        assert!(matches!(
            require_dir(&file),
            Err(GuardError::NotADirectory { .. })
        ));
    }

    #[test]
    fn test_signal_registration_exposes_source() {
        use std::error::Error;
        let err = GuardError::SignalRegistration {
            signal: 9,
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "forbidden"),
        };
        assert!(err.source().is_some());
        assert!(err.to_string().contains("signal 9"));
    }
}
