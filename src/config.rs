use crate::error::GuardError;
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default config file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "cronguard.toml";

/// Top-level configuration loaded from cronguard.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GuardConfig {
    pub paths: PathsConfig,
    pub signals: SignalsConfig,
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub log_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub lock_suffix: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalsConfig {
    /// Signals intercepted from the moment the guard is installed.
    pub intercept: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub poll_interval_ms: u64,
    /// How long a stopped program may take to exit after SIGTERM before its
    /// process group is sent SIGKILL.
    pub grace_period_ms: u64,
}

// --- Default implementations ---

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./logs"),
            lock_dir: PathBuf::from("./pids"),
            lock_suffix: ".PID".to_string(),
        }
    }
}

impl Default for SignalsConfig {
    fn default() -> Self {
        Self {
            intercept: vec!["SIGTERM".to_string(), "SIGHUP".to_string()],
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 200,
            grace_period_ms: 5000,
        }
    }
}

impl GuardConfig {
    /// Load config from `path`. A missing file yields the defaults; a file
    /// that exists but cannot be read or parsed is an error.
    pub fn load(path: &Path) -> Result<Self, GuardError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(GuardError::ConfigRead {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| GuardError::ConfigParse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Resolve the configured intercept list to signal numbers.
    pub fn intercepted_signals(&self) -> Result<Vec<i32>, GuardError> {
        let mut signals = Vec::with_capacity(self.signals.intercept.len());
        for name in &self.signals.intercept {
            let signal = parse_signal(name)?;
            if !signals.contains(&signal) {
                signals.push(signal);
            }
        }
        Ok(signals)
    }
}

/// Parse a signal given as `SIGTERM`, `TERM`, `term` or a bare number.
pub fn parse_signal(name: &str) -> Result<i32, GuardError> {
    let trimmed = name.trim();
    if let Ok(number) = trimmed.parse::<i32>() {
        return Signal::try_from(number)
            .map(|s| s as i32)
            .map_err(|_| GuardError::UnknownSignal {
                name: name.to_string(),
            });
    }
    let upper = trimmed.to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    Signal::from_str(&full)
        .map(|s| s as i32)
        .map_err(|_| GuardError::UnknownSignal {
            name: name.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::libc;

    #[test]
    fn test_defaults() {
        let config = GuardConfig::default();
        assert_eq!(config.paths.log_dir, PathBuf::from("./logs"));
        assert_eq!(config.paths.lock_dir, PathBuf::from("./pids"));
        assert_eq!(config.paths.lock_suffix, ".PID");
        assert_eq!(config.runner.poll_interval_ms, 200);
        assert_eq!(config.runner.grace_period_ms, 5000);
        assert_eq!(
            config.intercepted_signals().unwrap(),
            vec![libc::SIGTERM, libc::SIGHUP]
        );
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GuardConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.paths.lock_suffix, ".PID");
    }

    #[test]
    fn test_load_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cronguard.toml");
        std::fs::write(
            &path,
            "[paths]\nlock_suffix = \".lock\"\n\n[signals]\nintercept = [\"TERM\", \"USR1\"]\n",
        )
        .unwrap();

        let config = GuardConfig::load(&path).unwrap();
        assert_eq!(config.paths.lock_suffix, ".lock");
        assert_eq!(config.paths.log_dir, PathBuf::from("./logs"));
        assert_eq!(config.runner.poll_interval_ms, 200);
        assert_eq!(
            config.intercepted_signals().unwrap(),
            vec![libc::SIGTERM, libc::SIGUSR1]
        );
    }

    #[test]
    fn test_load_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cronguard.toml");
        std::fs::write(&path, "[paths\nlog_dir = 3").unwrap();
        let err = GuardConfig::load(&path).unwrap_err();
        assert!(matches!(err, GuardError::ConfigParse { .. }));
    }

    #[test]
    fn test_parse_signal_forms() {
        assert_eq!(parse_signal("SIGTERM").unwrap(), libc::SIGTERM);
        assert_eq!(parse_signal("hup").unwrap(), libc::SIGHUP);
        assert_eq!(parse_signal(" USR2 ").unwrap(), libc::SIGUSR2);
        assert_eq!(parse_signal("15").unwrap(), libc::SIGTERM);
    }

    #[test]
    fn test_parse_signal_rejects_garbage() {
        assert!(matches!(
            parse_signal("SIGNOPE"),
            Err(GuardError::UnknownSignal { .. })
        ));
        assert!(parse_signal("9999").is_err());
    }

    #[test]
    fn test_intercepted_signals_deduplicates() {
        let mut config = GuardConfig::default();
        config.signals.intercept = vec!["TERM".into(), "SIGTERM".into(), "15".into()];
        assert_eq!(config.intercepted_signals().unwrap(), vec![libc::SIGTERM]);
    }
}
