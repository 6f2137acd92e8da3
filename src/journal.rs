/// Per-script event log: `<log_dir>/<script>_<YYYY-Mon-DD>.LOG`, one line per
/// event formatted as `[HH:MM:SS] {PID:<pid>} <message>`.
use chrono::{DateTime, Local, NaiveDate};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct ScriptLog {
    dir: PathBuf,
    script_name: String,
    pid: u32,
}

impl ScriptLog {
    pub fn new(dir: impl Into<PathBuf>, script_name: &str, pid: u32) -> Self {
        Self {
            dir: dir.into(),
            script_name: script_name.to_string(),
            pid,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn set_dir(&mut self, dir: PathBuf) {
        self.dir = dir;
    }

    /// Log file for the given day.
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!(
            "{}_{}.LOG",
            self.script_name,
            date.format("%Y-%b-%d")
        ))
    }

    /// Log file for today.
    pub fn current_path(&self) -> PathBuf {
        self.path_for(Local::now().date_naive())
    }

    /// Append one event line. Write failures are reported through tracing
    /// and otherwise ignored.
    pub fn write(&self, message: &str) {
        let now = Local::now();
        let path = self.path_for(now.date_naive());
        let line = self.format_line(now, message);

        tracing::debug!(script = %self.script_name, "{}", message.trim());

        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = result {
            tracing::warn!(
                error = %e,
                path = %path.display(),
                "failed to append to script log"
            );
        }
    }

    fn format_line(&self, at: DateTime<Local>, message: &str) -> String {
        format!(
            "[{}] {{PID:{}}} {}\n",
            at.format("%H:%M:%S"),
            self.pid,
            message.trim()
        )
    }
}
