/// Structured diagnostics and the access-log sink (component I, ambient).
///
/// Two separate channels by design: `log`-crate diagnostics for operators
/// tailing stderr/a log file, and a stable line-oriented access log external
/// tooling may parse — mirroring the source's `logger_log` vs `log_access`
/// split.
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::LevelFilter;

/// Initializes the `log` facade via `env_logger`. `-v` raises the default
/// level from `info` to `debug`.
pub fn init(verbose: bool) {
    let level = if verbose { LevelFilter::Debug } else { LevelFilter::Info };
    env_logger::Builder::new().filter_level(level).format_timestamp_millis().init();
}

/// Appends `[timestamp] [ACCESS] user='...' status='...' details='...'`
/// lines, matching the source's `log_access` format exactly.
pub struct AccessLog {
    path: PathBuf,
}

impl AccessLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn record(&self, user: Option<&str>, status: &str, details: &str) {
        self.write_line(user, status, details);
    }

    fn write_line(&self, user: Option<&str>, status: &str, details: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let user = user.unwrap_or("-");
        let line = format!("[{timestamp}] [ACCESS] user='{user}' status='{status}' details='{details}'\n");

        match self.open() {
            Ok(mut file) => {
                if let Err(err) = file.write_all(line.as_bytes()) {
                    log::warn!("could not write access log: {err}");
                }
            }
            Err(err) => {
                log::warn!("could not open access log {}: {err}", self.path.display());
            }
        }
    }

    fn open(&self) -> std::io::Result<std::fs::File> {
        OpenOptions::new().create(true).append(true).open(&self.path)
    }
}

impl AsRef<Path> for AccessLog {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}
