//! Logging: tracing to stderr for the operator, an append-only activity log
//! on disk, and a separate security log for events that matter after the
//! fact (enables, teardowns, watchdog alerts).

use anon_config::Paths;
use anyhow::{Context, Result};
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

fn append_only(path: &PathBuf) -> Result<File> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to open log {}", path.display()))
}

/// Install the global subscriber: stderr plus the activity log file.
pub fn init(paths: &Paths) -> Result<()> {
    let file = append_only(&paths.activity_log())?;
    let writer = Mutex::new(file).and(std::io::stderr);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(())
}

/// Append-only record of security-relevant events, one stamped line each.
#[derive(Clone, Debug)]
pub struct SecurityLog {
    path: PathBuf,
}

impl SecurityLog {
    pub fn new(paths: &Paths) -> Self {
        Self { path: paths.security_log() }
    }

    pub fn record(&self, level: &str, message: &str) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!("[{stamp}] [{level}] {message}\n");
        if let Ok(mut file) = append_only(&self.path) {
            let _ = file.write_all(line.as_bytes());
        }
    }

    pub fn alert(&self, message: &str) {
        self.record("ALERT", message);
    }

    pub fn event(&self, message: &str) {
        self.record("EVENT", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_log_appends_stamped_lines_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path());
        paths.ensure_layout().unwrap();

        let log = SecurityLog::new(&paths);
        log.event("anonymization enabled (extreme)");
        log.alert("[TOR] process not running");

        let content = std::fs::read_to_string(paths.security_log()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[EVENT] anonymization enabled (extreme)"));
        assert!(lines[1].contains("[ALERT] [TOR] process not running"));
        assert!(lines[0].starts_with('['));

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(paths.security_log()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
