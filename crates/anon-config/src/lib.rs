//! Where everything lives on disk, and the few knobs an operator may tune.
//!
//! The topology of the isolation fabric is deliberately *not* configurable;
//! only host-specific values (egress interface, Tor account) and timing
//! bounds can be overridden through `config.toml`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

pub const DEFAULT_ROOT: &str = "/etc/anonmanager";
pub const DEFAULT_TOR_DATA_DIR: &str = "/var/lib/anonmanager/tor";

/// Operator-tunable settings, loaded from `<root>/config.toml` when present.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Named profile recorded in runtime state.
    pub profile: String,
    /// Egress interface; probed from the default route when unset.
    pub egress_iface: Option<String>,
    /// Unprivileged account Tor runs as; probed when unset.
    pub tor_user: Option<String>,
    /// Tor data directory.
    pub tor_data_dir: PathBuf,
    /// Ceiling on the Tor bootstrap wait.
    pub bootstrap_timeout_secs: u64,
    /// Watchdog tick period.
    pub watchdog_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            egress_iface: None,
            tor_user: None,
            tor_data_dir: PathBuf::from(DEFAULT_TOR_DATA_DIR),
            bootstrap_timeout_secs: 180,
            watchdog_interval_secs: 30,
        }
    }
}

/// Load settings, falling back to defaults when no config file exists.
pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<Settings> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Settings::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let settings: Settings = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(settings)
}

/// Filesystem layout rooted at the configuration directory (mode 0700).
#[derive(Clone, Debug)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn system() -> Self {
        Self { root: PathBuf::from(DEFAULT_ROOT) }
    }

    /// Re-root the layout, for tests and for the watchdog daemon which
    /// inherits its root from the spawning process.
    pub fn at<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join("anonmanager.lock")
    }

    pub fn alert_fifo(&self) -> PathBuf {
        self.root.join("alerts.fifo")
    }

    pub fn activity_log(&self) -> PathBuf {
        self.root.join("logs").join("activity.log")
    }

    pub fn security_log(&self) -> PathBuf {
        self.root.join("logs").join("security.log")
    }

    pub fn torrc(&self) -> PathBuf {
        self.root.join("torrc")
    }

    pub fn tor_pid_file(&self) -> PathBuf {
        self.root.join("tor.pid")
    }

    pub fn proxychains_conf(&self) -> PathBuf {
        self.root.join("proxychains.conf")
    }

    /// Create the root and log directory, owner-only.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [self.root.clone(), self.root.join("logs"), self.snapshot_dir()] {
            if !dir.exists() {
                DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(&dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn defaults_apply_when_no_config_exists() {
        let settings = load_settings("/definitely/not/there/config.toml").unwrap();
        assert_eq!(settings.profile, "default");
        assert_eq!(settings.bootstrap_timeout_secs, 180);
        assert_eq!(settings.watchdog_interval_secs, 30);
        assert!(settings.egress_iface.is_none());
    }

    #[test]
    fn partial_config_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "egress_iface = \"wlan0\"\nbootstrap_timeout_secs = 60\n").unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.egress_iface.as_deref(), Some("wlan0"));
        assert_eq!(settings.bootstrap_timeout_secs, 60);
        assert_eq!(settings.profile, "default");
        assert_eq!(settings.tor_data_dir, PathBuf::from(DEFAULT_TOR_DATA_DIR));
    }

    #[test]
    fn layout_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path().join("anonmanager"));
        paths.ensure_layout().unwrap();

        let mode = std::fs::metadata(paths.root()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert!(paths.snapshot_dir().is_dir());
    }
}
