//! Persisted cross-invocation state.
//!
//! The file is plain `key=value` lines. Loading is defensive: unknown keys
//! are ignored, and a value that fails validation leaves the in-memory
//! default untouched, so a corrupted or tampered file can never inject
//! anything into the process.

use anon_common::{DistroFamily, FirewallBackendKind, Mode};
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeState {
    pub anonymity_active: bool,
    pub mode: Mode,
    pub profile: String,
    pub monitor_pid: Option<i32>,
    pub distro_family: DistroFamily,
    pub firewall_backend: FirewallBackendKind,
    pub version: String,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            anonymity_active: false,
            mode: Mode::None,
            profile: "default".to_string(),
            monitor_pid: None,
            distro_family: DistroFamily::Unknown,
            firewall_backend: FirewallBackendKind::Unknown,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state, starting from defaults and only accepting valid values.
    pub fn load(&self) -> Result<RuntimeState> {
        let mut state = RuntimeState::default();
        if !self.path.exists() {
            return Ok(state);
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            apply_entry(&mut state, key.trim(), value.trim());
        }

        Ok(state)
    }

    /// Atomic write: temp file in the same directory, 0600, then rename.
    pub fn save(&self, state: &RuntimeState) -> Result<()> {
        let mut content = String::new();
        writeln!(content, "ANONYMITY_ACTIVE={}", state.anonymity_active)?;
        writeln!(content, "CURRENT_MODE={}", state.mode)?;
        writeln!(content, "PROFILE={}", state.profile)?;
        writeln!(content, "MONITOR_PID={}", state.monitor_pid.map_or(String::new(), |p| p.to_string()))?;
        writeln!(content, "DISTRO_FAMILY={}", state.distro_family)?;
        writeln!(content, "FIREWALL_BACKEND={}", state.firewall_backend)?;
        writeln!(content, "VERSION={}", state.version)?;

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)
                .with_context(|| format!("failed to open {}", tmp.display()))?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to commit {}", self.path.display()))?;
        Ok(())
    }
}

fn apply_entry(state: &mut RuntimeState, key: &str, value: &str) {
    match key {
        "ANONYMITY_ACTIVE" => match value {
            "true" => state.anonymity_active = true,
            "false" => state.anonymity_active = false,
            _ => warn!(key, value, "ignoring invalid state entry"),
        },
        "CURRENT_MODE" => match value.parse::<Mode>() {
            Ok(mode) => state.mode = mode,
            Err(()) => warn!(key, value, "ignoring invalid state entry"),
        },
        "PROFILE" => {
            if is_valid_profile(value) {
                state.profile = value.to_string();
            } else {
                warn!(key, value, "ignoring invalid state entry");
            }
        }
        "MONITOR_PID" => {
            if value.is_empty() {
                state.monitor_pid = None;
            } else if let Ok(pid) = value.parse::<i32>()
                && pid > 1
            {
                state.monitor_pid = Some(pid);
            } else {
                warn!(key, value, "ignoring invalid state entry");
            }
        }
        "DISTRO_FAMILY" => match value.parse::<DistroFamily>() {
            Ok(family) => state.distro_family = family,
            Err(()) => warn!(key, value, "ignoring invalid state entry"),
        },
        "FIREWALL_BACKEND" => match value.parse::<FirewallBackendKind>() {
            Ok(backend) => state.firewall_backend = backend,
            Err(()) => warn!(key, value, "ignoring invalid state entry"),
        },
        "VERSION" => {
            if is_valid_version(value) {
                state.version = value.to_string();
            } else {
                warn!(key, value, "ignoring invalid state entry");
            }
        }
        _ => {}
    }
}

fn is_valid_profile(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 32
        && value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
}

fn is_valid_version(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 32
        && value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}
