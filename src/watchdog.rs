//! Watchdog: a detached re-invocation of this binary that asserts the
//! anonymized state every tick and reports violations — never repairs them.
//! Repair is policy and belongs to the orchestrator.
//!
//! Alerts leave the process on two paths: the security log, and a named
//! FIFO that an external consumer may read. FIFO writes are non-blocking;
//! with no reader attached the alert is dropped rather than ever stalling
//! a tick.

use crate::logging::SecurityLog;
use anon_common::{AlertCategory, FirewallBackendKind, WatchdogAlert};
use anon_config::{Paths, Settings};
use anon_firewall::backend_for;
use anon_net::{dns, sysctl, NamespaceManager};
use anon_state::{lock::pid_alive, StateStore};
use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{mkfifo, Pid};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{info, warn};

/// Hidden flag under which the daemon loop runs.
pub const DAEMON_FLAG: &str = "--watchdog-daemon";

/// Create the alert FIFO if it does not exist yet, mode 0600.
pub fn ensure_fifo(path: &Path) -> Result<()> {
    match mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::EEXIST) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to create fifo {}", path.display())),
    }
}

/// Non-blocking push: if nobody is reading, the open fails with ENXIO and
/// the alert is dropped.
pub fn push_alert(path: &Path, alert: &WatchdogAlert) {
    let opened = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path);
    if let Ok(mut fifo) = opened {
        let _ = fifo.write_all(format!("{alert}\n").as_bytes());
    }
}

/// Spawn the detached daemon, returning its PID for the state file.
pub fn spawn_daemon(paths: &Paths) -> Result<i32> {
    let exe = std::env::current_exe().context("cannot locate own binary")?;
    let child = Command::new(exe)
        .arg(DAEMON_FLAG)
        .arg("--config-root")
        .arg(paths.root())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn watchdog daemon")?;
    let pid = child.id() as i32;
    info!(pid, "watchdog started");
    Ok(pid)
}

/// TERM the daemon; escalate if it lingers.
pub async fn stop_daemon(pid: i32) {
    if !pid_alive(pid) {
        return;
    }
    let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
    for _ in 0..10 {
        if !pid_alive(pid) {
            info!(pid, "watchdog stopped");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    warn!(pid, "watchdog ignored TERM; killing");
    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
}

/// The daemon loop. Runs until terminated by the orchestrator.
pub async fn run_daemon(paths: Paths, settings: Settings) -> Result<()> {
    let security_log = SecurityLog::new(&paths);
    let store = StateStore::new(paths.state_file());
    ensure_fifo(&paths.alert_fifo())?;

    let mut ticker = tokio::time::interval(Duration::from_secs(settings.watchdog_interval_secs));
    info!(period = settings.watchdog_interval_secs, "watchdog loop running");

    loop {
        ticker.tick().await;

        let state = match store.load() {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "state file unreadable; skipping tick");
                continue;
            }
        };
        if !state.anonymity_active {
            continue;
        }

        for alert in collect_alerts(&paths, state.firewall_backend).await {
            warn!(%alert, "invariant violated");
            security_log.alert(&alert.to_string());
            push_alert(&paths.alert_fifo(), &alert);
        }
    }
}

/// Observe-only checks; nothing here mutates system state.
pub async fn collect_alerts(
    paths: &Paths,
    backend: FirewallBackendKind,
) -> Vec<WatchdogAlert> {
    let mut alerts = Vec::new();

    let tor_pid = std::fs::read_to_string(paths.tor_pid_file())
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok());
    match tor_pid {
        Some(pid) if pid_alive(pid) => {}
        Some(pid) => {
            alerts.push(WatchdogAlert::new(
                AlertCategory::Tor,
                format!("tor pid {pid} is no longer running"),
            ));
        }
        None => {
            alerts.push(WatchdogAlert::new(AlertCategory::Tor, "tor pid file missing"));
        }
    }

    if let Ok(engine) = backend_for(backend) {
        if !engine.is_active().await {
            alerts.push(WatchdogAlert::new(
                AlertCategory::Firewall,
                "killswitch chain/table is gone",
            ));
        }
    }

    if !dns::points_at_loopback(Path::new("/etc/resolv.conf")) {
        alerts.push(WatchdogAlert::new(
            AlertCategory::Dns,
            "resolver no longer points at loopback",
        ));
    }

    if sysctl::read_proc("net.ipv6.conf.all.disable_ipv6").as_deref() != Some("1") {
        alerts.push(WatchdogAlert::new(AlertCategory::Ipv6, "IPv6 stack re-enabled"));
    }

    if !NamespaceManager::exists() {
        alerts.push(WatchdogAlert::new(AlertCategory::Namespace, "namespace has vanished"));
    }

    alerts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_is_created_owner_only_and_push_without_reader_drops() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("alerts.fifo");
        ensure_fifo(&fifo).unwrap();
        ensure_fifo(&fifo).unwrap(); // idempotent

        use std::os::unix::fs::{FileTypeExt, PermissionsExt};
        let meta = std::fs::metadata(&fifo).unwrap();
        assert!(meta.file_type().is_fifo());
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);

        // No reader attached: the write must neither block nor panic.
        let alert = WatchdogAlert::new(AlertCategory::Dns, "test");
        push_alert(&fifo, &alert);
    }

    #[tokio::test]
    async fn checks_observe_without_creating_or_mutating_anything() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::at(dir.path());

        let alerts = collect_alerts(&paths, FirewallBackendKind::Unknown).await;
        // Nothing is running here, so at minimum the tor check fires.
        assert!(alerts.iter().any(|a| a.category == AlertCategory::Tor));

        // The configuration root is untouched by a tick's worth of checks.
        assert!(!dir.path().join("tor.pid").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn push_delivers_when_a_reader_is_attached() {
        use std::io::Read as _;

        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("alerts.fifo");
        ensure_fifo(&fifo).unwrap();

        // Reader end keeps the fifo connected while we push.
        let mut reader = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&fifo)
            .unwrap();
        let alert = WatchdogAlert::new(AlertCategory::Firewall, "killswitch chain/table is gone");
        push_alert(&fifo, &alert);

        let mut buf = [0u8; 256];
        let n = reader.read(&mut buf).unwrap();
        let line = std::str::from_utf8(&buf[..n]).unwrap();
        assert_eq!(line, "[FIREWALL] killswitch chain/table is gone\n");
    }
}
