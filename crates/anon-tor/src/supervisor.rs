//! Lifecycle of the in-namespace Tor process.

use anon_common::cmd;
use anon_net::NamespaceManager;
use anyhow::{bail, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{chown, Pid, User};
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const SERVICE_BOUND: Duration = Duration::from_secs(10);
const LAUNCH_BOUND: Duration = Duration::from_secs(15);
const STOP_GRACE: Duration = Duration::from_secs(5);

pub struct TorSupervisor {
    tor_user: String,
    data_dir: PathBuf,
    torrc_path: PathBuf,
    /// Protected record of the managed process, owner-only.
    pid_file: PathBuf,
}

impl TorSupervisor {
    pub fn new(
        tor_user: impl Into<String>,
        data_dir: impl Into<PathBuf>,
        torrc_path: impl Into<PathBuf>,
        pid_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tor_user: tor_user.into(),
            data_dir: data_dir.into(),
            torrc_path: torrc_path.into(),
            pid_file: pid_file.into(),
        }
    }

    /// Launch Tor inside the namespace as the unprivileged user.
    pub async fn start(&self, ns: &NamespaceManager) -> Result<()> {
        self.stop().await?;

        // A system-managed Tor would contend for the ports.
        let _ = cmd::run_unchecked_with_bound("systemctl", &["stop", "tor"], SERVICE_BOUND).await;
        let _ = cmd::run_unchecked_with_bound("systemctl", &["stop", "tor@default"], SERVICE_BOUND)
            .await;

        self.prepare_data_dir()?;

        let stale_lock = self.data_dir.join("lock");
        if stale_lock.exists() {
            debug!("removing stale data directory lock");
            fs::remove_file(&stale_lock).ok();
        }

        let torrc = self.torrc_path.to_string_lossy().into_owned();
        ns.exec_bounded(
            &["runuser", "-u", &self.tor_user, "--", "tor", "-f", &torrc],
            LAUNCH_BOUND,
        )
        .await
        .context("failed to launch tor inside the namespace")?;

        sleep(Duration::from_secs(2)).await;
        let pid = self.read_daemon_pid()?;
        if !pid_alive(pid) {
            bail!("tor exited within its liveness window");
        }

        self.write_pid_file(pid)?;
        info!(pid, "tor running inside the namespace");
        Ok(())
    }

    /// TERM the recorded process and any stray `tor` of the Tor user, give
    /// them a grace period, then KILL survivors.
    pub async fn stop(&self) -> Result<()> {
        let recorded = self.recorded_pid();

        if let Some(pid) = recorded {
            debug!(pid, "terminating managed tor");
            let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
        }
        let _ = cmd::run_unchecked("pkill", &["-TERM", "-u", &self.tor_user, "-x", "tor"]).await;

        if let Some(pid) = recorded {
            let deadline = tokio::time::Instant::now() + STOP_GRACE;
            while pid_alive(pid) && tokio::time::Instant::now() < deadline {
                sleep(Duration::from_millis(250)).await;
            }
            if pid_alive(pid) {
                warn!(pid, "tor survived its grace period; killing");
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
        let _ = cmd::run_unchecked("pkill", &["-KILL", "-u", &self.tor_user, "-x", "tor"]).await;

        fs::remove_file(&self.pid_file).ok();
        Ok(())
    }

    pub async fn restart(&self, ns: &NamespaceManager) -> Result<()> {
        self.stop().await?;
        self.start(ns).await
    }

    /// Recorded PID still answers signal 0.
    pub fn is_running(&self) -> bool {
        self.recorded_pid().is_some_and(pid_alive)
    }

    pub fn recorded_pid(&self) -> Option<i32> {
        fs::read_to_string(&self.pid_file)
            .ok()?
            .trim()
            .parse()
            .ok()
            .filter(|pid| *pid > 1)
    }

    fn prepare_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&self.data_dir)
                .with_context(|| format!("failed to create {}", self.data_dir.display()))?;
        }

        let user = User::from_name(&self.tor_user)
            .context("failed to look up tor user")?
            .with_context(|| format!("tor user '{}' does not exist", self.tor_user))?;
        chown(&self.data_dir, Some(user.uid), Some(user.gid))
            .with_context(|| format!("failed to chown {}", self.data_dir.display()))?;

        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&self.data_dir, fs::Permissions::from_mode(0o700))?;
        Ok(())
    }

    fn read_daemon_pid(&self) -> Result<i32> {
        let path = self.data_dir.join("tor.pid");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("tor wrote no pid file at {}", path.display()))?;
        let pid: i32 = content.trim().parse().context("unparsable tor pid file")?;
        if pid <= 1 {
            bail!("implausible tor pid {pid}");
        }
        Ok(pid)
    }

    fn write_pid_file(&self, pid: i32) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.pid_file)
            .with_context(|| format!("failed to write {}", self.pid_file.display()))?;
        writeln!(file, "{pid}")?;
        Ok(())
    }
}

fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(dir: &std::path::Path) -> TorSupervisor {
        TorSupervisor::new(
            "debian-tor",
            dir.join("data"),
            dir.join("torrc"),
            dir.join("tor.pid"),
        )
    }

    #[test]
    fn missing_pid_file_means_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        assert!(!sup.is_running());
        assert_eq!(sup.recorded_pid(), None);
    }

    #[test]
    fn garbage_pid_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        fs::write(dir.path().join("tor.pid"), "$(true)\n").unwrap();
        assert_eq!(sup.recorded_pid(), None);

        fs::write(dir.path().join("tor.pid"), "0\n").unwrap();
        assert_eq!(sup.recorded_pid(), None);
    }

    #[test]
    fn own_pid_reads_back_as_running() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path());
        sup.write_pid_file(std::process::id() as i32).unwrap();
        assert!(sup.is_running());

        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(dir.path().join("tor.pid")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn daemon_pid_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("data")).unwrap();
        let sup = supervisor(dir.path());

        fs::write(dir.path().join("data/tor.pid"), "not-a-pid\n").unwrap();
        assert!(sup.read_daemon_pid().is_err());

        fs::write(dir.path().join("data/tor.pid"), "4242\n").unwrap();
        assert_eq!(sup.read_daemon_pid().unwrap(), 4242);
    }
}
