//! Atomic, symlink-aware backup of the host state anonmanager is about to
//! mutate, and the fixed-order restore path that undoes it.
//!
//! A snapshot directory is only readable once its completion marker exists;
//! the marker is the last file written into the staging directory, and the
//! staging directory becomes the snapshot in a single rename. A reader that
//! finds no marker refuses the snapshot outright.

use anon_common::cmd;
use anon_common::{Fault, FirewallBackendKind};
use anyhow::{Context, Result};
use std::fs::{self, DirBuilder};
use std::os::unix::fs::{symlink, DirBuilderExt};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const COMPLETION_MARKER: &str = ".complete";

/// Sentinel stored for a value whose capture timed out; restore skips it.
pub const UNKNOWN: &str = "UNKNOWN";

/// Services whose enabled/active states are captured and put back.
const TRACKED_SERVICES: &[&str] = &["tor", "NetworkManager", "systemd-resolved"];

/// Slow-path bound for service and connection-manager operations.
const SERVICE_BOUND: Duration = Duration::from_secs(10);

/// What to capture besides the fixed file set.
pub struct SaveRequest<'a> {
    pub egress_iface: &'a str,
    pub sysctl_keys: &'a [&'a str],
}

/// Resolver configuration as found on disk, preserving its exact shape.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResolvCapture {
    Symlink {
        absolute_target: PathBuf,
        relative_target: PathBuf,
        content: String,
    },
    File {
        content: String,
        immutable: bool,
    },
    Absent,
}

impl ResolvCapture {
    fn write_to(&self, dir: &Path) -> Result<()> {
        DirBuilder::new().recursive(true).mode(0o700).create(dir)?;
        match self {
            ResolvCapture::Symlink { absolute_target, relative_target, content } => {
                fs::write(dir.join("type"), "symlink\n")?;
                fs::write(dir.join("target_abs"), absolute_target.display().to_string())?;
                fs::write(dir.join("target_rel"), relative_target.display().to_string())?;
                fs::write(dir.join("content"), content)?;
            }
            ResolvCapture::File { content, immutable } => {
                fs::write(dir.join("type"), "file\n")?;
                fs::write(dir.join("content"), content)?;
                fs::write(dir.join("immutable"), if *immutable { "1\n" } else { "0\n" })?;
            }
            ResolvCapture::Absent => {
                fs::write(dir.join("type"), "absent\n")?;
            }
        }
        Ok(())
    }

    fn read_from(dir: &Path) -> Result<Self> {
        let kind = fs::read_to_string(dir.join("type"))
            .with_context(|| format!("unreadable resolv capture in {}", dir.display()))?;
        match kind.trim() {
            "symlink" => Ok(ResolvCapture::Symlink {
                absolute_target: PathBuf::from(fs::read_to_string(dir.join("target_abs"))?.trim()),
                relative_target: PathBuf::from(fs::read_to_string(dir.join("target_rel"))?.trim()),
                content: fs::read_to_string(dir.join("content")).unwrap_or_default(),
            }),
            "file" => Ok(ResolvCapture::File {
                content: fs::read_to_string(dir.join("content")).unwrap_or_default(),
                immutable: fs::read_to_string(dir.join("immutable"))
                    .map(|s| s.trim() == "1")
                    .unwrap_or(false),
            }),
            "absent" => Ok(ResolvCapture::Absent),
            other => anyhow::bail!("unrecognized resolv capture type {other:?}"),
        }
    }
}

/// Capture the resolver config without disturbing it.
pub async fn capture_resolv(path: &Path) -> Result<ResolvCapture> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ResolvCapture::Absent),
        Err(e) => return Err(e).with_context(|| format!("failed to stat {}", path.display())),
    };

    if meta.file_type().is_symlink() {
        let relative_target = fs::read_link(path)?;
        let absolute_target = fs::canonicalize(path).unwrap_or_else(|_| {
            path.parent().unwrap_or(Path::new("/")).join(&relative_target)
        });
        // A dangling link still restores; its content is simply empty.
        let content = fs::read_to_string(path).unwrap_or_default();
        Ok(ResolvCapture::Symlink { absolute_target, relative_target, content })
    } else {
        let content = fs::read_to_string(path)?;
        let immutable = is_immutable(path).await;
        Ok(ResolvCapture::File { content, immutable })
    }
}

/// Put the resolver config back exactly as captured.
pub async fn restore_resolv(path: &Path, capture: &ResolvCapture) -> Result<()> {
    let path_str = path.to_string_lossy();
    // The immutable flag must come off before the file can be replaced.
    let _ = cmd::run_unchecked("chattr", &["-i", &path_str]).await;

    if fs::symlink_metadata(path).is_ok() {
        fs::remove_file(path).with_context(|| format!("failed to remove {}", path.display()))?;
    }

    match capture {
        ResolvCapture::Symlink { relative_target, absolute_target, .. } => {
            // The relative target is what the distro originally placed there.
            if symlink(relative_target, path).is_err() {
                symlink(absolute_target, path)
                    .with_context(|| format!("failed to relink {}", path.display()))?;
            }
        }
        ResolvCapture::File { content, immutable } => {
            fs::write(path, content)
                .with_context(|| format!("failed to rewrite {}", path.display()))?;
            if *immutable {
                let _ = cmd::run_unchecked("chattr", &["+i", &path_str]).await;
            }
        }
        ResolvCapture::Absent => {}
    }
    Ok(())
}

async fn is_immutable(path: &Path) -> bool {
    let path_str = path.to_string_lossy();
    match cmd::run_unchecked("lsattr", &[&path_str]).await {
        Ok(out) if out.success() => out
            .stdout
            .split_whitespace()
            .next()
            .is_some_and(|flags| flags.contains('i')),
        _ => false,
    }
}

fn flatten_key(key: &str) -> String {
    key.replace('.', "_")
}

pub struct SnapshotStore {
    dir: PathBuf,
    backend: FirewallBackendKind,
    resolv_path: PathBuf,
}

impl SnapshotStore {
    pub fn new<P: Into<PathBuf>>(dir: P, backend: FirewallBackendKind) -> Self {
        Self {
            dir: dir.into(),
            backend,
            resolv_path: PathBuf::from("/etc/resolv.conf"),
        }
    }

    /// Point at a different resolver config (used off-host).
    pub fn resolv_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.resolv_path = path.into();
        self
    }

    /// A snapshot is valid iff its completion marker was written.
    pub fn is_valid(&self, name: &str) -> bool {
        self.dir.join(name).join(COMPLETION_MARKER).exists()
    }

    pub fn read_resolv_capture(&self, name: &str) -> Result<ResolvCapture> {
        ResolvCapture::read_from(&self.dir.join(name).join("resolv"))
    }

    pub fn read_interface(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.dir.join(name).join("interface"))
            .ok()
            .map(|s| s.trim().to_string())
    }

    pub fn read_mac(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.dir.join(name).join("network").join("mac"))
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Captured value of one sysctl key; `None` for missing or sentinel.
    pub fn read_sysctl_value(&self, name: &str, key: &str) -> Option<String> {
        let path = self.dir.join(name).join("sysctl").join(format!("{}.val", flatten_key(key)));
        let value = fs::read_to_string(path).ok()?.trim().to_string();
        (value != UNKNOWN).then_some(value)
    }

    /// Put just the captured sysctl values back (the ordered-disable path
    /// handles the other subsystems itself).
    pub async fn restore_sysctl_values(&self, name: &str, keys: &[&str]) -> Result<()> {
        if !self.is_valid(name) {
            return Err(Fault::SnapshotInvalid(name.to_string()).into());
        }
        self.restore_sysctl(&self.dir.join(name), keys).await;
        Ok(())
    }

    /// Capture everything into `<name>.staging`, marker last, then commit
    /// with a single rename. Saving over a valid "initial" is a no-op so a
    /// re-run can never clobber the pristine pre-enable record.
    pub async fn save(&self, name: &str, request: &SaveRequest<'_>) -> Result<()> {
        if name == "initial" && self.is_valid(name) {
            info!("valid initial snapshot already present; keeping it");
            return Ok(());
        }

        let staging = self.dir.join(format!("{name}.staging"));
        if staging.exists() {
            warn!(path = %staging.display(), "removing leftover staging directory");
            fs::remove_dir_all(&staging)?;
        }
        DirBuilder::new().recursive(true).mode(0o700).create(&staging)?;

        self.capture_firewall(&staging).await?;
        self.capture_sysctl(&staging, request.sysctl_keys).await?;
        capture_resolv(&self.resolv_path).await?.write_to(&staging.join("resolv"))?;
        self.capture_services(&staging).await?;
        self.capture_network(&staging, request.egress_iface).await?;
        fs::write(staging.join("interface"), format!("{}\n", request.egress_iface))?;

        fs::write(staging.join(COMPLETION_MARKER), "")?;

        let final_path = self.dir.join(name);
        let displaced = self.dir.join(format!("{name}.old"));
        if final_path.exists() {
            if displaced.exists() {
                fs::remove_dir_all(&displaced)?;
            }
            fs::rename(&final_path, &displaced)?;
        }
        fs::rename(&staging, &final_path)
            .with_context(|| format!("failed to commit snapshot {name}"))?;
        if displaced.exists() {
            fs::remove_dir_all(&displaced)?;
        }

        info!(name, "snapshot committed");
        Ok(())
    }

    /// Restore in fixed order: firewall, DNS, sysctl, connection, services,
    /// IPv6, connection-manager restart. Refuses an unmarked snapshot.
    pub async fn restore(&self, name: &str, sysctl_keys: &[&str]) -> Result<()> {
        if !self.is_valid(name) {
            return Err(Fault::SnapshotInvalid(name.to_string()).into());
        }
        let snap = self.dir.join(name);
        info!(name, "restoring snapshot");

        self.restore_firewall(&snap).await?;

        if snap.join("resolv").is_dir() {
            let capture = ResolvCapture::read_from(&snap.join("resolv"))?;
            restore_resolv(&self.resolv_path, &capture).await?;
        }

        self.restore_sysctl(&snap, sysctl_keys).await;
        self.restore_nm_active(&snap).await;
        self.restore_services(&snap).await;
        self.reenable_ipv6().await;
        self.restart_connection_manager().await;

        info!(name, "snapshot restored");
        Ok(())
    }

    async fn capture_firewall(&self, staging: &Path) -> Result<()> {
        match self.backend {
            FirewallBackendKind::Nftables => {
                let out = cmd::run("nft", &["list", "ruleset"]).await?;
                fs::write(staging.join("ruleset.nft"), out.stdout)?;
            }
            FirewallBackendKind::Iptables | FirewallBackendKind::IptablesNft => {
                let v4 = cmd::run("iptables-save", &[]).await?;
                fs::write(staging.join("rules.v4"), v4.stdout)?;
                let v6 = cmd::run("ip6tables-save", &[]).await?;
                fs::write(staging.join("rules.v6"), v6.stdout)?;
                match cmd::run_unchecked("ipset", &["save"]).await {
                    Ok(out) if out.success() => fs::write(staging.join("ipset.state"), out.stdout)?,
                    _ => debug!("ipset state not captured"),
                }
            }
            FirewallBackendKind::Unknown => {
                warn!("firewall backend unknown; ruleset not captured");
            }
        }
        Ok(())
    }

    async fn capture_sysctl(&self, staging: &Path, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let dir = staging.join("sysctl");
        DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;

        for &key in keys {
            let value = match cmd::run_unchecked("sysctl", &["-n", key]).await {
                Ok(out) if out.success() => out.stdout.trim().to_string(),
                Ok(_) => UNKNOWN.to_string(),
                Err(Fault::Transient { .. }) => {
                    warn!(key, "sysctl read timed out; storing sentinel");
                    UNKNOWN.to_string()
                }
                Err(e) => return Err(e.into()),
            };
            fs::write(dir.join(format!("{}.val", flatten_key(key))), format!("{value}\n"))?;
        }
        Ok(())
    }

    async fn capture_services(&self, staging: &Path) -> Result<()> {
        let dir = staging.join("systemd");
        DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;

        for &svc in TRACKED_SERVICES {
            let enabled = match cmd::run_unchecked("systemctl", &["is-enabled", svc]).await {
                Ok(out) => match out.stdout.trim() {
                    "enabled" => "enabled",
                    "disabled" => "disabled",
                    _ => "not-found",
                },
                Err(Fault::ToolMissing { .. }) => {
                    debug!("systemctl unavailable; service states not captured");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let active = match cmd::run_unchecked("systemctl", &["is-active", svc]).await {
                Ok(out) if out.stdout.trim() == "active" => "active",
                _ => "inactive",
            };
            fs::write(dir.join(format!("{svc}.enabled")), format!("{enabled}\n"))?;
            fs::write(dir.join(format!("{svc}.active")), format!("{active}\n"))?;
        }
        Ok(())
    }

    async fn capture_network(&self, staging: &Path, egress_iface: &str) -> Result<()> {
        let dir = staging.join("network");
        DirBuilder::new().recursive(true).mode(0o700).create(&dir)?;

        let sys_mac = PathBuf::from("/sys/class/net").join(egress_iface).join("address");
        if let Ok(mac) = fs::read_to_string(&sys_mac) {
            fs::write(dir.join("mac"), mac)?;
        }

        match cmd::run_unchecked("nmcli", &["-t", "-f", "UUID,DEVICE", "connection", "show", "--active"])
            .await
        {
            Ok(out) if out.success() => {
                let mut chosen = None;
                for line in out.stdout.lines() {
                    if let Some((uuid, device)) = line.split_once(':') {
                        if device == egress_iface {
                            chosen = Some(uuid.to_string());
                            break;
                        }
                        if chosen.is_none() {
                            chosen = Some(uuid.to_string());
                        }
                    }
                }
                if let Some(uuid) = chosen {
                    fs::write(dir.join("nm_active"), format!("{uuid}\n"))?;
                }
            }
            _ => debug!("no active connection-manager connection captured"),
        }
        Ok(())
    }

    async fn restore_firewall(&self, snap: &Path) -> Result<()> {
        match self.backend {
            FirewallBackendKind::Nftables => {
                let blob_path = snap.join("ruleset.nft");
                if !blob_path.exists() {
                    warn!("snapshot has no nft ruleset; leaving firewall as-is");
                    return Ok(());
                }
                let blob = fs::read_to_string(&blob_path)?;
                let payload = format!("flush ruleset\n{blob}");
                cmd::run_with_stdin("nft", &["-f", "-"], &payload).await?;
            }
            FirewallBackendKind::Iptables | FirewallBackendKind::IptablesNft => {
                if let Ok(state) = fs::read_to_string(snap.join("ipset.state")) {
                    let _ = cmd::run_unchecked("ipset", &["destroy"]).await;
                    if let Err(e) =
                        cmd::run_with_stdin("ipset", &["restore", "-exist"], &state).await
                    {
                        warn!(error = %e, "ipset state not restored");
                    }
                }
                let v4 = fs::read_to_string(snap.join("rules.v4"))?;
                cmd::run_with_stdin("iptables-restore", &[], &v4).await?;
                let v6 = fs::read_to_string(snap.join("rules.v6"))?;
                cmd::run_with_stdin("ip6tables-restore", &[], &v6).await?;
            }
            FirewallBackendKind::Unknown => {
                warn!("firewall backend unknown; ruleset not restored");
            }
        }
        Ok(())
    }

    async fn restore_sysctl(&self, snap: &Path, keys: &[&str]) {
        for &key in keys {
            let path = snap.join("sysctl").join(format!("{}.val", flatten_key(key)));
            let Ok(value) = fs::read_to_string(&path) else { continue };
            let value = value.trim();
            if value == UNKNOWN {
                debug!(key, "skipping sentinel sysctl value");
                continue;
            }
            let assignment = format!("{key}={value}");
            match cmd::run_unchecked("sysctl", &["-w", &assignment]).await {
                Ok(out) if out.success() => {}
                _ => warn!(key, value, "failed to restore sysctl value"),
            }
        }
    }

    async fn restore_nm_active(&self, snap: &Path) {
        let Ok(uuid) = fs::read_to_string(snap.join("network").join("nm_active")) else {
            return;
        };
        let uuid = uuid.trim();
        if uuid.is_empty() {
            return;
        }
        match cmd::run_unchecked_with_bound(
            "nmcli",
            &["connection", "up", "uuid", uuid],
            SERVICE_BOUND,
        )
        .await
        {
            Ok(out) if out.success() => info!(uuid, "reactivated prior connection"),
            _ => warn!(uuid, "failed to reactivate prior connection"),
        }
    }

    async fn restore_services(&self, snap: &Path) {
        for &svc in TRACKED_SERVICES {
            let dir = snap.join("systemd");
            let enabled = fs::read_to_string(dir.join(format!("{svc}.enabled"))).unwrap_or_default();
            match enabled.trim() {
                "enabled" => {
                    let _ = cmd::run_unchecked_with_bound("systemctl", &["enable", svc], SERVICE_BOUND).await;
                }
                "disabled" => {
                    let _ = cmd::run_unchecked_with_bound("systemctl", &["disable", svc], SERVICE_BOUND).await;
                }
                _ => continue,
            }
            let active = fs::read_to_string(dir.join(format!("{svc}.active"))).unwrap_or_default();
            let verb = if active.trim() == "active" { "start" } else { "stop" };
            let _ = cmd::run_unchecked_with_bound("systemctl", &[verb, svc], SERVICE_BOUND).await;
        }
    }

    async fn reenable_ipv6(&self) {
        for key in ["net.ipv6.conf.all.disable_ipv6", "net.ipv6.conf.default.disable_ipv6"] {
            let assignment = format!("{key}=0");
            let _ = cmd::run_unchecked("sysctl", &["-w", &assignment]).await;
        }
    }

    async fn restart_connection_manager(&self) {
        match cmd::run_unchecked_with_bound(
            "systemctl",
            &["restart", "NetworkManager"],
            SERVICE_BOUND,
        )
        .await
        {
            Ok(out) if out.success() => info!("connection manager restarted"),
            _ => warn!("connection manager restart failed or unavailable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> SnapshotStore {
        SnapshotStore::new(dir.join("snapshots"), FirewallBackendKind::Unknown)
            .resolv_path(dir.join("resolv.conf"))
    }

    #[test]
    fn unmarked_snapshot_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        fs::create_dir_all(dir.path().join("snapshots/initial")).unwrap();
        fs::write(dir.path().join("snapshots/initial/interface"), "eth0\n").unwrap();

        assert!(!s.is_valid("initial"));
    }

    #[tokio::test]
    async fn restore_refuses_unmarked_snapshot_before_reading_anything() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        // Partial data, no marker: must be rejected, not half-applied.
        fs::create_dir_all(dir.path().join("snapshots/initial/resolv")).unwrap();
        fs::write(dir.path().join("snapshots/initial/resolv/type"), "file\n").unwrap();

        let err = s.restore("initial", &[]).await.unwrap_err();
        let fault = err.downcast_ref::<Fault>().unwrap();
        assert!(matches!(fault, Fault::SnapshotInvalid(_)));
    }

    #[tokio::test]
    async fn save_is_a_no_op_over_a_valid_initial_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let snap = dir.path().join("snapshots/initial");
        fs::create_dir_all(&snap).unwrap();
        fs::write(snap.join(COMPLETION_MARKER), "").unwrap();
        fs::write(snap.join("interface"), "wlan0\n").unwrap();

        let request = SaveRequest { egress_iface: "eth0", sysctl_keys: &[] };
        s.save("initial", &request).await.unwrap();

        // The pre-existing record survives untouched.
        assert_eq!(s.read_interface("initial").as_deref(), Some("wlan0"));
    }

    #[tokio::test]
    async fn save_commits_marker_last_and_reaps_stale_staging() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        fs::write(dir.path().join("resolv.conf"), "nameserver 192.168.1.1\n").unwrap();

        // Debris from a prior crashed save.
        let staging = dir.path().join("snapshots/initial.staging");
        fs::create_dir_all(&staging).unwrap();
        fs::write(staging.join("junk"), "partial").unwrap();

        let request = SaveRequest { egress_iface: "eth0", sysctl_keys: &[] };
        s.save("initial", &request).await.unwrap();

        assert!(s.is_valid("initial"));
        assert!(!staging.exists());
        assert_eq!(s.read_interface("initial").as_deref(), Some("eth0"));
        let capture = s.read_resolv_capture("initial").unwrap();
        match capture {
            ResolvCapture::File { content, .. } => {
                assert_eq!(content, "nameserver 192.168.1.1\n");
            }
            other => panic!("expected file capture, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn symlinked_resolver_captures_both_targets_and_content() {
        let dir = tempfile::tempdir().unwrap();
        let real_dir = dir.path().join("run/resolve");
        fs::create_dir_all(&real_dir).unwrap();
        fs::write(real_dir.join("stub-resolv.conf"), "nameserver 127.0.0.53\n").unwrap();

        let link = dir.path().join("resolv.conf");
        symlink("run/resolve/stub-resolv.conf", &link).unwrap();

        let capture = capture_resolv(&link).await.unwrap();
        match &capture {
            ResolvCapture::Symlink { relative_target, absolute_target, content } => {
                assert_eq!(relative_target, &PathBuf::from("run/resolve/stub-resolv.conf"));
                assert!(absolute_target.ends_with("run/resolve/stub-resolv.conf"));
                assert_eq!(content, "nameserver 127.0.0.53\n");
            }
            other => panic!("expected symlink capture, got {other:?}"),
        }

        // Replace with a plain locked-down file, then restore the link.
        fs::remove_file(&link).unwrap();
        fs::write(&link, "nameserver 127.0.0.1\n").unwrap();
        restore_resolv(&link, &capture).await.unwrap();

        let meta = fs::symlink_metadata(&link).unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("run/resolve/stub-resolv.conf"));
        assert_eq!(fs::read_to_string(&link).unwrap(), "nameserver 127.0.0.53\n");
    }

    #[tokio::test]
    async fn resolv_capture_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let captures = [
            ResolvCapture::Symlink {
                absolute_target: PathBuf::from("/run/systemd/resolve/stub-resolv.conf"),
                relative_target: PathBuf::from("../run/systemd/resolve/stub-resolv.conf"),
                content: "nameserver 127.0.0.53\n".into(),
            },
            ResolvCapture::File { content: "nameserver 10.0.0.1\n".into(), immutable: true },
            ResolvCapture::Absent,
        ];
        for (i, capture) in captures.iter().enumerate() {
            let target = dir.path().join(format!("resolv-{i}"));
            capture.write_to(&target).unwrap();
            assert_eq!(&ResolvCapture::read_from(&target).unwrap(), capture);
        }
    }

    #[tokio::test]
    async fn absent_resolver_is_captured_and_restored_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolv.conf");

        let capture = capture_resolv(&path).await.unwrap();
        assert_eq!(capture, ResolvCapture::Absent);

        fs::write(&path, "nameserver 127.0.0.1\n").unwrap();
        restore_resolv(&path, &capture).await.unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn sysctl_keys_flatten_predictably() {
        assert_eq!(flatten_key("net.ipv4.tcp_timestamps"), "net_ipv4_tcp_timestamps");
        assert_eq!(flatten_key("kernel.kptr_restrict"), "kernel_kptr_restrict");
    }
}
