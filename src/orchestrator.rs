//! The transactional pipeline.
//!
//! Enable runs a strict step order: nothing mutates before the snapshot
//! lands, Tor must be reachable before traffic is redirected into it, and
//! the resolver is only locked once the killswitch guarantees no lookup can
//! escape. Every completed step is pushed onto a compensation trail; any
//! later failure abandons forward progress and unwinds through
//! [`Orchestrator::emergency_restore`], which assumes nothing about how far
//! the pipeline got.
//!
//! `disable` is not emergency restore: it is the ordered teardown for a
//! live, healthy system, watchdog first so teardown never raises alerts.

use crate::logging::SecurityLog;
use crate::packages;
use crate::probe::Capabilities;
use crate::watchdog;
use anon_common::{cmd, KillswitchRules, Mode};
use anon_config::{Paths, Settings};
use anon_firewall::{backend_for, Killswitch};
use anon_net::{dns, mac, sysctl, NamespaceManager};
use anon_state::{RuntimeState, SaveRequest, SnapshotStore, StateStore};
use anon_tor::{torrc, ControlClient, TorSupervisor};
use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::{error, info, warn};

const RESOLV_PATH: &str = "/etc/resolv.conf";
const SERVICE_BOUND: Duration = Duration::from_secs(10);

pub struct Orchestrator {
    paths: Paths,
    settings: Settings,
    caps: Capabilities,
    state_store: StateStore,
    snapshot: SnapshotStore,
    security_log: SecurityLog,
}

impl Orchestrator {
    pub fn new(paths: Paths, settings: Settings, caps: Capabilities) -> Self {
        let state_store = StateStore::new(paths.state_file());
        let snapshot = SnapshotStore::new(paths.snapshot_dir(), caps.firewall_backend);
        let security_log = SecurityLog::new(&paths);
        Self { paths, settings, caps, state_store, snapshot, security_log }
    }

    fn supervisor(&self) -> TorSupervisor {
        TorSupervisor::new(
            &self.caps.tor_user,
            &self.settings.tor_data_dir,
            self.paths.torrc(),
            self.paths.tor_pid_file(),
        )
    }

    fn namespace(&self) -> NamespaceManager {
        NamespaceManager::new(self.caps.firewall_backend, &self.caps.egress_iface)
    }

    fn killswitch(&self) -> Result<Box<dyn Killswitch>> {
        backend_for(self.caps.firewall_backend)
    }

    pub async fn enable_extreme(&self) -> Result<()> {
        self.enable(Mode::Extreme).await
    }

    pub async fn enable_partial(&self) -> Result<()> {
        self.enable(Mode::Partial).await
    }

    async fn enable(&self, mode: Mode) -> Result<()> {
        info!(%mode, "enabling anonymized state");

        let mut tools: Vec<&str> = packages::REQUIRED_TOOLS.to_vec();
        tools.push(if self.caps.firewall_backend.is_iptables() { "iptables" } else { "nft" });
        packages::check_required(&tools, self.caps.distro_family.package_manager())?;

        // Snapshot before any mutation; a failure here aborts cleanly with
        // nothing to undo.
        let sysctl_keys = sysctl::all_keys();
        let request = SaveRequest {
            egress_iface: &self.caps.egress_iface,
            sysctl_keys: &sysctl_keys,
        };
        self.snapshot
            .save("initial", &request)
            .await
            .context("initial snapshot failed; nothing was changed")?;

        match self.run_pipeline(mode).await {
            Ok(()) => {
                self.security_log.event(&format!("anonymization enabled ({mode})"));
                info!(%mode, "anonymized state active");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "pipeline failed; running emergency restore");
                self.security_log.event(&format!("enable failed, emergency restore: {e}"));
                if let Err(restore_err) = self.emergency_restore().await {
                    error!(error = %restore_err, "emergency restore itself failed");
                }
                Err(e)
            }
        }
    }

    async fn run_pipeline(&self, mode: Mode) -> Result<()> {
        let mut trail = CompensationTrail::default();

        if mode == Mode::Extreme {
            sysctl::apply_hardening().await.context("sysctl hardening")?;
            trail.push("sysctl hardening");
        }

        sysctl::disable_ipv6().await.context("IPv6 disable")?;
        trail.push("IPv6 disable");

        let ns = self.namespace();
        ns.create().await.context("namespace create")?;
        trail.push("namespace create");

        let torrc_content = torrc::render(&self.settings.tor_data_dir);
        torrc::write(&self.paths.torrc(), &torrc_content).context("torrc write")?;
        torrc::validate(&self.paths.torrc(), &self.caps.tor_user)
            .await
            .context("torrc validation")?;

        let supervisor = self.supervisor();
        supervisor.start(&ns).await.context("tor start")?;
        trail.push("tor start");

        let control = ControlClient::new(&self.settings.tor_data_dir);
        let window = Duration::from_secs(self.settings.bootstrap_timeout_secs);
        control
            .wait_until_done(window, || supervisor.is_running())
            .await
            .context("tor bootstrap")?;
        info!("tor bootstrap complete");

        let rules = KillswitchRules::for_host(self.caps.tor_uid, &self.caps.egress_iface);
        if mode == Mode::Extreme {
            self.killswitch()?.engage(&rules).await.context("killswitch engage")?;
            trail.push("killswitch engage");
        } else {
            // Partial: resolution still goes through Tor, the filter policy
            // stays open.
            self.killswitch()?.engage_dns_only(&rules).await.context("DNS redirect engage")?;
            trail.push("DNS redirect engage");
        }

        dns::lock(Path::new(RESOLV_PATH)).await.context("DNS lock")?;
        trail.push("DNS lock");

        if mode == Mode::Extreme {
            // Link churn at the very end, so it cannot interrupt bootstrap.
            match mac::randomize(&self.caps.egress_iface).await {
                Ok(new_mac) => {
                    trail.push("MAC randomize");
                    self.security_log.event(&format!("MAC replaced with {new_mac}"));
                }
                Err(e) => warn!(error = %e, "MAC randomization failed; continuing"),
            }
        }

        std::fs::write(self.paths.proxychains_conf(), torrc::render_proxychains())
            .context("helper config write")?;

        let monitor_pid = watchdog::spawn_daemon(&self.paths).context("watchdog start")?;
        trail.push("watchdog start");

        let mut state = RuntimeState::default();
        state.anonymity_active = true;
        state.mode = mode;
        state.profile = self.settings.profile.clone();
        state.monitor_pid = Some(monitor_pid);
        state.distro_family = self.caps.distro_family;
        state.firewall_backend = self.caps.firewall_backend;
        self.state_store.save(&state).context("state write")?;

        trail.commit();
        Ok(())
    }

    /// Ordered teardown of a live system. Inverse order of acquisition:
    /// watchdog, firewall, Tor, namespace, MAC, sysctl, IPv6, DNS, and a
    /// connection-manager restart to settle the link.
    pub async fn disable(&self) -> Result<()> {
        info!("disabling anonymized state");
        let state = self.state_store.load()?;

        if let Some(pid) = state.monitor_pid {
            watchdog::stop_daemon(pid).await;
        }

        match self.killswitch() {
            Ok(engine) => engine.disengage().await.context("killswitch disengage")?,
            Err(_) => warn!("firewall backend unknown; nothing to disengage"),
        }
        self.supervisor().stop().await.context("tor stop")?;
        self.namespace().destroy().await.context("namespace destroy")?;

        if state.mode == Mode::Extreme
            && let Some(original) = self.snapshot.read_mac("initial")
        {
            if let Err(e) = mac::restore(&self.caps.egress_iface, &original).await {
                warn!(error = %e, "MAC restore failed");
            }
        }

        let sysctl_keys = sysctl::all_keys();
        if let Err(e) = self.snapshot.restore_sysctl_values("initial", &sysctl_keys).await {
            warn!(error = %e, "sysctl values not restored");
        }

        // Only flip IPv6 back on if it was on before enable.
        let prior_ipv6_disable =
            self.snapshot.read_sysctl_value("initial", "net.ipv6.conf.all.disable_ipv6");
        if prior_ipv6_disable.as_deref() != Some("1") {
            sysctl::enable_ipv6().await.context("IPv6 re-enable")?;
        }

        match self.snapshot.read_resolv_capture("initial") {
            Ok(capture) => {
                anon_state::snapshot::restore_resolv(Path::new(RESOLV_PATH), &capture)
                    .await
                    .context("resolver restore")?;
            }
            Err(e) => {
                warn!(error = %e, "no resolver capture; clearing the lock only");
                dns::clear_immutable(Path::new(RESOLV_PATH)).await;
            }
        }

        let _ = cmd::run_unchecked_with_bound(
            "systemctl",
            &["restart", "NetworkManager"],
            SERVICE_BOUND,
        )
        .await;

        let mut state = RuntimeState::default();
        state.distro_family = self.caps.distro_family;
        state.firewall_backend = self.caps.firewall_backend;
        self.state_store.save(&state)?;

        self.security_log.event("anonymization disabled (clean teardown)");
        info!("anonymized state disabled");
        Ok(())
    }

    /// Brute-force recovery from arbitrary intermediate state. Checks no
    /// preconditions, tolerates every individual failure, and falls back to
    /// safe defaults when no valid initial snapshot exists.
    pub async fn emergency_restore(&self) -> Result<()> {
        warn!("emergency restore running");
        self.security_log.event("emergency restore invoked");

        if let Ok(state) = self.state_store.load()
            && let Some(pid) = state.monitor_pid
        {
            watchdog::stop_daemon(pid).await;
        }

        if let Ok(engine) = self.killswitch() {
            let _ = engine.disengage().await;
        }
        let _ = self.supervisor().stop().await;
        let _ = self.namespace().destroy().await;

        let sysctl_keys = sysctl::all_keys();
        if self.snapshot.is_valid("initial") {
            self.snapshot
                .restore("initial", &sysctl_keys)
                .await
                .context("snapshot restore during emergency")?;
        } else {
            warn!("no valid initial snapshot; applying safe defaults");
            self.safe_defaults().await;
        }

        let mut state = RuntimeState::default();
        state.distro_family = self.caps.distro_family;
        state.firewall_backend = self.caps.firewall_backend;
        self.state_store.save(&state)?;

        self.security_log.event("emergency restore complete");
        info!("emergency restore complete");
        Ok(())
    }

    /// Last-resort defaults: our firewall objects flushed (already done
    /// above), IPv6 back on, resolver unpinned, connection manager kicked.
    async fn safe_defaults(&self) {
        if let Err(e) = sysctl::enable_ipv6().await {
            warn!(error = %e, "could not re-enable IPv6");
        }
        dns::clear_immutable(Path::new(RESOLV_PATH)).await;
        let _ = cmd::run_unchecked_with_bound(
            "systemctl",
            &["restart", "NetworkManager"],
            SERVICE_BOUND,
        )
        .await;
    }

    /// Ask the running Tor for a fresh circuit identity.
    pub async fn new_identity(&self) -> Result<()> {
        let supervisor = self.supervisor();
        if !supervisor.is_running() {
            anyhow::bail!("tor is not running; enable first");
        }
        ControlClient::new(&self.settings.tor_data_dir).new_identity().await?;
        self.security_log.event("new tor identity requested");
        info!("new identity requested");
        Ok(())
    }

    pub fn state(&self) -> Result<RuntimeState> {
        self.state_store.load()
    }

    /// Read-only exit-IP snapshot for the dashboard, best-effort.
    pub async fn exit_ip(&self) -> Option<String> {
        let proxy = format!(
            "{}:{}",
            anon_common::topology::TOR_IP,
            anon_common::topology::SOCKS_PORT
        );
        let out = cmd::run_unchecked_with_bound(
            "curl",
            &["-sS", "--max-time", "8", "--socks5-hostname", &proxy, "https://check.torproject.org/api/ip"],
            SERVICE_BOUND,
        )
        .await
        .ok()?;
        if !out.success() {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(&out.stdout).ok()?;
        Some(value.get("IP")?.as_str()?.to_string())
    }
}

/// Labels of the steps that completed, kept for the abort log so the
/// operator can see exactly how far the pipeline got.
#[derive(Default)]
struct CompensationTrail {
    completed: Vec<&'static str>,
    committed: bool,
}

impl CompensationTrail {
    fn push(&mut self, step: &'static str) {
        info!(step, "step complete");
        self.completed.push(step);
    }

    fn commit(&mut self) {
        self.committed = true;
    }
}

impl Drop for CompensationTrail {
    fn drop(&mut self) {
        if !self.committed && !self.completed.is_empty() {
            warn!(steps = ?self.completed, "pipeline aborted after these steps; unwinding");
        }
    }
}
