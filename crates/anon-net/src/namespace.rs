//! The isolation fabric: one named network namespace, a veth pair bridging
//! it to the host, and source-NAT so the namespace can reach the Internet.
//!
//! Creation is idempotent (a pre-existing namespace of the same name is torn
//! down first) and self-unwinding: a failure mid-build removes whatever was
//! already set up before the error is returned.

use anon_common::cmd;
use anon_common::topology::{HOST_IP, NS_NAME, PREFIX_LEN, SUBNET, TOR_IP, VETH_HOST, VETH_NS};
use anon_common::FirewallBackendKind;
use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// NAT objects are named so destroy can find them without guessing.
const NAT_TABLE: &str = "anonmanager_nat";

pub struct NamespaceManager {
    backend: FirewallBackendKind,
    egress_iface: String,
}

impl NamespaceManager {
    pub fn new(backend: FirewallBackendKind, egress_iface: impl Into<String>) -> Self {
        Self { backend, egress_iface: egress_iface.into() }
    }

    /// Whether the namespace is currently registered with the kernel.
    pub fn exists() -> bool {
        Path::new("/var/run/netns").join(NS_NAME).exists()
            || Path::new("/run/netns").join(NS_NAME).exists()
    }

    pub async fn create(&self) -> Result<()> {
        cmd::checked_name(&self.egress_iface)?;
        self.destroy().await?;

        if let Err(e) = self.build().await {
            warn!(error = %e, "namespace build failed; unwinding");
            self.unwind().await;
            return Err(e).context("failed to build network namespace");
        }
        info!(ns = NS_NAME, "namespace ready");
        Ok(())
    }

    async fn build(&self) -> Result<()> {
        let tor_cidr = format!("{TOR_IP}/{PREFIX_LEN}");
        let host_cidr = format!("{HOST_IP}/{PREFIX_LEN}");
        let host_ip = HOST_IP.to_string();

        cmd::run("ip", &["netns", "add", NS_NAME]).await?;
        cmd::run("ip", &["link", "add", VETH_HOST, "type", "veth", "peer", "name", VETH_NS])
            .await?;
        cmd::run("ip", &["link", "set", VETH_NS, "netns", NS_NAME]).await?;

        cmd::run("ip", &["addr", "add", &host_cidr, "dev", VETH_HOST]).await?;
        cmd::run("ip", &["link", "set", VETH_HOST, "up"]).await?;

        self.exec(&["ip", "addr", "add", &tor_cidr, "dev", VETH_NS]).await?;
        self.exec(&["ip", "link", "set", VETH_NS, "up"]).await?;
        self.exec(&["ip", "link", "set", "lo", "up"]).await?;
        self.exec(&["ip", "route", "add", "default", "via", &host_ip]).await?;

        cmd::run("sysctl", &["-w", "net.ipv4.ip_forward=1"]).await?;
        self.install_nat().await?;
        Ok(())
    }

    pub async fn destroy(&self) -> Result<()> {
        self.remove_nat().await;
        self.kill_residents().await;

        // Deleting the namespace takes its veth end with it; the host side
        // may survive if the pair was never split.
        let _ = cmd::run_unchecked("ip", &["netns", "del", NS_NAME]).await;
        let _ = cmd::run_unchecked("ip", &["link", "del", VETH_HOST]).await;
        Ok(())
    }

    /// Run a command with the namespace as its network context.
    pub async fn exec(&self, args: &[&str]) -> Result<cmd::Output> {
        let mut full = vec!["netns", "exec", NS_NAME];
        full.extend_from_slice(args);
        Ok(cmd::run("ip", &full).await?)
    }

    /// Like [`Self::exec`] but with a caller-chosen bound, for commands that
    /// legitimately outlive the default kernel-call bound.
    pub async fn exec_bounded(
        &self,
        args: &[&str],
        bound: std::time::Duration,
    ) -> Result<cmd::Output> {
        let mut full = vec!["netns", "exec", NS_NAME];
        full.extend_from_slice(args);
        Ok(cmd::run_with_bound("ip", &full, bound).await?)
    }

    async fn unwind(&self) {
        let _ = cmd::run_unchecked("ip", &["link", "del", VETH_HOST]).await;
        let _ = cmd::run_unchecked("ip", &["netns", "del", NS_NAME]).await;
    }

    /// TERM everything still resident, give it a second, then KILL.
    async fn kill_residents(&self) {
        let Ok(out) = cmd::run_unchecked("ip", &["netns", "pids", NS_NAME]).await else {
            return;
        };
        if !out.success() {
            return;
        }
        let pids: Vec<i32> = out.stdout.lines().filter_map(|l| l.trim().parse().ok()).collect();
        if pids.is_empty() {
            return;
        }

        debug!(?pids, "terminating namespace residents");
        for pid in &pids {
            let _ = kill(Pid::from_raw(*pid), Signal::SIGTERM);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        for pid in &pids {
            if kill(Pid::from_raw(*pid), None).is_ok() {
                let _ = kill(Pid::from_raw(*pid), Signal::SIGKILL);
            }
        }
    }

    async fn install_nat(&self) -> Result<()> {
        match self.backend {
            FirewallBackendKind::Nftables => {
                let script = render_nat_table(&self.egress_iface);
                cmd::run_with_stdin("nft", &["-f", "-"], &script).await?;
            }
            _ => {
                cmd::run(
                    "iptables",
                    &[
                        "-t", "nat", "-A", "POSTROUTING", "-s", SUBNET, "-o",
                        &self.egress_iface, "-j", "MASQUERADE",
                    ],
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn remove_nat(&self) {
        match self.backend {
            FirewallBackendKind::Nftables => {
                let _ = cmd::run_unchecked("nft", &["delete", "table", "ip", NAT_TABLE]).await;
            }
            _ => {
                // Repeat until gone, in case of duplicate installs.
                for _ in 0..16 {
                    let ok = cmd::run_unchecked(
                        "iptables",
                        &[
                            "-t", "nat", "-D", "POSTROUTING", "-s", SUBNET, "-o",
                            &self.egress_iface, "-j", "MASQUERADE",
                        ],
                    )
                    .await
                    .map(|out| out.success())
                    .unwrap_or(false);
                    if !ok {
                        break;
                    }
                }
            }
        }
    }
}

fn render_nat_table(egress_iface: &str) -> String {
    format!(
        "table ip {NAT_TABLE} {{\n    chain postrouting {{\n        type nat hook postrouting priority 100; policy accept;\n        ip saddr {SUBNET} oifname \"{egress_iface}\" masquerade\n    }}\n}}\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nat_table_masquerades_the_subnet_out_the_egress() {
        let script = render_nat_table("wlan0");
        assert!(script.contains("table ip anonmanager_nat"));
        assert!(script.contains("ip saddr 10.200.1.0/24 oifname \"wlan0\" masquerade"));
    }

    #[tokio::test]
    async fn create_refuses_a_hostile_interface_name() {
        let mgr = NamespaceManager::new(FirewallBackendKind::Nftables, "eth0; reboot");
        assert!(mgr.create().await.is_err());
    }
}
