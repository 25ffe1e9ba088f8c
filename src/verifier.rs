//! Ten independent post-enable checks. Pure observation: nothing in here
//! mutates system state.

use crate::probe::Capabilities;
use anon_common::cmd;
use anon_common::topology::{FIREWALL_NAMESPACE, SOCKS_PORT, TOR_IP};
use anon_config::{Paths, Settings};
use anon_firewall::backend_for;
use anon_net::{dns, mac, sysctl, NamespaceManager};
use anon_state::SnapshotStore;
use anon_tor::{ControlClient, TorSupervisor};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use std::time::Duration;

const CURL_BOUND: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Pass => write!(f, "PASS"),
            CheckStatus::Warn => write!(f, "WARN"),
            CheckStatus::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CheckResult {
    pub name: &'static str,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Clone, Debug, Default)]
pub struct VerifySummary {
    pub results: Vec<CheckResult>,
}

impl VerifySummary {
    fn push(&mut self, name: &'static str, status: CheckStatus, detail: impl Into<String>) {
        self.results.push(CheckResult { name, status, detail: detail.into() });
    }

    pub fn passed(&self) -> usize {
        self.count(CheckStatus::Pass)
    }

    pub fn warned(&self) -> usize {
        self.count(CheckStatus::Warn)
    }

    pub fn failed(&self) -> usize {
        self.count(CheckStatus::Fail)
    }

    fn count(&self, status: CheckStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

pub async fn run(paths: &Paths, settings: &Settings, caps: &Capabilities) -> VerifySummary {
    let mut summary = VerifySummary::default();

    // 1. Tor process.
    let supervisor = TorSupervisor::new(
        &caps.tor_user,
        &settings.tor_data_dir,
        paths.torrc(),
        paths.tor_pid_file(),
    );
    if supervisor.is_running() {
        summary.push("tor process", CheckStatus::Pass, "supervised tor is alive");
    } else {
        summary.push("tor process", CheckStatus::Fail, "no live tor under supervision");
    }

    // 2. Bootstrap complete.
    let control = ControlClient::new(&settings.tor_data_dir);
    match control.bootstrap_progress().await {
        Ok((100, _)) => summary.push("tor bootstrap", CheckStatus::Pass, "100%"),
        Ok((percent, tag)) => {
            summary.push("tor bootstrap", CheckStatus::Fail, format!("{percent}% ({tag})"));
        }
        Err(e) => summary.push("tor bootstrap", CheckStatus::Fail, e.to_string()),
    }

    // 3 + 4. Exit reachability over SOCKS, and the Tor-project oracle.
    match fetch_exit_oracle().await {
        Some((is_tor, ip)) => {
            summary.push("exit reachable", CheckStatus::Pass, format!("exit IP {ip}"));
            if is_tor {
                summary.push("exit oracle", CheckStatus::Pass, "oracle confirms a Tor exit");
            } else {
                summary.push("exit oracle", CheckStatus::Fail, "oracle says this is not Tor");
            }
        }
        None => {
            summary.push("exit reachable", CheckStatus::Fail, "no reply through the SOCKS port");
            summary.push("exit oracle", CheckStatus::Warn, "unreachable, oracle not consulted");
        }
    }

    // 5. DNS pinned to loopback.
    if dns::points_at_loopback(Path::new("/etc/resolv.conf")) {
        summary.push("dns lock", CheckStatus::Pass, "resolver points at loopback");
    } else {
        summary.push("dns lock", CheckStatus::Fail, "resolver escapes loopback");
    }

    // 6. IPv6 off.
    match sysctl::read_proc("net.ipv6.conf.all.disable_ipv6").as_deref() {
        Some("1") => summary.push("ipv6 disabled", CheckStatus::Pass, "disable flag is 1"),
        Some(other) => {
            summary.push("ipv6 disabled", CheckStatus::Fail, format!("disable flag is {other}"));
        }
        None => summary.push("ipv6 disabled", CheckStatus::Warn, "flag unreadable"),
    }

    // 7. Killswitch present.
    match backend_for(caps.firewall_backend) {
        Ok(engine) if engine.is_active().await => {
            summary.push("killswitch", CheckStatus::Pass, "ruleset installed");
        }
        Ok(_) => summary.push("killswitch", CheckStatus::Fail, "ruleset absent"),
        Err(_) => summary.push("killswitch", CheckStatus::Warn, "backend unknown"),
    }

    // 8. Namespace present.
    if NamespaceManager::exists() {
        summary.push("namespace", CheckStatus::Pass, "anonspace registered");
    } else {
        summary.push("namespace", CheckStatus::Fail, "anonspace missing");
    }

    // 9. WebRTC block rule present.
    match webrtc_rule_present(caps).await {
        Some(true) => summary.push("webrtc block", CheckStatus::Pass, "STUN/TURN drop installed"),
        Some(false) => summary.push("webrtc block", CheckStatus::Fail, "STUN/TURN drop missing"),
        None => summary.push("webrtc block", CheckStatus::Warn, "ruleset unreadable"),
    }

    // 10. MAC recorded as randomized.
    let snapshot = SnapshotStore::new(paths.snapshot_dir(), caps.firewall_backend);
    match (snapshot.read_mac("initial"), mac::current(&caps.egress_iface)) {
        (Some(original), Some(current)) if original != current => {
            summary.push("mac rotation", CheckStatus::Pass, format!("link address is {current}"));
        }
        (Some(_), Some(current)) => {
            summary.push("mac rotation", CheckStatus::Fail, format!("still {current}"));
        }
        _ => summary.push("mac rotation", CheckStatus::Warn, "no recorded baseline"),
    }

    summary
}

/// `https://check.torproject.org/api/ip` through the namespace SOCKS port.
async fn fetch_exit_oracle() -> Option<(bool, String)> {
    let proxy = format!("{TOR_IP}:{SOCKS_PORT}");
    let out = cmd::run_unchecked_with_bound(
        "curl",
        &["-sS", "--max-time", "8", "--socks5-hostname", &proxy, "https://check.torproject.org/api/ip"],
        CURL_BOUND,
    )
    .await
    .ok()?;
    if !out.success() {
        return None;
    }
    parse_oracle(&out.stdout)
}

fn parse_oracle(body: &str) -> Option<(bool, String)> {
    let value: Value = serde_json::from_str(body).ok()?;
    let is_tor = value.get("IsTor")?.as_bool()?;
    let ip = value.get("IP")?.as_str()?.to_string();
    Some((is_tor, ip))
}

async fn webrtc_rule_present(caps: &Capabilities) -> Option<bool> {
    let listing = if caps.firewall_backend.is_iptables() {
        cmd::run_unchecked("iptables", &["-n", "-L", anon_firewall::IPTABLES_OUTPUT_CHAIN])
            .await
            .ok()?
    } else {
        cmd::run_unchecked("nft", &["list", "table", "inet", FIREWALL_NAMESPACE]).await.ok()?
    };
    if !listing.success() {
        return Some(false);
    }
    Some(listing.stdout.contains("3478"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oracle_body_parses() {
        let body = r#"{"IsTor":true,"IP":"185.220.101.4"}"#;
        assert_eq!(parse_oracle(body), Some((true, "185.220.101.4".to_string())));

        let body = r#"{"IsTor":false,"IP":"93.184.216.34"}"#;
        assert_eq!(parse_oracle(body), Some((false, "93.184.216.34".to_string())));

        assert_eq!(parse_oracle("not json"), None);
        assert_eq!(parse_oracle("{}"), None);
    }

    #[test]
    fn summary_counts_by_status() {
        let mut summary = VerifySummary::default();
        summary.push("a", CheckStatus::Pass, "");
        summary.push("b", CheckStatus::Pass, "");
        summary.push("c", CheckStatus::Fail, "");
        summary.push("d", CheckStatus::Warn, "");
        assert_eq!(summary.passed(), 2);
        assert_eq!(summary.failed(), 1);
        assert_eq!(summary.warned(), 1);
    }
}
