//! Capability probe: everything host-specific is detected once, up front,
//! and carried in a single context instead of being re-guessed later.

use anon_common::cmd;
use anon_common::{DistroFamily, Fault, FirewallBackendKind};
use anon_config::Settings;
use anyhow::{Context, Result};
use nix::unistd::User;
use std::path::Path;
use tracing::{debug, info};

/// Accounts distributions typically run Tor under, most specific first.
const TOR_USER_CANDIDATES: &[&str] = &["debian-tor", "tor", "toranon"];

#[derive(Clone, Debug)]
pub struct Capabilities {
    pub distro_family: DistroFamily,
    pub firewall_backend: FirewallBackendKind,
    pub tor_user: String,
    pub tor_uid: u32,
    pub egress_iface: String,
    pub netns_supported: bool,
}

pub async fn probe(settings: &Settings) -> Result<Capabilities> {
    let distro_family = detect_distro();
    let firewall_backend = detect_firewall_backend().await;
    let (tor_user, tor_uid) = detect_tor_user(settings, distro_family)?;
    let egress_iface = match &settings.egress_iface {
        Some(iface) => iface.clone(),
        None => detect_egress_iface().await?,
    };
    let netns_supported =
        Path::new("/proc/self/ns/net").exists() && cmd::tool_exists("ip");

    let caps = Capabilities {
        distro_family,
        firewall_backend,
        tor_user,
        tor_uid,
        egress_iface,
        netns_supported,
    };
    info!(
        distro = %caps.distro_family,
        backend = %caps.firewall_backend,
        tor_user = %caps.tor_user,
        egress = %caps.egress_iface,
        "host probed"
    );
    Ok(caps)
}

/// Fail fast when the host cannot support the pipeline at all.
pub fn require_supported(caps: &Capabilities) -> Result<()> {
    if caps.distro_family == DistroFamily::Unknown {
        return Err(Fault::UnsupportedHost("unrecognized distribution family".into()).into());
    }
    if caps.firewall_backend == FirewallBackendKind::Unknown {
        return Err(Fault::UnsupportedHost("no firewall backend found".into()).into());
    }
    if !caps.netns_supported {
        return Err(
            Fault::UnsupportedHost("kernel network-namespace support unavailable".into()).into(),
        );
    }
    Ok(())
}

fn detect_distro() -> DistroFamily {
    let content = std::fs::read_to_string("/etc/os-release").unwrap_or_default();
    parse_os_release(&content)
}

/// Classify from ID, falling back to ID_LIKE.
fn parse_os_release(content: &str) -> DistroFamily {
    let mut id = String::new();
    let mut id_like = String::new();
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("ID=") {
            id = value.trim_matches('"').to_ascii_lowercase();
        } else if let Some(value) = line.strip_prefix("ID_LIKE=") {
            id_like = value.trim_matches('"').to_ascii_lowercase();
        }
    }

    let classify = |token: &str| match token {
        "debian" | "ubuntu" | "kali" | "parrot" | "mint" | "linuxmint" | "pop" => {
            Some(DistroFamily::Debian)
        }
        "arch" | "manjaro" | "endeavouros" | "artix" => Some(DistroFamily::Arch),
        "fedora" | "rhel" | "centos" | "rocky" | "almalinux" => Some(DistroFamily::Rhel),
        _ => None,
    };

    if let Some(family) = classify(&id) {
        return family;
    }
    id_like
        .split_whitespace()
        .find_map(classify)
        .unwrap_or(DistroFamily::Unknown)
}

async fn detect_firewall_backend() -> FirewallBackendKind {
    if cmd::tool_exists("nft") {
        return FirewallBackendKind::Nftables;
    }
    if cmd::tool_exists("iptables") {
        // The translation layer announces itself in the version banner.
        if let Ok(out) = cmd::run_unchecked("iptables", &["--version"]).await
            && out.stdout.contains("nf_tables")
        {
            return FirewallBackendKind::IptablesNft;
        }
        return FirewallBackendKind::Iptables;
    }
    FirewallBackendKind::Unknown
}

fn detect_tor_user(
    settings: &Settings,
    distro_family: DistroFamily,
) -> Result<(String, u32)> {
    if let Some(name) = &settings.tor_user {
        let user = User::from_name(name)
            .context("tor user lookup failed")?
            .with_context(|| format!("configured tor user '{name}' does not exist"))?;
        return Ok((name.clone(), user.uid.as_raw()));
    }

    for candidate in TOR_USER_CANDIDATES {
        if let Ok(Some(user)) = User::from_name(candidate) {
            debug!(user = candidate, "tor account found");
            return Ok(((*candidate).to_string(), user.uid.as_raw()));
        }
    }

    // No account yet; the package check will name the missing package. Use
    // the family's conventional name so later steps have something to say.
    let fallback = match distro_family {
        DistroFamily::Debian => "debian-tor",
        DistroFamily::Rhel => "toranon",
        _ => "tor",
    };
    Ok((fallback.to_string(), 0))
}

async fn detect_egress_iface() -> Result<String> {
    let out = cmd::run("ip", &["route", "show", "default"]).await?;
    parse_default_route(&out.stdout)
        .context("no default route; cannot determine egress interface")
}

/// Pull the device out of `default via 192.168.1.1 dev wlan0 proto dhcp ...`.
fn parse_default_route(output: &str) -> Option<String> {
    let line = output.lines().next()?;
    let mut words = line.split_whitespace();
    while let Some(word) = words.next() {
        if word == "dev" {
            return words.next().map(str::to_string);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_release_id_wins() {
        let content = "NAME=\"Arch Linux\"\nID=arch\nBUILD_ID=rolling\n";
        assert_eq!(parse_os_release(content), DistroFamily::Arch);
    }

    #[test]
    fn os_release_falls_back_to_id_like() {
        let content = "NAME=\"Kubuntu\"\nID=kubuntu\nID_LIKE=\"ubuntu debian\"\n";
        assert_eq!(parse_os_release(content), DistroFamily::Debian);

        let content = "ID=rocky\nID_LIKE=\"rhel centos fedora\"\n";
        assert_eq!(parse_os_release(content), DistroFamily::Rhel);
    }

    #[test]
    fn unknown_distro_stays_unknown() {
        assert_eq!(parse_os_release("ID=plan9\n"), DistroFamily::Unknown);
        assert_eq!(parse_os_release(""), DistroFamily::Unknown);
    }

    #[test]
    fn default_route_device_is_extracted() {
        let output = "default via 192.168.1.1 dev wlan0 proto dhcp src 192.168.1.50 metric 600\n";
        assert_eq!(parse_default_route(output), Some("wlan0".to_string()));
        assert_eq!(parse_default_route(""), None);
        assert_eq!(parse_default_route("default via 10.0.0.1\n"), None);
    }
}
