//! Tor configuration emission. Port bindings are bit-exact against the
//! namespace topology; no sensitive data ever appears in process arguments,
//! only in this file.

use anon_common::cmd;
use anon_common::topology::{CONTROL_PORT, DNS_PORT, SOCKS_PORT, SUBNET, TOR_IP, TRANS_PORT};
use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;
use std::time::Duration;

const VERIFY_BOUND: Duration = Duration::from_secs(10);

/// Render the full torrc for the in-namespace instance.
pub fn render(data_dir: &Path) -> String {
    let mut out = String::new();
    let data = data_dir.display();

    writeln!(out, "DataDirectory {data}").unwrap();
    writeln!(out, "PidFile {data}/tor.pid").unwrap();
    writeln!(out, "RunAsDaemon 1").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "SocksPort {TOR_IP}:{SOCKS_PORT}").unwrap();
    writeln!(out, "DNSPort {TOR_IP}:{DNS_PORT}").unwrap();
    writeln!(out, "TransPort {TOR_IP}:{TRANS_PORT}").unwrap();
    writeln!(out, "ControlPort {TOR_IP}:{CONTROL_PORT}").unwrap();
    writeln!(out, "SocksPolicy accept {SUBNET}").unwrap();
    writeln!(out, "SocksPolicy reject *").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "CookieAuthentication 1").unwrap();
    writeln!(out, "AvoidDiskWrites 1").unwrap();
    writeln!(out, "SafeLogging 1").unwrap();
    writeln!(out, "DisableDebuggerAttachment 1").unwrap();
    writeln!(out, "ClientRejectInternalAddresses 1").unwrap();
    writeln!(out, "WarnUnsafeSocks 1").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "VirtualAddrNetworkIPv4 10.192.0.0/10").unwrap();
    writeln!(out, "AutomapHostsOnResolve 1").unwrap();
    writeln!(out, "NewCircuitPeriod 30").unwrap();
    writeln!(out, "MaxCircuitDirtiness 600").unwrap();
    writeln!(out, "CircuitBuildTimeout 60").unwrap();
    writeln!(out, "MaxMemInQueues 512 MB").unwrap();
    out
}

/// Proxychains-style helper pointing at the namespace SOCKS port.
pub fn render_proxychains() -> String {
    format!(
        "strict_chain\nproxy_dns\nremote_dns_subnet 224\ntcp_read_time_out 15000\ntcp_connect_time_out 8000\n[ProxyList]\nsocks5 {TOR_IP} {SOCKS_PORT}\n"
    )
}

/// Write the torrc; world-readable on purpose, since Tor reads it as its
/// own unprivileged user and it carries no secrets.
pub fn write(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content)
        .with_context(|| format!("failed to write {}", path.display()))?;
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))?;
    Ok(())
}

/// Dry-run validation; a config update is only accepted if Tor itself
/// accepts it.
pub async fn validate(path: &Path, tor_user: &str) -> Result<()> {
    let path_str = path.to_string_lossy();
    cmd::run_with_bound(
        "runuser",
        &["-u", tor_user, "--", "tor", "--verify-config", "-f", &path_str],
        VERIFY_BOUND,
    )
    .await
    .context("torrc failed dry-run validation")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn port_bindings_are_bit_exact() {
        let torrc = render(&PathBuf::from("/var/lib/anonmanager/tor"));
        assert!(torrc.contains("SocksPort 10.200.1.1:9050\n"));
        assert!(torrc.contains("DNSPort 10.200.1.1:5353\n"));
        assert!(torrc.contains("TransPort 10.200.1.1:9040\n"));
        assert!(torrc.contains("ControlPort 10.200.1.1:9051\n"));
    }

    #[test]
    fn socks_policy_admits_only_the_namespace_subnet() {
        let torrc = render(&PathBuf::from("/var/lib/anonmanager/tor"));
        let accept = torrc.find("SocksPolicy accept 10.200.1.0/24").unwrap();
        let reject = torrc.find("SocksPolicy reject *").unwrap();
        assert!(accept < reject);
    }

    #[test]
    fn hardening_directives_are_present() {
        let torrc = render(&PathBuf::from("/tmp/tor"));
        for directive in [
            "CookieAuthentication 1",
            "AvoidDiskWrites 1",
            "SafeLogging 1",
            "DisableDebuggerAttachment 1",
            "ClientRejectInternalAddresses 1",
            "WarnUnsafeSocks 1",
            "MaxMemInQueues 512 MB",
        ] {
            assert!(torrc.contains(directive), "missing {directive}");
        }
    }

    #[test]
    fn proxychains_helper_targets_the_namespace_socks() {
        let conf = render_proxychains();
        assert!(conf.contains("strict_chain"));
        assert!(conf.contains("proxy_dns"));
        assert!(conf.contains("socks5 10.200.1.1 9050"));
    }
}
