//! Distro package-name resolution for the tools the pipeline shells out to.
//! Canonical names map to what each package manager actually ships; an
//! unknown canonical name resolves to itself.

use anon_common::cmd;
use anon_common::Fault;
use anyhow::Result;
use tracing::debug;

/// (canonical, apt, pacman, dnf)
const PACKAGE_TABLE: &[(&str, &str, &str, &str)] = &[
    ("tor", "tor", "tor", "tor"),
    ("nft", "nftables", "nftables", "nftables"),
    ("iptables", "iptables", "iptables-nft", "iptables-nft"),
    ("ip", "iproute2", "iproute2", "iproute"),
    ("sysctl", "procps", "procps-ng", "procps-ng"),
    ("curl", "curl", "curl", "curl"),
    ("nc", "netcat-openbsd", "openbsd-netcat", "nmap-ncat"),
    ("chattr", "e2fsprogs", "e2fsprogs", "e2fsprogs"),
];

/// Resolve a canonical tool name for the given package-manager tag.
pub fn resolve(canonical: &str, package_manager: &str) -> String {
    for (name, apt, pacman, dnf) in PACKAGE_TABLE {
        if *name == canonical {
            return match package_manager {
                "apt" => (*apt).to_string(),
                "pacman" => (*pacman).to_string(),
                "dnf" => (*dnf).to_string(),
                _ => canonical.to_string(),
            };
        }
    }
    canonical.to_string()
}

/// Tools the pipeline cannot run without, beyond the backend binary.
pub const REQUIRED_TOOLS: &[&str] = &["ip", "sysctl", "tor"];

/// Verify every required tool is on the path, naming the distro package of
/// the first one missing.
pub fn check_required(tools: &[&str], package_manager: Option<&str>) -> Result<()> {
    for tool in tools {
        if cmd::tool_exists(tool) {
            debug!(tool, "required tool present");
            continue;
        }
        let package = package_manager
            .map(|pm| resolve(tool, pm))
            .unwrap_or_else(|| (*tool).to_string());
        return Err(Fault::ToolMissing { tool: (*tool).to_string(), package }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netcat_resolves_per_family() {
        assert_eq!(resolve("nc", "apt"), "netcat-openbsd");
        assert_eq!(resolve("nc", "pacman"), "openbsd-netcat");
        assert_eq!(resolve("nc", "dnf"), "nmap-ncat");
    }

    #[test]
    fn unknown_canonical_resolves_to_itself() {
        for pm in ["apt", "pacman", "dnf", "zypper"] {
            assert_eq!(resolve("foobar", pm), "foobar");
        }
    }

    #[test]
    fn unknown_package_manager_resolves_to_the_canonical_name() {
        assert_eq!(resolve("nc", "zypper"), "nc");
    }

    #[test]
    fn missing_tool_fault_names_the_package() {
        let err = check_required(&["definitely-not-a-real-binary-3141"], Some("apt")).unwrap_err();
        match err.downcast_ref::<Fault>() {
            Some(Fault::ToolMissing { tool, package }) => {
                assert_eq!(tool, "definitely-not-a-real-binary-3141");
                assert_eq!(package, "definitely-not-a-real-binary-3141");
            }
            other => panic!("unexpected fault {other:?}"),
        }
    }
}
