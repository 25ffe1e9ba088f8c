use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Anonymization mode the host is currently placed in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    None,
    Extreme,
    Partial,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::None => write!(f, "none"),
            Mode::Extreme => write!(f, "extreme"),
            Mode::Partial => write!(f, "partial"),
        }
    }
}

impl FromStr for Mode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Mode::None),
            "extreme" => Ok(Mode::Extreme),
            "partial" => Ok(Mode::Partial),
            _ => Err(()),
        }
    }
}

/// Distribution family, as detected from os-release.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistroFamily {
    Debian,
    Arch,
    Rhel,
    #[default]
    Unknown,
}

impl DistroFamily {
    /// Package-manager tag for this family.
    pub fn package_manager(self) -> Option<&'static str> {
        match self {
            DistroFamily::Debian => Some("apt"),
            DistroFamily::Arch => Some("pacman"),
            DistroFamily::Rhel => Some("dnf"),
            DistroFamily::Unknown => None,
        }
    }
}

impl fmt::Display for DistroFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistroFamily::Debian => write!(f, "debian"),
            DistroFamily::Arch => write!(f, "arch"),
            DistroFamily::Rhel => write!(f, "rhel"),
            DistroFamily::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for DistroFamily {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debian" => Ok(DistroFamily::Debian),
            "arch" => Ok(DistroFamily::Arch),
            "rhel" => Ok(DistroFamily::Rhel),
            "unknown" => Ok(DistroFamily::Unknown),
            _ => Err(()),
        }
    }
}

/// Firewall backend chosen once by the capability probe.
///
/// `IptablesNft` is the translation layer (`iptables-nft`) that accepts the
/// legacy rule language but programs nf_tables underneath; it is driven
/// exactly like `Iptables` but detected separately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FirewallBackendKind {
    Nftables,
    Iptables,
    IptablesNft,
    #[default]
    Unknown,
}

impl FirewallBackendKind {
    /// Whether the backend is driven through the legacy rule language.
    pub fn is_iptables(self) -> bool {
        matches!(self, FirewallBackendKind::Iptables | FirewallBackendKind::IptablesNft)
    }
}

impl fmt::Display for FirewallBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallBackendKind::Nftables => write!(f, "nftables"),
            FirewallBackendKind::Iptables => write!(f, "iptables"),
            FirewallBackendKind::IptablesNft => write!(f, "iptables-nft"),
            FirewallBackendKind::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for FirewallBackendKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nftables" => Ok(FirewallBackendKind::Nftables),
            "iptables" => Ok(FirewallBackendKind::Iptables),
            "iptables-nft" => Ok(FirewallBackendKind::IptablesNft),
            "unknown" => Ok(FirewallBackendKind::Unknown),
            _ => Err(()),
        }
    }
}

/// Subsystem a watchdog alert refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertCategory {
    Tor,
    Firewall,
    Dns,
    Ipv6,
    Namespace,
}

impl fmt::Display for AlertCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertCategory::Tor => write!(f, "TOR"),
            AlertCategory::Firewall => write!(f, "FIREWALL"),
            AlertCategory::Dns => write!(f, "DNS"),
            AlertCategory::Ipv6 => write!(f, "IPV6"),
            AlertCategory::Namespace => write!(f, "NAMESPACE"),
        }
    }
}

/// One invariant violation observed by the watchdog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchdogAlert {
    pub category: AlertCategory,
    pub message: String,
}

impl WatchdogAlert {
    pub fn new(category: AlertCategory, message: impl Into<String>) -> Self {
        Self { category, message: message.into() }
    }
}

impl fmt::Display for WatchdogAlert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_str() {
        for mode in [Mode::None, Mode::Extreme, Mode::Partial] {
            assert_eq!(mode.to_string().parse::<Mode>(), Ok(mode));
        }
        assert!("EXTREME".parse::<Mode>().is_err());
        assert!("$(rm -rf /)".parse::<Mode>().is_err());
    }

    #[test]
    fn backend_round_trips_through_str() {
        for backend in [
            FirewallBackendKind::Nftables,
            FirewallBackendKind::Iptables,
            FirewallBackendKind::IptablesNft,
            FirewallBackendKind::Unknown,
        ] {
            assert_eq!(backend.to_string().parse::<FirewallBackendKind>(), Ok(backend));
        }
    }

    #[test]
    fn alert_formats_with_category_tag() {
        let alert = WatchdogAlert::new(AlertCategory::Dns, "resolver points away from loopback");
        assert_eq!(alert.to_string(), "[DNS] resolver points away from loopback");
    }
}
