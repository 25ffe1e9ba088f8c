//! Link-layer address replacement, preferably through the connection
//! manager (which survives its own reconnects), with direct link
//! manipulation as the fallback.

use anon_common::cmd;
use anyhow::{Context, Result};
use rand::Rng;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

const NMCLI_BOUND: Duration = Duration::from_secs(10);

/// A fresh locally-administered unicast address.
pub fn random_mac() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill(&mut bytes[..]);
    // Unicast, locally administered.
    bytes[0] = (bytes[0] & 0xfe) | 0x02;
    bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

/// Current address as the kernel reports it.
pub fn current(iface: &str) -> Option<String> {
    let path = PathBuf::from("/sys/class/net").join(iface).join("address");
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Randomize the egress interface's MAC. Returns the new address.
pub async fn randomize(iface: &str) -> Result<String> {
    cmd::checked_name(iface)?;
    let mac = random_mac();

    if let Some(uuid) = active_connection(iface).await {
        let set = cmd::run_unchecked_with_bound(
            "nmcli",
            &["connection", "modify", "uuid", &uuid, "cloned-mac-address", &mac],
            NMCLI_BOUND,
        )
        .await;
        if matches!(set, Ok(ref out) if out.success()) {
            let up = cmd::run_unchecked_with_bound(
                "nmcli",
                &["connection", "up", "uuid", &uuid],
                NMCLI_BOUND,
            )
            .await;
            if matches!(up, Ok(ref out) if out.success()) {
                info!(iface, %mac, "MAC replaced via connection manager");
                return Ok(mac);
            }
        }
        warn!(iface, "connection manager rejected the clone; falling back to link manipulation");
    }

    set_link_mac(iface, &mac).await?;
    info!(iface, %mac, "MAC replaced via link manipulation");
    Ok(mac)
}

/// Put the captured address back and drop any lingering clone property.
pub async fn restore(iface: &str, original: &str) -> Result<()> {
    cmd::checked_name(iface)?;

    if let Some(uuid) = active_connection(iface).await {
        let _ = cmd::run_unchecked_with_bound(
            "nmcli",
            &["connection", "modify", "uuid", &uuid, "cloned-mac-address", ""],
            NMCLI_BOUND,
        )
        .await;
    }
    set_link_mac(iface, original).await
}

async fn set_link_mac(iface: &str, mac: &str) -> Result<()> {
    cmd::run("ip", &["link", "set", "dev", iface, "down"]).await?;
    let result = cmd::run("ip", &["link", "set", "dev", iface, "address", mac]).await;
    // The link comes back up even if the address change failed.
    cmd::run("ip", &["link", "set", "dev", iface, "up"]).await?;
    result.map(|_| ()).context("failed to set link address")
}

async fn active_connection(iface: &str) -> Option<String> {
    let out = cmd::run_unchecked("nmcli", &["-t", "-f", "UUID,DEVICE", "connection", "show", "--active"])
        .await
        .ok()?;
    if !out.success() {
        return None;
    }
    out.stdout.lines().find_map(|line| {
        let (uuid, device) = line.split_once(':')?;
        (device == iface).then(|| uuid.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_mac_is_locally_administered_unicast() {
        for _ in 0..64 {
            let mac = random_mac();
            assert_eq!(mac.len(), 17);
            let first = u8::from_str_radix(&mac[..2], 16).unwrap();
            assert_eq!(first & 0x01, 0, "multicast bit set in {mac}");
            assert_eq!(first & 0x02, 0x02, "local bit clear in {mac}");
        }
    }

    #[test]
    fn consecutive_addresses_differ() {
        assert_ne!(random_mac(), random_mac());
    }
}
