//! Kernel hardening matrix and the IPv6 switches.
//!
//! A single key that refuses to apply is a warning, not an abort; some
//! kernels genuinely lack individual knobs and the remaining matrix is
//! still worth having.

use anon_common::cmd;
use anon_common::Fault;
use anyhow::Result;
use std::path::PathBuf;
use tracing::{debug, warn};

/// Applied on extreme enable, restored from the snapshot on disable.
pub const HARDENING_MATRIX: &[(&str, &str)] = &[
    ("kernel.kptr_restrict", "2"),
    ("kernel.dmesg_restrict", "1"),
    ("kernel.unprivileged_bpf_disabled", "1"),
    ("net.core.bpf_jit_harden", "2"),
    ("net.ipv4.tcp_timestamps", "0"),
    ("net.ipv4.icmp_echo_ignore_all", "1"),
    ("net.ipv4.conf.all.accept_redirects", "0"),
    ("net.ipv4.conf.default.accept_redirects", "0"),
    ("net.ipv6.conf.all.accept_redirects", "0"),
    ("net.ipv6.conf.default.accept_redirects", "0"),
    ("net.ipv4.conf.all.accept_source_route", "0"),
    ("net.ipv4.conf.default.accept_source_route", "0"),
    ("net.ipv6.conf.all.accept_source_route", "0"),
    ("net.ipv6.conf.default.accept_source_route", "0"),
    ("net.ipv4.tcp_syncookies", "1"),
    ("net.ipv4.conf.all.rp_filter", "1"),
    ("net.ipv4.conf.default.rp_filter", "1"),
    ("net.ipv4.conf.all.send_redirects", "0"),
    ("net.ipv4.conf.default.send_redirects", "0"),
    ("net.ipv4.conf.all.log_martians", "1"),
    ("net.ipv4.conf.default.log_martians", "1"),
];

/// IPv6 stack switches, applied alongside the matrix on extreme enable.
pub const IPV6_DISABLE_KEYS: &[(&str, &str)] = &[
    ("net.ipv6.conf.all.disable_ipv6", "1"),
    ("net.ipv6.conf.default.disable_ipv6", "1"),
    ("net.ipv6.conf.all.accept_ra", "0"),
    ("net.ipv6.conf.default.accept_ra", "0"),
    ("net.ipv6.conf.all.autoconf", "0"),
    ("net.ipv6.conf.default.autoconf", "0"),
];

/// Every key the snapshot must capture before enable touches any of them.
pub fn all_keys() -> Vec<&'static str> {
    HARDENING_MATRIX
        .iter()
        .chain(IPV6_DISABLE_KEYS.iter())
        .map(|(key, _)| *key)
        .collect()
}

pub async fn apply_hardening() -> Result<()> {
    apply_matrix(HARDENING_MATRIX).await
}

pub async fn disable_ipv6() -> Result<()> {
    apply_matrix(IPV6_DISABLE_KEYS).await
}

/// Flip the stacks back on; exact prior values come from the snapshot.
pub async fn enable_ipv6() -> Result<()> {
    apply_matrix(&[
        ("net.ipv6.conf.all.disable_ipv6", "0"),
        ("net.ipv6.conf.default.disable_ipv6", "0"),
    ])
    .await
}

async fn apply_matrix(matrix: &[(&str, &str)]) -> Result<()> {
    for (key, value) in matrix {
        let assignment = format!("{key}={value}");
        match cmd::run_unchecked("sysctl", &["-w", &assignment]).await {
            Ok(out) if out.success() => debug!(key, value, "sysctl applied"),
            Ok(out) => warn!(key, value, stderr = %out.stderr.trim(), "sysctl write refused"),
            Err(Fault::Transient { .. }) => warn!(key, "sysctl write timed out"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Read the live value of a key through procfs, bypassing the tool.
pub fn read_proc(key: &str) -> Option<String> {
    let path = PathBuf::from("/proc/sys").join(key.replace('.', "/"));
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_carries_the_full_hardening_set() {
        let keys: Vec<&str> = HARDENING_MATRIX.iter().map(|(k, _)| *k).collect();
        for expected in [
            "kernel.kptr_restrict",
            "kernel.dmesg_restrict",
            "kernel.unprivileged_bpf_disabled",
            "net.core.bpf_jit_harden",
            "net.ipv4.tcp_timestamps",
            "net.ipv4.icmp_echo_ignore_all",
            "net.ipv4.tcp_syncookies",
        ] {
            assert!(keys.contains(&expected), "missing {expected}");
        }
        // Redirect/source-route/rp_filter knobs come in all+default pairs.
        for stem in ["accept_redirects", "accept_source_route", "rp_filter", "send_redirects", "log_martians"] {
            let pair = keys.iter().filter(|k| k.ends_with(stem)).count();
            assert!(pair >= 2, "{stem} not set for both all and default");
        }
    }

    #[test]
    fn ipv6_disable_covers_ra_and_autoconf() {
        let keys: Vec<&str> = IPV6_DISABLE_KEYS.iter().map(|(k, _)| *k).collect();
        assert!(keys.contains(&"net.ipv6.conf.all.disable_ipv6"));
        assert!(keys.contains(&"net.ipv6.conf.default.disable_ipv6"));
        assert!(keys.contains(&"net.ipv6.conf.all.accept_ra"));
        assert!(keys.contains(&"net.ipv6.conf.all.autoconf"));
    }

    #[test]
    fn snapshot_key_set_is_matrix_plus_ipv6() {
        let keys = all_keys();
        assert_eq!(keys.len(), HARDENING_MATRIX.len() + IPV6_DISABLE_KEYS.len());
        assert!(keys.contains(&"net.ipv6.conf.default.autoconf"));
    }
}
