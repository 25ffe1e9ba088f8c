//! Modern backend: one declarative `inet` table applied atomically through
//! `nft -f -`. The single table carries filter and nat chains for both
//! address families; IPv6 is cut down to loopback-only early in each filter
//! chain so every later rule only ever sees IPv4.

use super::Killswitch;
use anon_common::cmd;
use anon_common::topology::{FIREWALL_NAMESPACE, VETH_HOST};
use anon_common::KillswitchRules;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Write;
use tracing::{debug, info};

pub struct NftBackend;

/// Compile the logical rules into a complete table definition.
///
/// Pure text generation: the same rules always produce the same bytes,
/// which is what makes repeated engagement converge.
pub fn render_ruleset(rules: &KillswitchRules) -> String {
    let mut out = String::new();
    let tor_ip = rules.tor.address;
    let subnet = &rules.ns_subnet;

    writeln!(out, "table inet {FIREWALL_NAMESPACE} {{").unwrap();

    // Outbound filter: fail closed.
    writeln!(out, "    chain output {{").unwrap();
    writeln!(out, "        type filter hook output priority filter; policy drop;").unwrap();
    writeln!(out, "        oifname \"lo\" accept").unwrap();
    writeln!(out, "        meta nfproto ipv6 drop").unwrap();
    writeln!(out, "        ct state established,related accept").unwrap();
    writeln!(out, "        meta skuid {} accept", rules.tor_uid).unwrap();
    writeln!(out, "        ip daddr {subnet} accept").unwrap();
    writeln!(out, "        udp sport 68 udp dport 67 accept").unwrap();

    let doh: Vec<String> = rules.doh_blocklist.iter().map(|ip| ip.to_string()).collect();
    if !doh.is_empty() {
        let set = doh.join(", ");
        writeln!(out, "        ip daddr {{ {set} }} tcp dport {{ 443, 853 }} reject with tcp reset").unwrap();
        writeln!(out, "        ip daddr {{ {set} }} udp dport {{ 443, 853 }} reject").unwrap();
    }

    if !rules.webrtc_udp_ports.is_empty() {
        writeln!(out, "        udp dport {{ {} }} drop", join_ports(&rules.webrtc_udp_ports)).unwrap();
    }
    if !rules.webrtc_tcp_ports.is_empty() {
        writeln!(out, "        tcp dport {{ {} }} drop", join_ports(&rules.webrtc_tcp_ports)).unwrap();
    }

    writeln!(out, "        ip daddr != {tor_ip} udp dport 5353 drop").unwrap();
    writeln!(out, "        log prefix \"{FIREWALL_NAMESPACE}-drop: \" drop").unwrap();
    writeln!(out, "    }}").unwrap();

    // Inbound filter mirrors the outbound accepts.
    writeln!(out, "    chain input {{").unwrap();
    writeln!(out, "        type filter hook input priority filter; policy drop;").unwrap();
    writeln!(out, "        iifname \"lo\" accept").unwrap();
    writeln!(out, "        meta nfproto ipv6 drop").unwrap();
    writeln!(out, "        ct state established,related accept").unwrap();
    writeln!(out, "        ip saddr {subnet} accept").unwrap();
    writeln!(out, "        udp sport 67 udp dport 68 accept").unwrap();
    writeln!(out, "    }}").unwrap();

    // Only namespace traffic may cross the host, and never over v6.
    writeln!(out, "    chain forward {{").unwrap();
    writeln!(out, "        type filter hook forward priority filter; policy drop;").unwrap();
    writeln!(out, "        meta nfproto ipv6 drop").unwrap();
    writeln!(out, "        iifname \"{VETH_HOST}\" accept").unwrap();
    writeln!(out, "        oifname \"{VETH_HOST}\" accept").unwrap();
    writeln!(out, "    }}").unwrap();

    // Redirect the host's DNS and TCP into the namespace Tor.
    writeln!(out, "    chain nat_output {{").unwrap();
    writeln!(out, "        type nat hook output priority -100; policy accept;").unwrap();
    writeln!(out, "        meta skuid {} return", rules.tor_uid).unwrap();
    writeln!(out, "        oifname \"lo\" return").unwrap();
    writeln!(out, "        ip daddr {subnet} return").unwrap();
    writeln!(out, "        udp dport 53 dnat ip to {tor_ip}:{}", rules.tor.dns_port).unwrap();
    writeln!(out, "        tcp dport 53 dnat ip to {tor_ip}:{}", rules.tor.dns_port).unwrap();
    writeln!(
        out,
        "        tcp flags & (fin | syn | rst | ack) == syn dnat ip to {tor_ip}:{}",
        rules.tor.trans_port
    )
    .unwrap();
    writeln!(out, "    }}").unwrap();

    writeln!(out, "    chain postrouting {{").unwrap();
    writeln!(out, "        type nat hook postrouting priority 100; policy accept;").unwrap();
    writeln!(out, "        ip saddr {subnet} oifname \"{}\" masquerade", rules.egress_iface).unwrap();
    writeln!(out, "    }}").unwrap();

    writeln!(out, "}}").unwrap();
    out
}

/// The nat-only table used by partial mode: DNS goes through Tor, the
/// filter policy stays untouched.
pub fn render_dns_redirect(rules: &KillswitchRules) -> String {
    let mut out = String::new();
    let tor_ip = rules.tor.address;
    let subnet = &rules.ns_subnet;

    writeln!(out, "table inet {FIREWALL_NAMESPACE} {{").unwrap();
    writeln!(out, "    chain nat_output {{").unwrap();
    writeln!(out, "        type nat hook output priority -100; policy accept;").unwrap();
    writeln!(out, "        meta skuid {} return", rules.tor_uid).unwrap();
    writeln!(out, "        oifname \"lo\" return").unwrap();
    writeln!(out, "        ip daddr {subnet} return").unwrap();
    writeln!(out, "        udp dport 53 dnat ip to {tor_ip}:{}", rules.tor.dns_port).unwrap();
    writeln!(out, "        tcp dport 53 dnat ip to {tor_ip}:{}", rules.tor.dns_port).unwrap();
    writeln!(out, "    }}").unwrap();
    writeln!(out, "}}").unwrap();
    out
}

fn join_ports(ports: &[u16]) -> String {
    ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
}

#[async_trait]
impl Killswitch for NftBackend {
    async fn engage(&self, rules: &KillswitchRules) -> Result<()> {
        cmd::checked_name(&rules.egress_iface)?;
        self.disengage().await?;

        let ruleset = render_ruleset(rules);
        debug!(bytes = ruleset.len(), "applying nft ruleset");
        cmd::run_with_stdin("nft", &["-f", "-"], &ruleset).await?;
        info!("killswitch engaged (nftables)");
        Ok(())
    }

    async fn engage_dns_only(&self, rules: &KillswitchRules) -> Result<()> {
        self.disengage().await?;
        let ruleset = render_dns_redirect(rules);
        cmd::run_with_stdin("nft", &["-f", "-"], &ruleset).await?;
        info!("DNS redirection engaged (nftables)");
        Ok(())
    }

    async fn disengage(&self) -> Result<()> {
        // Succeeds whether or not the table exists.
        let _ = cmd::run_unchecked("nft", &["delete", "table", "inet", FIREWALL_NAMESPACE]).await;
        Ok(())
    }

    async fn is_active(&self) -> bool {
        matches!(
            cmd::run_unchecked("nft", &["list", "table", "inet", FIREWALL_NAMESPACE]).await,
            Ok(out) if out.success()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anon_common::topology::TRANS_PORT;

    fn rules() -> KillswitchRules {
        KillswitchRules::for_host(109, "eth0")
    }

    #[test]
    fn rendering_is_deterministic() {
        let r = rules();
        assert_eq!(render_ruleset(&r), render_ruleset(&r));
    }

    #[test]
    fn outbound_fails_closed_with_the_expected_accepts() {
        let text = render_ruleset(&rules());
        assert!(text.contains("type filter hook output priority filter; policy drop;"));
        assert!(text.contains("oifname \"lo\" accept"));
        assert!(text.contains("ct state established,related accept"));
        assert!(text.contains("meta skuid 109 accept"));
        assert!(text.contains("ip daddr 10.200.1.0/24 accept"));
        assert!(text.contains("udp sport 68 udp dport 67 accept"));
        assert!(text.contains("log prefix \"anonmanager-drop: \" drop"));
    }

    #[test]
    fn dns_and_tcp_are_redirected_into_the_namespace() {
        let text = render_ruleset(&rules());
        assert!(text.contains("udp dport 53 dnat ip to 10.200.1.1:5353"));
        assert!(text.contains("tcp dport 53 dnat ip to 10.200.1.1:5353"));
        assert!(text.contains(&format!(
            "tcp flags & (fin | syn | rst | ack) == syn dnat ip to 10.200.1.1:{TRANS_PORT}"
        )));
        // Return-early rules precede the DNAT rules.
        let ret = text.find("meta skuid 109 return").unwrap();
        let dnat = text.find("udp dport 53 dnat").unwrap();
        assert!(ret < dnat);
    }

    #[test]
    fn doh_resolvers_are_rejected_not_dropped() {
        let text = render_ruleset(&rules());
        assert!(text.contains("1.1.1.1"));
        assert!(text.contains("9.9.9.9"));
        assert!(text.contains("tcp dport { 443, 853 } reject with tcp reset"));
        assert!(text.contains("udp dport { 443, 853 } reject"));
    }

    #[test]
    fn webrtc_and_stray_mdns_are_dropped() {
        let text = render_ruleset(&rules());
        assert!(text.contains("udp dport { 3478, 5349, 19302 } drop"));
        assert!(text.contains("tcp dport { 3478, 5349 } drop"));
        assert!(text.contains("ip daddr != 10.200.1.1 udp dport 5353 drop"));
    }

    fn chain_body<'a>(text: &'a str, chain: &str) -> &'a str {
        let start = text.find(&format!("chain {chain} {{")).unwrap();
        let end = text[start..].find('}').unwrap();
        &text[start..start + end]
    }

    #[test]
    fn ipv6_is_loopback_only_and_never_natted() {
        let text = render_ruleset(&rules());
        // Every filter chain cuts v6 down before any accept can match it.
        for chain in ["output", "input", "forward"] {
            assert!(
                chain_body(&text, chain).contains("meta nfproto ipv6 drop"),
                "no v6 guard in chain {chain}"
            );
        }
        // The nat chains carry only v4 matches.
        let nat = &text[text.find("chain nat_output").unwrap()..];
        assert!(!nat.contains("nfproto ipv6"));
    }

    #[test]
    fn dns_only_table_redirects_without_touching_the_filter_policy() {
        let text = render_dns_redirect(&rules());
        assert!(text.contains("udp dport 53 dnat ip to 10.200.1.1:5353"));
        assert!(text.contains("tcp dport 53 dnat ip to 10.200.1.1:5353"));
        assert!(!text.contains("policy drop"));
        assert!(!text.contains("masquerade"));
    }

    #[test]
    fn namespace_traffic_is_forwarded_and_masqueraded() {
        let text = render_ruleset(&rules());
        assert!(text.contains("iifname \"veth_host\" accept"));
        assert!(text.contains("oifname \"veth_host\" accept"));
        assert!(text.contains("ip saddr 10.200.1.0/24 oifname \"eth0\" masquerade"));
    }
}
