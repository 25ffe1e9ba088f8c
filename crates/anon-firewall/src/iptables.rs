//! Legacy backend: the same killswitch compiled to iptables/ip6tables
//! command sequences. Own chains are created and hooked into the top-level
//! chains with an insert, so teardown is unhook-flush-delete and never
//! touches rules that belong to the host.

use super::Killswitch;
use anon_common::cmd;
use anon_common::topology::VETH_HOST;
use anon_common::KillswitchRules;
use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Outbound filter chain; observers look for it by name.
pub const CHAIN_OUT: &str = "ANONMGR_OUT";
const CHAIN_IN: &str = "ANONMGR_IN";
const CHAIN_FWD: &str = "ANONMGR_FWD";
const CHAIN_NAT: &str = "ANONMGR_NAT";
const CHAIN_POST: &str = "ANONMGR_POST";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    fn binary(self) -> &'static str {
        match self {
            Family::V4 => "iptables",
            Family::V6 => "ip6tables",
        }
    }
}

/// One rule-language invocation of the engage sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Step {
    pub family: Family,
    pub args: Vec<String>,
}

fn step(family: Family, args: &[&str]) -> Step {
    Step { family, args: args.iter().map(|s| s.to_string()).collect() }
}

/// Compile the logical rules into the full engage sequence.
///
/// Pure: the same rules always produce the same plan.
pub fn engage_plan(rules: &KillswitchRules) -> Vec<Step> {
    let mut plan = Vec::new();
    let uid = rules.tor_uid.to_string();
    let tor_ip = rules.tor.address.to_string();
    let subnet = rules.ns_subnet.as_str();
    let dns_target = format!("{tor_ip}:{}", rules.tor.dns_port);
    let trans_target = format!("{tor_ip}:{}", rules.tor.trans_port);

    // v4 filter chains.
    plan.push(step(Family::V4, &["-N", CHAIN_OUT]));
    plan.push(step(Family::V4, &["-N", CHAIN_IN]));
    plan.push(step(Family::V4, &["-N", CHAIN_FWD]));

    plan.push(step(Family::V4, &["-A", CHAIN_OUT, "-o", "lo", "-j", "ACCEPT"]));
    plan.push(step(
        Family::V4,
        &["-A", CHAIN_OUT, "-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
    ));
    plan.push(step(
        Family::V4,
        &["-A", CHAIN_OUT, "-m", "owner", "--uid-owner", &uid, "-j", "ACCEPT"],
    ));
    plan.push(step(Family::V4, &["-A", CHAIN_OUT, "-d", subnet, "-j", "ACCEPT"]));
    plan.push(step(
        Family::V4,
        &["-A", CHAIN_OUT, "-p", "udp", "--sport", "68", "--dport", "67", "-j", "ACCEPT"],
    ));

    for ip in &rules.doh_blocklist {
        let ip = ip.to_string();
        plan.push(step(
            Family::V4,
            &[
                "-A", CHAIN_OUT, "-d", &ip, "-p", "tcp", "-m", "multiport", "--dports",
                "443,853", "-j", "REJECT", "--reject-with", "tcp-reset",
            ],
        ));
        plan.push(step(
            Family::V4,
            &[
                "-A", CHAIN_OUT, "-d", &ip, "-p", "udp", "-m", "multiport", "--dports",
                "443,853", "-j", "REJECT",
            ],
        ));
    }

    if !rules.webrtc_udp_ports.is_empty() {
        let ports = join_ports(&rules.webrtc_udp_ports);
        plan.push(step(
            Family::V4,
            &["-A", CHAIN_OUT, "-p", "udp", "-m", "multiport", "--dports", &ports, "-j", "DROP"],
        ));
    }
    if !rules.webrtc_tcp_ports.is_empty() {
        let ports = join_ports(&rules.webrtc_tcp_ports);
        plan.push(step(
            Family::V4,
            &["-A", CHAIN_OUT, "-p", "tcp", "-m", "multiport", "--dports", &ports, "-j", "DROP"],
        ));
    }

    plan.push(step(
        Family::V4,
        &["-A", CHAIN_OUT, "!", "-d", &tor_ip, "-p", "udp", "--dport", "5353", "-j", "DROP"],
    ));
    plan.push(step(
        Family::V4,
        &["-A", CHAIN_OUT, "-j", "LOG", "--log-prefix", "anonmanager-drop: "],
    ));
    plan.push(step(Family::V4, &["-A", CHAIN_OUT, "-j", "DROP"]));

    plan.push(step(Family::V4, &["-A", CHAIN_IN, "-i", "lo", "-j", "ACCEPT"]));
    plan.push(step(
        Family::V4,
        &["-A", CHAIN_IN, "-m", "state", "--state", "ESTABLISHED,RELATED", "-j", "ACCEPT"],
    ));
    plan.push(step(Family::V4, &["-A", CHAIN_IN, "-s", subnet, "-j", "ACCEPT"]));
    plan.push(step(
        Family::V4,
        &["-A", CHAIN_IN, "-p", "udp", "--sport", "67", "--dport", "68", "-j", "ACCEPT"],
    ));
    plan.push(step(Family::V4, &["-A", CHAIN_IN, "-j", "DROP"]));

    plan.push(step(Family::V4, &["-A", CHAIN_FWD, "-i", VETH_HOST, "-j", "ACCEPT"]));
    plan.push(step(Family::V4, &["-A", CHAIN_FWD, "-o", VETH_HOST, "-j", "ACCEPT"]));
    plan.push(step(Family::V4, &["-A", CHAIN_FWD, "-j", "DROP"]));

    // v4 nat: return-early, then DNAT into the namespace, then masquerade.
    plan.push(step(Family::V4, &["-t", "nat", "-N", CHAIN_NAT]));
    plan.push(step(Family::V4, &["-t", "nat", "-N", CHAIN_POST]));
    plan.push(step(
        Family::V4,
        &["-t", "nat", "-A", CHAIN_NAT, "-m", "owner", "--uid-owner", &uid, "-j", "RETURN"],
    ));
    plan.push(step(Family::V4, &["-t", "nat", "-A", CHAIN_NAT, "-o", "lo", "-j", "RETURN"]));
    plan.push(step(Family::V4, &["-t", "nat", "-A", CHAIN_NAT, "-d", subnet, "-j", "RETURN"]));
    plan.push(step(
        Family::V4,
        &[
            "-t", "nat", "-A", CHAIN_NAT, "-p", "udp", "--dport", "53", "-j", "DNAT",
            "--to-destination", &dns_target,
        ],
    ));
    plan.push(step(
        Family::V4,
        &[
            "-t", "nat", "-A", CHAIN_NAT, "-p", "tcp", "--dport", "53", "-j", "DNAT",
            "--to-destination", &dns_target,
        ],
    ));
    plan.push(step(
        Family::V4,
        &[
            "-t", "nat", "-A", CHAIN_NAT, "-p", "tcp", "--syn", "-j", "DNAT",
            "--to-destination", &trans_target,
        ],
    ));
    plan.push(step(
        Family::V4,
        &[
            "-t", "nat", "-A", CHAIN_POST, "-s", subnet, "-o", &rules.egress_iface, "-j",
            "MASQUERADE",
        ],
    ));

    // v6 filter: loopback-only, policy-equivalent drop. No v6 nat.
    plan.push(step(Family::V6, &["-N", CHAIN_OUT]));
    plan.push(step(Family::V6, &["-N", CHAIN_IN]));
    plan.push(step(Family::V6, &["-N", CHAIN_FWD]));
    plan.push(step(Family::V6, &["-A", CHAIN_OUT, "-o", "lo", "-j", "ACCEPT"]));
    plan.push(step(Family::V6, &["-A", CHAIN_OUT, "-j", "DROP"]));
    plan.push(step(Family::V6, &["-A", CHAIN_IN, "-i", "lo", "-j", "ACCEPT"]));
    plan.push(step(Family::V6, &["-A", CHAIN_IN, "-j", "DROP"]));
    plan.push(step(Family::V6, &["-A", CHAIN_FWD, "-j", "DROP"]));

    // Hooks last, so the chains are complete the moment traffic reaches them.
    for family in [Family::V4, Family::V6] {
        plan.push(step(family, &["-I", "OUTPUT", "1", "-j", CHAIN_OUT]));
        plan.push(step(family, &["-I", "INPUT", "1", "-j", CHAIN_IN]));
        plan.push(step(family, &["-I", "FORWARD", "1", "-j", CHAIN_FWD]));
    }
    plan.push(step(Family::V4, &["-t", "nat", "-I", "OUTPUT", "1", "-j", CHAIN_NAT]));
    plan.push(step(Family::V4, &["-t", "nat", "-I", "POSTROUTING", "1", "-j", CHAIN_POST]));

    plan
}

/// Partial mode: only the nat chain with the DNS redirect, no filter hooks.
pub fn dns_redirect_plan(rules: &KillswitchRules) -> Vec<Step> {
    let mut plan = Vec::new();
    let uid = rules.tor_uid.to_string();
    let subnet = rules.ns_subnet.as_str();
    let dns_target = format!("{}:{}", rules.tor.address, rules.tor.dns_port);

    plan.push(step(Family::V4, &["-t", "nat", "-N", CHAIN_NAT]));
    plan.push(step(
        Family::V4,
        &["-t", "nat", "-A", CHAIN_NAT, "-m", "owner", "--uid-owner", &uid, "-j", "RETURN"],
    ));
    plan.push(step(Family::V4, &["-t", "nat", "-A", CHAIN_NAT, "-o", "lo", "-j", "RETURN"]));
    plan.push(step(Family::V4, &["-t", "nat", "-A", CHAIN_NAT, "-d", subnet, "-j", "RETURN"]));
    plan.push(step(
        Family::V4,
        &[
            "-t", "nat", "-A", CHAIN_NAT, "-p", "udp", "--dport", "53", "-j", "DNAT",
            "--to-destination", &dns_target,
        ],
    ));
    plan.push(step(
        Family::V4,
        &[
            "-t", "nat", "-A", CHAIN_NAT, "-p", "tcp", "--dport", "53", "-j", "DNAT",
            "--to-destination", &dns_target,
        ],
    ));
    plan.push(step(Family::V4, &["-t", "nat", "-I", "OUTPUT", "1", "-j", CHAIN_NAT]));
    plan
}

fn join_ports(ports: &[u16]) -> String {
    ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",")
}

pub struct IptablesBackend;

impl IptablesBackend {
    /// Delete a hook rule until it is gone; duplicate inserts from an
    /// interrupted run would otherwise leave traffic detouring into a
    /// deleted chain.
    async fn unhook(family: Family, table: Option<&str>, chain: &str, hook: &str) {
        for _ in 0..16 {
            let mut args: Vec<&str> = Vec::new();
            if let Some(t) = table {
                args.extend(["-t", t]);
            }
            args.extend(["-D", hook, "-j", chain]);
            match cmd::run_unchecked(family.binary(), &args).await {
                Ok(out) if out.success() => continue,
                _ => break,
            }
        }
    }

    async fn drop_chain(family: Family, table: Option<&str>, chain: &str) {
        for flag in ["-F", "-X"] {
            let mut args: Vec<&str> = Vec::new();
            if let Some(t) = table {
                args.extend(["-t", t]);
            }
            args.extend([flag, chain]);
            let _ = cmd::run_unchecked(family.binary(), &args).await;
        }
    }
}

#[async_trait]
impl Killswitch for IptablesBackend {
    async fn engage(&self, rules: &KillswitchRules) -> Result<()> {
        cmd::checked_name(&rules.egress_iface)?;
        self.disengage().await?;

        let plan = engage_plan(rules);
        debug!(steps = plan.len(), "applying iptables plan");
        for s in &plan {
            let args: Vec<&str> = s.args.iter().map(String::as_str).collect();
            cmd::run(s.family.binary(), &args).await?;
        }
        info!("killswitch engaged (iptables)");
        Ok(())
    }

    async fn engage_dns_only(&self, rules: &KillswitchRules) -> Result<()> {
        self.disengage().await?;
        for s in &dns_redirect_plan(rules) {
            let args: Vec<&str> = s.args.iter().map(String::as_str).collect();
            cmd::run(s.family.binary(), &args).await?;
        }
        info!("DNS redirection engaged (iptables)");
        Ok(())
    }

    async fn disengage(&self) -> Result<()> {
        for family in [Family::V4, Family::V6] {
            Self::unhook(family, None, CHAIN_OUT, "OUTPUT").await;
            Self::unhook(family, None, CHAIN_IN, "INPUT").await;
            Self::unhook(family, None, CHAIN_FWD, "FORWARD").await;
            Self::drop_chain(family, None, CHAIN_OUT).await;
            Self::drop_chain(family, None, CHAIN_IN).await;
            Self::drop_chain(family, None, CHAIN_FWD).await;
        }
        Self::unhook(Family::V4, Some("nat"), CHAIN_NAT, "OUTPUT").await;
        Self::unhook(Family::V4, Some("nat"), CHAIN_POST, "POSTROUTING").await;
        Self::drop_chain(Family::V4, Some("nat"), CHAIN_NAT).await;
        Self::drop_chain(Family::V4, Some("nat"), CHAIN_POST).await;
        Ok(())
    }

    async fn is_active(&self) -> bool {
        // Full mode installs the filter chains; partial mode only the nat
        // chain. Either counts as engaged.
        for args in [
            ["-n", "-L", CHAIN_OUT, "-t", "filter"],
            ["-n", "-L", CHAIN_NAT, "-t", "nat"],
        ] {
            match cmd::run_unchecked("iptables", &args).await {
                Ok(out) if out.success() => return true,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "could not query iptables");
                    return false;
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> KillswitchRules {
        KillswitchRules::for_host(109, "eth0")
    }

    fn rendered(plan: &[Step]) -> String {
        plan.iter()
            .map(|s| format!("{} {}", s.family.binary(), s.args.join(" ")))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn plan_is_deterministic() {
        let r = rules();
        assert_eq!(rendered(&engage_plan(&r)), rendered(&engage_plan(&r)));
    }

    #[test]
    fn chains_are_built_before_they_are_hooked() {
        let text = rendered(&engage_plan(&rules()));
        let built = text.find("-A ANONMGR_OUT -j DROP").unwrap();
        let hooked = text.find("-I OUTPUT 1 -j ANONMGR_OUT").unwrap();
        assert!(built < hooked);
    }

    #[test]
    fn outbound_semantics_match_the_modern_backend() {
        let text = rendered(&engage_plan(&rules()));
        assert!(text.contains("-A ANONMGR_OUT -o lo -j ACCEPT"));
        assert!(text.contains("--state ESTABLISHED,RELATED -j ACCEPT"));
        assert!(text.contains("-m owner --uid-owner 109 -j ACCEPT"));
        assert!(text.contains("-A ANONMGR_OUT -d 10.200.1.0/24 -j ACCEPT"));
        assert!(text.contains("-p udp --sport 68 --dport 67 -j ACCEPT"));
        assert!(text.contains("--dports 443,853 -j REJECT --reject-with tcp-reset"));
        assert!(text.contains("-p udp -m multiport --dports 3478,5349,19302 -j DROP"));
        assert!(text.contains("-p tcp -m multiport --dports 3478,5349 -j DROP"));
        assert!(text.contains("! -d 10.200.1.1 -p udp --dport 5353 -j DROP"));
        assert!(text.contains("-j LOG --log-prefix anonmanager-drop: "));
    }

    #[test]
    fn nat_returns_early_then_redirects() {
        let plan = engage_plan(&rules());
        let text = rendered(&plan);
        let owner_return = text.find("-t nat -A ANONMGR_NAT -m owner --uid-owner 109 -j RETURN").unwrap();
        let dns_dnat = text.find("--dport 53 -j DNAT --to-destination 10.200.1.1:5353").unwrap();
        let syn_dnat = text.find("--syn -j DNAT --to-destination 10.200.1.1:9040").unwrap();
        assert!(owner_return < dns_dnat);
        assert!(dns_dnat < syn_dnat);
        assert!(text.contains("-t nat -A ANONMGR_POST -s 10.200.1.0/24 -o eth0 -j MASQUERADE"));
    }

    #[test]
    fn dns_only_plan_never_touches_the_filter_table() {
        let plan = dns_redirect_plan(&rules());
        assert!(plan.iter().all(|s| s.args.contains(&"nat".to_string())));
        let text = rendered(&plan);
        assert!(text.contains("--dport 53 -j DNAT --to-destination 10.200.1.1:5353"));
        assert!(!text.contains("DROP"));
        assert!(!text.contains("MASQUERADE"));
    }

    #[test]
    fn v6_is_policy_only_loopback_allow() {
        let plan = engage_plan(&rules());
        let v6: Vec<&Step> = plan.iter().filter(|s| s.family == Family::V6).collect();
        assert!(!v6.is_empty());
        // No v6 step touches the nat table.
        assert!(v6.iter().all(|s| !s.args.contains(&"nat".to_string())));
        let text = rendered(&plan);
        assert!(text.contains("ip6tables -A ANONMGR_OUT -o lo -j ACCEPT"));
        assert!(text.contains("ip6tables -A ANONMGR_OUT -j DROP"));
        assert!(text.contains("ip6tables -A ANONMGR_FWD -j DROP"));
    }
}
