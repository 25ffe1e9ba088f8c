//! The isolation fabric is fixed: one namespace, one veth pair, one /24.
//! These values are wired into the firewall rules, the torrc, and the DNS
//! lock, and must not change while the system is active.

use std::net::Ipv4Addr;

pub const NS_NAME: &str = "anonspace";
pub const VETH_HOST: &str = "veth_host";
pub const VETH_NS: &str = "veth_tor";

pub const TOR_IP: Ipv4Addr = Ipv4Addr::new(10, 200, 1, 1);
pub const HOST_IP: Ipv4Addr = Ipv4Addr::new(10, 200, 1, 2);
pub const SUBNET: &str = "10.200.1.0/24";
pub const PREFIX_LEN: u8 = 24;

pub const SOCKS_PORT: u16 = 9050;
pub const CONTROL_PORT: u16 = 9051;
pub const DNS_PORT: u16 = 5353;
pub const TRANS_PORT: u16 = 9040;

/// Name under which all firewall objects are created, so that teardown and
/// liveness checks can find them regardless of backend.
pub const FIREWALL_NAMESPACE: &str = "anonmanager";

/// Well-known DNS-over-HTTPS resolver addresses, rejected on 443/853 so that
/// a misconfigured client fails fast instead of leaking around the DNAT.
pub const DOH_RESOLVERS: &[Ipv4Addr] = &[
    Ipv4Addr::new(1, 1, 1, 1),
    Ipv4Addr::new(1, 0, 0, 1),
    Ipv4Addr::new(8, 8, 8, 8),
    Ipv4Addr::new(8, 8, 4, 4),
    Ipv4Addr::new(9, 9, 9, 9),
    Ipv4Addr::new(149, 112, 112, 112),
    Ipv4Addr::new(94, 140, 14, 14),
    Ipv4Addr::new(94, 140, 15, 15),
];

/// STUN/TURN ports used by WebRTC, a classic source-address leak.
pub const WEBRTC_UDP_PORTS: &[u16] = &[3478, 5349, 19302];
pub const WEBRTC_TCP_PORTS: &[u16] = &[3478, 5349];

/// Port set Tor binds inside the namespace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TorEndpoint {
    pub address: Ipv4Addr,
    pub socks_port: u16,
    pub control_port: u16,
    pub dns_port: u16,
    pub trans_port: u16,
}

impl Default for TorEndpoint {
    fn default() -> Self {
        Self {
            address: TOR_IP,
            socks_port: SOCKS_PORT,
            control_port: CONTROL_PORT,
            dns_port: DNS_PORT,
            trans_port: TRANS_PORT,
        }
    }
}

/// Logical killswitch specification, independent of the backend that will
/// compile it into native rules.
#[derive(Clone, Debug)]
pub struct KillswitchRules {
    pub tor_uid: u32,
    pub egress_iface: String,
    pub ns_subnet: String,
    pub tor: TorEndpoint,
    pub doh_blocklist: Vec<Ipv4Addr>,
    pub webrtc_udp_ports: Vec<u16>,
    pub webrtc_tcp_ports: Vec<u16>,
}

impl KillswitchRules {
    /// Rules for this host: the fixed topology plus the two probed values.
    pub fn for_host(tor_uid: u32, egress_iface: impl Into<String>) -> Self {
        Self {
            tor_uid,
            egress_iface: egress_iface.into(),
            ns_subnet: SUBNET.to_string(),
            tor: TorEndpoint::default(),
            doh_blocklist: DOH_RESOLVERS.to_vec(),
            webrtc_udp_ports: WEBRTC_UDP_PORTS.to_vec(),
            webrtc_tcp_ports: WEBRTC_TCP_PORTS.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_defaults_match_the_wired_topology() {
        let ep = TorEndpoint::default();
        assert_eq!(ep.address, TOR_IP);
        assert_eq!(ep.socks_port, 9050);
        assert_eq!(ep.control_port, 9051);
        assert_eq!(ep.dns_port, 5353);
        assert_eq!(ep.trans_port, 9040);
    }

    #[test]
    fn host_and_tor_share_the_subnet() {
        assert!(SUBNET.starts_with("10.200.1."));
        assert_eq!(TOR_IP.octets()[..3], HOST_IP.octets()[..3]);
    }
}
