//! Which destinations the relay will connect to.
//!
//! By default the relay only reaches globally routable unicast addresses,
//! so a peer can't use it to probe the relay's own LAN or loopback services.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::proxy::socks5::{Destination, Host};

/// True for addresses that are not global unicast.
pub fn is_non_unicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_non_unicast_v4(v4),
        IpAddr::V6(v6) => is_non_unicast_v6(v6),
    }
}

fn is_non_unicast_v4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || ip.is_documentation()
        // 0.0.0.0/8 "this network"
        || octets[0] == 0
        // 100.64.0.0/10 carrier-grade NAT
        || (octets[0] == 100 && (octets[1] & 0xC0) == 64)
        // 240.0.0.0/4 reserved
        || octets[0] >= 240
}

fn is_non_unicast_v6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_non_unicast_v4(v4);
    }
    let first = ip.segments()[0];
    ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_multicast()
        // fc00::/7 unique local
        || (first & 0xFE00) == 0xFC00
        // fe80::/10 link local
        || (first & 0xFFC0) == 0xFE80
}

/// Destination filter applied by the relay before and after resolution.
#[derive(Debug, Clone, Copy)]
pub struct DestinationPolicy {
    allow_non_unicast: bool,
}

impl DestinationPolicy {
    pub fn new(allow_non_unicast: bool) -> Self {
        Self { allow_non_unicast }
    }

    pub fn allows_non_unicast(&self) -> bool {
        self.allow_non_unicast
    }

    /// Check an IP literal destination. Domains pass until resolved.
    pub fn permits(&self, destination: &Destination) -> bool {
        match destination.host {
            Host::Ipv4(ip) => self.permits_addr(IpAddr::V4(ip)),
            Host::Domain(_) => true,
        }
    }

    /// Check a resolved address.
    pub fn permits_addr(&self, ip: IpAddr) -> bool {
        self.allow_non_unicast || !is_non_unicast(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_unicast_classification() {
        for blocked in [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "169.254.0.1",
            "224.0.0.1",
            "255.255.255.255",
            "0.0.0.0",
            "100.64.0.1",
            "::1",
            "fe80::1",
            "fd00::1",
            "::ffff:127.0.0.1",
        ] {
            assert!(is_non_unicast(blocked.parse().unwrap()), "{}", blocked);
        }

        for allowed in ["1.1.1.1", "93.184.216.34", "2606:4700::1111"] {
            assert!(!is_non_unicast(allowed.parse().unwrap()), "{}", allowed);
        }
    }

    #[test]
    fn test_policy() {
        let strict = DestinationPolicy::new(false);
        assert!(!strict.permits(&Destination::ipv4(Ipv4Addr::LOCALHOST, 80)));
        assert!(strict.permits(&Destination::ipv4(Ipv4Addr::new(1, 2, 3, 4), 80)));
        assert!(strict.permits(&Destination::domain("localhost", 80).unwrap()));
        assert!(!strict.permits_addr("127.0.0.1".parse().unwrap()));

        let open = DestinationPolicy::new(true);
        assert!(open.permits(&Destination::ipv4(Ipv4Addr::LOCALHOST, 80)));
    }
}
