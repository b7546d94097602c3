//! Address primitives shared by every router component: Ethernet MAC
//! addresses and small extensions over `ipnet`'s IPv4 CIDR type.
//!
//! IPv4 addresses themselves are `std::net::Ipv4Addr` throughout this
//! crate — there is no value in wrapping a type the standard library
//! already gives correct ordering and dotted-decimal `Display` for.

use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;

/// A 6-byte Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mac(pub [u8; 6]);

impl Mac {
    /// The broadcast address `ff:ff:ff:ff:ff:ff`.
    pub const BROADCAST: Mac = Mac([0xff; 6]);

    /// The all-zero address, used by some clients before they have an
    /// identity (e.g. a DHCPDISCOVER sender's hardware address is still
    /// meaningful, but a zeroed `sender_mac` in ARP should never be learned).
    pub const ZERO: Mac = Mac([0; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Mac(bytes)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for Mac {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl From<smoltcp::wire::EthernetAddress> for Mac {
    fn from(a: smoltcp::wire::EthernetAddress) -> Self {
        Mac(a.0)
    }
}

impl From<Mac> for smoltcp::wire::EthernetAddress {
    fn from(m: Mac) -> Self {
        smoltcp::wire::EthernetAddress(m.0)
    }
}

/// Derive a stable, locally-administered gateway MAC from a network id.
///
/// The router is reconstructed (not mutated) across restarts (see
/// design notes on config immutability), so the gateway MAC must be a
/// pure function of configuration rather than randomly generated, or a
/// restarted router would look like a different NIC to the guest.
///
/// Uses the FNV-1a hash of `network_id` to fill the low 5 bytes, sets the
/// locally-administered bit and clears the multicast bit in the first
/// byte per the standard convention for software-assigned MACs.
pub fn derive_gateway_mac(network_id: &str) -> Mac {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in network_id.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    let bytes = hash.to_be_bytes();
    let mut mac = [bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]];
    mac[0] = (mac[0] & 0xfc) | 0x02;
    Mac(mac)
}

/// Extensions over `ipnet::Ipv4Net` for the host-range arithmetic the
/// DHCP pool and firewall alias resolution need.
pub trait Ipv4NetExt {
    /// The first usable host address in the network (network address + 1).
    fn first_host(&self) -> Ipv4Addr;
    /// The last usable host address in the network (broadcast - 1).
    fn last_host(&self) -> Ipv4Addr;
}

impl Ipv4NetExt for Ipv4Net {
    fn first_host(&self) -> Ipv4Addr {
        let net = u32::from(self.network());
        Ipv4Addr::from(net.wrapping_add(1))
    }

    fn last_host(&self) -> Ipv4Addr {
        let bcast = u32::from(self.broadcast());
        Ipv4Addr::from(bcast.wrapping_sub(1))
    }
}

/// `C.contains(X) <-> (X.raw & C.mask) == C.network.raw` — the invariant
/// this crate relies on throughout for alias/firewall/DHCP-pool checks.
/// Exercised directly in the unit test below since `ipnet` itself is an
/// external dependency whose contract we depend on.
#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn mac_broadcast_and_zero_are_distinct() {
        assert!(Mac::BROADCAST.is_broadcast());
        assert!(!Mac::BROADCAST.is_zero());
        assert!(Mac::ZERO.is_zero());
        assert!(!Mac::ZERO.is_broadcast());
    }

    #[test]
    fn mac_display_is_lowercase_colon_hex() {
        let mac = Mac([0x02, 0xAA, 0x00, 0x01, 0x02, 0x03]);
        assert_eq!(mac.to_string(), "02:aa:00:01:02:03");
    }

    #[test]
    fn gateway_mac_is_stable_and_locally_administered() {
        let a = derive_gateway_mac("lan-0");
        let b = derive_gateway_mac("lan-0");
        let c = derive_gateway_mac("lan-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.0[0] & 0x02, 0x02, "locally-administered bit must be set");
        assert_eq!(a.0[0] & 0x01, 0x00, "multicast bit must be clear");
    }

    #[test]
    fn cidr_contains_matches_mask_arithmetic() {
        let net = Ipv4Net::from_str("10.100.0.0/24").unwrap();
        for ip in ["10.100.0.1", "10.100.0.254"] {
            assert!(net.contains(&Ipv4Addr::from_str(ip).unwrap()));
        }
        assert!(!net.contains(&Ipv4Addr::from_str("10.100.1.1").unwrap()));
    }

    #[test]
    fn first_and_last_host() {
        let net = Ipv4Net::from_str("10.100.0.0/24").unwrap();
        assert_eq!(net.first_host(), Ipv4Addr::new(10, 100, 0, 1));
        assert_eq!(net.last_host(), Ipv4Addr::new(10, 100, 0, 254));
    }
}
