//! `mvirt-net`: the user-space L2/L3 router between a guest vNIC and the
//! host, and the hardest, most distinctive subsystem of the VM manager it
//! is carved out of (see DESIGN.md).
//!
//! The router answers ARP, leases IPs over DHCP, forwards DNS, performs
//! stateful NAT for outbound TCP/UDP, enforces a rule-based firewall, and
//! exposes inbound port-forward listeners. It consumes a guest channel and
//! an upstream socket factory from its host and exposes a `start`/`stop`
//! lifecycle plus a read-only snapshot of its tables — see
//! [`orchestrator::Router`].

pub mod address;
pub mod arp;
pub mod channel;
pub mod config;
pub mod dhcp;
pub mod dns;
pub mod error;
pub mod firewall;
pub mod nat;
pub mod orchestrator;
pub mod packet;
pub mod port_forward;
pub mod ratelimit;
pub mod tap;

#[cfg(any(test, feature = "test-util"))]
pub mod test_util;
