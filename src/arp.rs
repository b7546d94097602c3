//! ARP responder and address table.
//!
//! The router answers ARP requests for its own gateway IP and learns the
//! guest's MAC from any ARP traffic it observes, the same "respond for
//! the gateway, learn everything else" policy the teacher's vhost-user
//! ARP handler used for a single fixed gateway, generalized here to a
//! per-router gateway IP/MAC pair.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tracing::debug;

use crate::address::Mac;
use crate::config::LanConfig;
use crate::packet::{ArpMessage, ArpOp, build_arp_reply};

/// Learned guest IP -> MAC bindings, keyed by IP since a guest is
/// expected to present one IP per its DHCP lease.
#[derive(Debug, Default)]
pub struct ArpTable {
    entries: HashMap<Ipv4Addr, Mac>,
}

impl ArpTable {
    pub fn new() -> Self {
        ArpTable::default()
    }

    pub fn learn(&mut self, ip: Ipv4Addr, mac: Mac) {
        if mac.is_zero() || mac.is_broadcast() {
            return;
        }
        self.entries.insert(ip, mac);
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<Mac> {
        self.entries.get(&ip).copied()
    }

    pub fn forget(&mut self, ip: Ipv4Addr) {
        self.entries.remove(&ip);
    }

    /// Drop every learned binding. Called by the orchestrator on `stop`.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Read-only view of the table for [`crate::orchestrator::RouterSnapshot`].
    pub fn iter(&self) -> impl Iterator<Item = (Ipv4Addr, Mac)> + '_ {
        self.entries.iter().map(|(ip, mac)| (*ip, *mac))
    }
}

/// Handle one parsed ARP message from the guest.
///
/// Always learns the sender's IP/MAC binding. Returns `Some(frame)` when
/// the request is for the gateway's own IP and a reply should be sent
/// back to the guest; returns `None` for replies, gratuitous announcements,
/// and requests for any IP other than the gateway (this router does not
/// proxy ARP for other hosts — see spec Non-goals).
pub fn handle_arp(table: &mut ArpTable, lan: &LanConfig, msg: ArpMessage) -> Option<Vec<u8>> {
    table.learn(msg.sender_ip, msg.sender_mac);

    if msg.operation != ArpOp::Request {
        return None;
    }

    if msg.target_ip != lan.gateway {
        debug!(
            target_ip = %msg.target_ip,
            gateway = %lan.gateway,
            "ARP request not for gateway, ignoring"
        );
        return None;
    }

    debug!(
        requester_mac = %msg.sender_mac,
        requester_ip = %msg.sender_ip,
        "ARP request for gateway, sending reply"
    );

    Some(build_arp_reply(
        lan.gateway_mac,
        lan.gateway,
        msg.sender_mac,
        msg.sender_ip,
    ))
}
