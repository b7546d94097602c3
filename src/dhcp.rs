//! DHCP server: a minimal RFC 2131 subset (DISCOVER/OFFER, REQUEST/ACK or
//! NAK, RELEASE) over a pool of leasable addresses plus static reservations.
//!
//! Message parsing/building goes through `dhcproto`, the same crate the
//! teacher's link-local DHCP server (`reactor/dhcp.rs`) uses; this version
//! generalizes it from a fixed single-VM `/32` assignment to a real pool
//! with static reservations, lease expiry, and pending-offer tracking.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use dhcproto::v4::{DhcpOption, Flags, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Decoder, Encodable, Encoder};
use tracing::{debug, warn};

use crate::address::Mac;
use crate::config::{DhcpConfig, DnsMode, LanConfig};
use crate::packet::{UdpDatagram, build_udp_datagram};
use crate::ratelimit::LogGate;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// How long a pending offer holds its IP before another DISCOVER can
/// reclaim it, per spec §4.3 "a DHCP transaction (a few seconds)".
const OFFER_TIMEOUT: Duration = Duration::from_secs(10);

/// One active lease: an IP a MAC currently holds until `expiry`.
#[derive(Debug, Clone)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub mac: Mac,
    pub expiry: Instant,
    pub hostname: Option<String>,
}

/// A read-only view of one lease for the snapshot API.
#[derive(Debug, Clone)]
pub struct LeaseView {
    pub ip: Ipv4Addr,
    pub mac: Mac,
    pub expires_in: Duration,
    pub hostname: Option<String>,
}

struct PendingOffer {
    ip: Ipv4Addr,
    offered_at: Instant,
}

/// Lease table: active leases keyed by MAC, plus pending (not-yet-ACKed)
/// offers. The invariant from spec §3 — every MAC appears at most once
/// among active leases, and every IP appears at most once across active
/// leases + pending offers + static reservations — is maintained by
/// [`DhcpServer::allocate`] never handing out an IP already held by
/// another entry in any of those three sets.
#[derive(Debug, Default)]
pub struct LeaseTable {
    active: HashMap<Mac, Lease>,
    pending: HashMap<Mac, PendingOffer>,
    pool_exhausted_gate: LogGate,
}

impl LeaseTable {
    pub fn new() -> Self {
        LeaseTable::default()
    }

    fn ip_in_use(&self, ip: Ipv4Addr, now: Instant) -> Option<Mac> {
        for (mac, lease) in &self.active {
            if lease.ip == ip && lease.expiry > now {
                return Some(*mac);
            }
        }
        for (mac, offer) in &self.pending {
            if offer.ip == ip && now.duration_since(offer.offered_at) < OFFER_TIMEOUT {
                return Some(*mac);
            }
        }
        None
    }

    /// Remove every lease whose TTL has elapsed and every pending offer
    /// older than the DORA transaction window. Invoked by the
    /// orchestrator's periodic sweep and opportunistically on every
    /// DISCOVER/REQUEST.
    pub fn purge_expired(&mut self, now: Instant) {
        self.active.retain(|_, lease| lease.expiry > now);
        self.pending
            .retain(|_, offer| now.duration_since(offer.offered_at) < OFFER_TIMEOUT);
    }

    pub fn leases(&self) -> impl Iterator<Item = &Lease> {
        self.active.values()
    }

    /// Drop every active lease and pending offer. Called by the
    /// orchestrator on `stop`.
    pub fn clear(&mut self) {
        self.active.clear();
        self.pending.clear();
    }

    pub fn snapshot(&self, now: Instant) -> Vec<LeaseView> {
        self.active
            .values()
            .map(|l| LeaseView {
                ip: l.ip,
                mac: l.mac,
                expires_in: l.expiry.saturating_duration_since(now),
                hostname: l.hostname.clone(),
            })
            .collect()
    }
}

/// DHCP server: binds a [`LeaseTable`] to a [`LanConfig`]/[`DhcpConfig`]
/// pair and answers DISCOVER/REQUEST/RELEASE messages arriving as UDP
/// payloads addressed to the gateway's port 67.
pub struct DhcpServer<'a> {
    pub lan: &'a LanConfig,
    pub config: &'a DhcpConfig,
    pub dns: &'a DnsMode,
}

/// Outcome of handling one DHCP message: a response frame to send back
/// to the guest, and — on ACK — the binding the ARP responder should
/// learn immediately (spec §4.3 "side effect").
pub struct DhcpOutcome {
    pub frame: Vec<u8>,
    pub arp_binding: Option<(Ipv4Addr, Mac)>,
}

impl<'a> DhcpServer<'a> {
    pub fn new(lan: &'a LanConfig, config: &'a DhcpConfig, dns: &'a DnsMode) -> Self {
        DhcpServer { lan, config, dns }
    }

    /// Handle one UDP datagram addressed to the gateway's DHCP server
    /// port. `client_mac` is the frame's Ethernet source address.
    pub fn handle(
        &self,
        leases: &mut LeaseTable,
        client_mac: Mac,
        datagram: &UdpDatagram<'_>,
    ) -> Option<DhcpOutcome> {
        if datagram.dst_port != DHCP_SERVER_PORT {
            return None;
        }
        let msg = Message::decode(&mut Decoder::new(datagram.payload)).ok()?;
        if msg.opcode() != Opcode::BootRequest {
            return None;
        }
        let msg_type = match msg.opts().get(OptionCode::MessageType) {
            Some(DhcpOption::MessageType(t)) => *t,
            _ => return None,
        };

        let now = Instant::now();
        leases.purge_expired(now);

        debug!(
            msg_type = ?msg_type,
            xid = format!("{:08x}", msg.xid()).as_str(),
            client_mac = %client_mac,
            "DHCP message received"
        );

        match msg_type {
            MessageType::Discover => self.handle_discover(leases, client_mac, &msg, now),
            MessageType::Request => self.handle_request(leases, client_mac, &msg, now),
            MessageType::Release => {
                self.handle_release(leases, client_mac);
                None
            }
            _ => None,
        }
    }

    /// Find the IP this MAC should be offered, per the allocation order
    /// in spec §4.3: static reservation, existing active lease, pending
    /// offer, then lowest free address in the pool.
    fn allocate(&self, leases: &LeaseTable, mac: Mac, now: Instant) -> Option<Ipv4Addr> {
        if let Some(reservation) = self.config.static_leases.iter().find(|r| r.mac == mac) {
            return Some(reservation.ip);
        }
        if let Some(lease) = leases.active.get(&mac)
            && lease.expiry > now
        {
            return Some(lease.ip);
        }
        if let Some(offer) = leases.pending.get(&mac)
            && now.duration_since(offer.offered_at) < OFFER_TIMEOUT
        {
            return Some(offer.ip);
        }

        let start = u32::from(self.config.pool_start);
        let end = u32::from(self.config.pool_end);
        let reserved: std::collections::HashSet<Ipv4Addr> = self
            .config
            .static_leases
            .iter()
            .map(|r| r.ip)
            .collect();
        (start..=end).map(Ipv4Addr::from).find(|ip| {
            !reserved.contains(ip) && leases.ip_in_use(*ip, now).is_none_or(|holder| holder == mac)
        })
    }

    fn handle_discover(
        &self,
        leases: &mut LeaseTable,
        mac: Mac,
        request: &Message,
        now: Instant,
    ) -> Option<DhcpOutcome> {
        let Some(ip) = self.allocate(leases, mac, now) else {
            if leases.pool_exhausted_gate.fire(now) {
                warn!(client_mac = %mac, "DHCP pool exhausted, no OFFER sent");
            }
            return None;
        };

        leases.pending.insert(
            mac,
            PendingOffer {
                ip,
                offered_at: now,
            },
        );

        debug!(client_mac = %mac, offered_ip = %ip, "sending DHCPOFFER");
        let frame = self.build_reply(request, mac, ip, MessageType::Offer);
        Some(DhcpOutcome {
            frame,
            arp_binding: None,
        })
    }

    fn handle_request(
        &self,
        leases: &mut LeaseTable,
        mac: Mac,
        request: &Message,
        now: Instant,
    ) -> Option<DhcpOutcome> {
        let requested_ip = match request.opts().get(OptionCode::RequestedIpAddress) {
            Some(DhcpOption::RequestedIpAddress(ip)) => Some(*ip),
            _ => None,
        };
        let requested_ip = requested_ip.or(if request.ciaddr() != Ipv4Addr::UNSPECIFIED {
            Some(request.ciaddr())
        } else {
            None
        })?;

        let static_reservation = self
            .config
            .static_leases
            .iter()
            .find(|r| r.mac == mac)
            .map(|r| r.ip);
        let in_range = u32::from(requested_ip) >= u32::from(self.config.pool_start)
            && u32::from(requested_ip) <= u32::from(self.config.pool_end);
        let held_by_other = leases.ip_in_use(requested_ip, now).is_some_and(|h| h != mac);

        let valid = match static_reservation {
            Some(reserved_ip) => requested_ip == reserved_ip,
            None => in_range && !held_by_other,
        };

        if !valid {
            warn!(client_mac = %mac, requested_ip = %requested_ip, "DHCP REQUEST invalid, sending NAK");
            return Some(DhcpOutcome {
                frame: self.build_nak(request, mac),
                arp_binding: None,
            });
        }

        leases.pending.remove(&mac);
        leases.active.insert(
            mac,
            Lease {
                ip: requested_ip,
                mac,
                expiry: now + self.config.lease_ttl,
                hostname: static_reservation_hostname(self.config, mac),
            },
        );

        debug!(client_mac = %mac, assigned_ip = %requested_ip, "sending DHCPACK");
        let frame = self.build_reply(request, mac, requested_ip, MessageType::Ack);
        Some(DhcpOutcome {
            frame,
            arp_binding: Some((requested_ip, mac)),
        })
    }

    fn handle_release(&self, leases: &mut LeaseTable, mac: Mac) {
        if leases.active.remove(&mac).is_some() {
            debug!(client_mac = %mac, "DHCP lease released");
        }
    }

    fn build_reply(&self, request: &Message, mac: Mac, ip: Ipv4Addr, msg_type: MessageType) -> Vec<u8> {
        let mut response = Message::default();
        response.set_opcode(Opcode::BootReply);
        response.set_htype(request.htype());
        response.set_xid(request.xid());
        response.set_flags(request.flags());
        response.set_yiaddr(ip);
        response.set_siaddr(self.lan.gateway);
        response.set_chaddr(request.chaddr());
        if request.flags().broadcast() {
            response.set_flags(Flags::default().set_broadcast());
        }

        let opts = response.opts_mut();
        opts.insert(DhcpOption::MessageType(msg_type));
        opts.insert(DhcpOption::ServerIdentifier(self.lan.gateway));
        opts.insert(DhcpOption::AddressLeaseTime(
            self.config.lease_ttl.as_secs() as u32,
        ));
        opts.insert(DhcpOption::SubnetMask(Ipv4Addr::from(
            u32::from(Ipv4Addr::BROADCAST) << (32 - self.lan.subnet.prefix_len()),
        )));
        opts.insert(DhcpOption::Router(vec![self.lan.gateway]));
        let dns_servers = self.dns.dhcp_servers();
        if !dns_servers.is_empty() {
            opts.insert(DhcpOption::DomainNameServer(dns_servers));
        }

        let mut dhcp_bytes = Vec::new();
        response
            .encode(&mut Encoder::new(&mut dhcp_bytes))
            .expect("DHCP message always encodes");
        pad_to(&mut dhcp_bytes, 300);

        self.wrap(mac, ip, request, &dhcp_bytes)
    }

    fn build_nak(&self, request: &Message, mac: Mac) -> Vec<u8> {
        let mut response = Message::default();
        response.set_opcode(Opcode::BootReply);
        response.set_htype(request.htype());
        response.set_xid(request.xid());
        response.set_chaddr(request.chaddr());
        let opts = response.opts_mut();
        opts.insert(DhcpOption::MessageType(MessageType::Nak));
        opts.insert(DhcpOption::ServerIdentifier(self.lan.gateway));

        let mut dhcp_bytes = Vec::new();
        response
            .encode(&mut Encoder::new(&mut dhcp_bytes))
            .expect("DHCP message always encodes");
        pad_to(&mut dhcp_bytes, 300);

        self.wrap(mac, Ipv4Addr::UNSPECIFIED, request, &dhcp_bytes)
    }

    /// Wrap a DHCP message in UDP/IPv4/Ethernet headers, 67 -> 68,
    /// destined to `yiaddr` when assigned or the broadcast address
    /// otherwise (spec §4.3 "Response construction").
    fn wrap(&self, mac: Mac, yiaddr: Ipv4Addr, request: &Message, dhcp_bytes: &[u8]) -> Vec<u8> {
        let broadcast = request.flags().broadcast() || yiaddr == Ipv4Addr::UNSPECIFIED;
        let dst_ip = if broadcast {
            Ipv4Addr::BROADCAST
        } else {
            yiaddr
        };
        let dst_mac = if broadcast { crate::address::Mac::BROADCAST } else { mac };

        build_udp_datagram(
            self.lan.gateway_mac,
            dst_mac,
            self.lan.gateway,
            dst_ip,
            DHCP_SERVER_PORT,
            DHCP_CLIENT_PORT,
            dhcp_bytes,
        )
    }
}

fn static_reservation_hostname(config: &DhcpConfig, mac: Mac) -> Option<String> {
    config
        .static_leases
        .iter()
        .find(|r| r.mac == mac)
        .and_then(|r| r.hostname.clone())
}

fn pad_to(buf: &mut Vec<u8>, len: usize) {
    if buf.len() < len {
        buf.resize(len, 0);
    }
}
