//! DNS forwarder: relays guest queries addressed to the gateway's port 53
//! to an upstream resolver chosen by [`crate::config::DnsMode`], and
//! rewrites the reply to appear to come from the gateway.
//!
//! Per spec §9 "DNS transaction demux", outstanding queries are keyed by
//! `(client_ip, client_port, xid)` rather than passed through blindly —
//! this lets [`DnsForwarder::clear`] cancel exactly the in-flight queries
//! belonging to a stopped router, and lets a duplicate retransmission of
//! the same query reuse rather than duplicate the outstanding wait.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::address::Mac;
use crate::channel::UpstreamSocketFactory;
use crate::config::DnsMode;
use crate::packet::{UdpDatagram, build_udp_datagram};

pub const DNS_PORT: u16 = 53;

/// Hard deadline for an outstanding query, per spec §4.4.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct QueryKey {
    client_ip: Ipv4Addr,
    client_port: u16,
    xid: u16,
}

/// DNS forwarder. One instance per router; stateless apart from the
/// table of in-flight queries needed for cancellation on `stop`.
pub struct DnsForwarder {
    factory: Arc<dyn UpstreamSocketFactory>,
    egress: mpsc::UnboundedSender<Vec<u8>>,
    gateway: Ipv4Addr,
    gateway_mac: Mac,
    outstanding: Arc<Mutex<HashMap<QueryKey, AbortHandle>>>,
}

impl DnsForwarder {
    pub fn new(
        factory: Arc<dyn UpstreamSocketFactory>,
        egress: mpsc::UnboundedSender<Vec<u8>>,
        gateway: Ipv4Addr,
        gateway_mac: Mac,
    ) -> Self {
        DnsForwarder {
            factory,
            egress,
            gateway,
            gateway_mac,
            outstanding: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().unwrap().len()
    }

    /// Abandon every in-flight query. Any upstream response that later
    /// arrives for an already-cancelled task is simply never delivered.
    pub fn clear(&self) {
        for (_, handle) in self.outstanding.lock().unwrap().drain() {
            handle.abort();
        }
    }

    /// Handle one UDP datagram addressed to the gateway's DNS port.
    /// `dns` selects drop/forward behavior and the resolver list.
    pub async fn handle_query(&self, dns: &DnsMode, client_mac: Mac, datagram: UdpDatagram<'_>) {
        if matches!(dns, DnsMode::Blocked) {
            trace!("DNS query dropped, mode=blocked");
            return;
        }
        let resolvers = dns.upstream_resolvers();
        if resolvers.is_empty() {
            return;
        }
        if datagram.payload.len() < 2 {
            return;
        }
        let xid = u16::from_be_bytes([datagram.payload[0], datagram.payload[1]]);

        let key = QueryKey {
            client_ip: datagram.src_ip,
            client_port: datagram.src_port,
            xid,
        };

        if self.outstanding.lock().unwrap().contains_key(&key) {
            debug!(?key, "duplicate in-flight DNS query, ignoring retransmission");
            return;
        }

        let query = datagram.payload.to_vec();
        let client_ip = datagram.src_ip;
        let client_port = datagram.src_port;
        let gateway = self.gateway;
        let gateway_mac = self.gateway_mac;
        let egress = self.egress.clone();
        let outstanding = Arc::clone(&self.outstanding);
        let factory = Arc::clone(&self.factory);

        let task = tokio::spawn(async move {
            Self::run_query(
                factory.as_ref(),
                &resolvers,
                query,
                client_mac,
                client_ip,
                client_port,
                gateway,
                gateway_mac,
                egress,
            )
            .await;
            outstanding.lock().unwrap().remove(&key);
        });
        self.outstanding.lock().unwrap().insert(key, task.abort_handle());
    }

    /// Try each of `resolvers` in order, falling through to the next one
    /// on a connect failure, send failure, or receive timeout. Gives up
    /// silently once every resolver has been exhausted, per spec §4.4's
    /// "forward to the first reachable upstream resolver".
    #[allow(clippy::too_many_arguments)]
    async fn run_query(
        factory: &dyn UpstreamSocketFactory,
        resolvers: &[Ipv4Addr],
        query: Vec<u8>,
        client_mac: Mac,
        client_ip: Ipv4Addr,
        client_port: u16,
        gateway: Ipv4Addr,
        gateway_mac: Mac,
        egress: mpsc::UnboundedSender<Vec<u8>>,
    ) {
        for (i, &resolver) in resolvers.iter().enumerate() {
            let remote = SocketAddrV4::new(resolver, DNS_PORT);
            let mut socket = match factory.connect_udp(remote).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, resolver = %resolver, "failed to open upstream DNS socket");
                    continue;
                }
            };

            if let Err(e) = socket.send(&query).await {
                warn!(error = %e, resolver = %resolver, "DNS upstream send failed");
                continue;
            }

            match tokio::time::timeout(QUERY_TIMEOUT, socket.receive()).await {
                Ok(Ok(response)) => {
                    let frame = build_udp_datagram(
                        gateway_mac,
                        client_mac,
                        gateway,
                        client_ip,
                        DNS_PORT,
                        client_port,
                        &response,
                    );
                    trace!(client = %client_ip, resolver = %resolver, "DNS response relayed to guest");
                    let _ = egress.send(frame);
                    return;
                }
                Ok(Err(e)) => {
                    warn!(error = %e, resolver = %resolver, "DNS upstream receive failed");
                }
                Err(_) => {
                    debug!(
                        client = %client_ip,
                        client_port,
                        resolver = %resolver,
                        "DNS query to resolver timed out, trying next"
                    );
                }
            }

            if i + 1 == resolvers.len() {
                debug!(client = %client_ip, client_port, "DNS query dropped, every resolver unreachable");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{MockUpstreamSocketFactory, mac};
    use std::str::FromStr;
    use std::time::Duration as StdDuration;

    fn dns_query(xid: u16) -> Vec<u8> {
        let mut buf = vec![0u8; 12];
        buf[0..2].copy_from_slice(&xid.to_be_bytes());
        buf
    }

    #[tokio::test]
    async fn blocked_mode_drops_query_without_opening_socket() {
        let (factory, _inbox) = MockUpstreamSocketFactory::new();
        let (egress_tx, mut egress_rx) = mpsc::unbounded_channel();
        let forwarder = DnsForwarder::new(
            Arc::new(factory),
            egress_tx,
            Ipv4Addr::new(10, 100, 0, 1),
            mac(1),
        );
        let payload = dns_query(0xabcd);
        let datagram = UdpDatagram {
            src_ip: Ipv4Addr::new(10, 100, 0, 10),
            dst_ip: Ipv4Addr::new(10, 100, 0, 1),
            src_port: 44000,
            dst_port: DNS_PORT,
            payload: &payload,
        };
        forwarder.handle_query(&DnsMode::Blocked, mac(0x10), datagram).await;
        assert!(egress_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn forwards_query_and_relays_response_from_gateway() {
        let (factory, inbox) = MockUpstreamSocketFactory::new();
        let (egress_tx, mut egress_rx) = mpsc::unbounded_channel();
        let forwarder = DnsForwarder::new(
            Arc::new(factory),
            egress_tx,
            Ipv4Addr::new(10, 100, 0, 1),
            mac(1),
        );
        let resolver = DnsMode::Custom(vec![Ipv4Addr::from_str("1.1.1.1").unwrap()]);
        let payload = dns_query(0xbeef);
        let datagram = UdpDatagram {
            src_ip: Ipv4Addr::new(10, 100, 0, 10),
            dst_ip: Ipv4Addr::new(10, 100, 0, 1),
            src_port: 44000,
            dst_port: DNS_PORT,
            payload: &payload,
        };
        forwarder.handle_query(&resolver, mac(0x10), datagram).await;

        // Give the background task a moment to send, then push the
        // resolver's reply through the mock inbox.
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        let mut reply = vec![0u8; 12];
        reply[0..2].copy_from_slice(&0xbeefu16.to_be_bytes());
        inbox.push(
            SocketAddrV4::new(Ipv4Addr::from_str("1.1.1.1").unwrap(), DNS_PORT),
            reply,
        );

        let frame = tokio::time::timeout(StdDuration::from_secs(1), egress_rx.recv())
            .await
            .expect("response should arrive")
            .expect("channel open");
        match crate::packet::parse(&frame) {
            Some(crate::packet::ParsedPacket::Udp { datagram, .. }) => {
                assert_eq!(datagram.src_ip, Ipv4Addr::new(10, 100, 0, 1));
                assert_eq!(datagram.src_port, DNS_PORT);
                assert_eq!(datagram.dst_port, 44000);
            }
            other => panic!("expected UDP frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn falls_back_to_next_resolver_when_first_is_unreachable() {
        let (factory, inbox) = MockUpstreamSocketFactory::new();
        let unreachable = Ipv4Addr::from_str("203.0.113.53").unwrap();
        let reachable = Ipv4Addr::from_str("1.1.1.1").unwrap();
        factory.fail_connect(SocketAddrV4::new(unreachable, DNS_PORT));
        let (egress_tx, mut egress_rx) = mpsc::unbounded_channel();
        let forwarder = DnsForwarder::new(
            Arc::new(factory),
            egress_tx,
            Ipv4Addr::new(10, 100, 0, 1),
            mac(1),
        );
        let resolvers = DnsMode::Custom(vec![unreachable, reachable]);
        let payload = dns_query(0xfeed);
        let datagram = UdpDatagram {
            src_ip: Ipv4Addr::new(10, 100, 0, 10),
            dst_ip: Ipv4Addr::new(10, 100, 0, 1),
            src_port: 44000,
            dst_port: DNS_PORT,
            payload: &payload,
        };
        forwarder.handle_query(&resolvers, mac(0x10), datagram).await;

        tokio::time::sleep(StdDuration::from_millis(10)).await;
        let mut reply = vec![0u8; 12];
        reply[0..2].copy_from_slice(&0xfeedu16.to_be_bytes());
        inbox.push(SocketAddrV4::new(reachable, DNS_PORT), reply);

        let frame = tokio::time::timeout(StdDuration::from_secs(1), egress_rx.recv())
            .await
            .expect("response should arrive despite first resolver being unreachable")
            .expect("channel open");
        match crate::packet::parse(&frame) {
            Some(crate::packet::ParsedPacket::Udp { datagram, .. }) => {
                assert_eq!(datagram.src_ip, Ipv4Addr::new(10, 100, 0, 1));
                assert_eq!(datagram.dst_port, 44000);
            }
            other => panic!("expected UDP frame, got {other:?}"),
        }
        // The failed resolver was tried and rejected the connect; the
        // working one actually received the query.
        assert_eq!(inbox.sent(SocketAddrV4::new(reachable, DNS_PORT)).len(), 1);
    }
}
