//! Inbound port forwarding: host-side listeners that bridge accepted
//! connections into the guest's network via a companion upstream
//! connection, per spec §4.7.
//!
//! Each enabled rule gets one listener task. Each accepted connection
//! gets one pipe task pairing the accepted stream with a companion
//! connection opened through the same [`crate::channel::UpstreamSocketFactory`]
//! the NAT engine uses — "served by the NAT path in reverse," in the
//! spec's words, since from the internal side this looks like any other
//! TCP connection to `(internal_ip, internal_port)`.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::address::Mac;
use crate::channel::{AcceptedConnection, PortListenerFactory, Recv, UpstreamSocketFactory, UpstreamTcp};
use crate::config::{AliasTable, Direction, FirewallRule, L3Proto, L4Proto, Policy, PortForwardRule};
use crate::firewall::{self, FlowFlow, L3Flow};

/// The firewall context a [`PortForwarder`] evaluates every accepted
/// connection against, per spec §4.6 — inbound flows are checked here,
/// the same way [`crate::orchestrator::Router`] checks outbound flows
/// before handing them to NAT.
pub struct FirewallPolicy {
    pub rules: Vec<FirewallRule>,
    pub default: Policy,
    pub aliases: AliasTable,
}

/// Observable status of one configured port-forward rule, for
/// [`crate::orchestrator::RouterSnapshot`].
#[derive(Debug, Clone)]
pub struct PortForwardStatus {
    pub label: String,
    pub proto: L4Proto,
    pub external_port: u16,
    pub internal_ip: std::net::Ipv4Addr,
    pub internal_port: u16,
    pub listening: bool,
}

struct ActiveForward {
    rule: PortForwardRule,
    accept_loop: AbortHandle,
}

/// Owns every port-forward listener for the router's lifetime. Built
/// once at `start`, torn down at `stop`.
pub struct PortForwarder {
    forwards: Vec<ActiveForward>,
}

impl PortForwarder {
    /// Bind a listener for every enabled rule. Bind failures and
    /// unsupported protocols are logged and the rule is skipped, per
    /// spec §4.7 — this never fails `start`.
    pub async fn start(
        rules: &[PortForwardRule],
        listener_factory: Arc<dyn PortListenerFactory>,
        upstream_factory: Arc<dyn UpstreamSocketFactory>,
        firewall: Arc<FirewallPolicy>,
    ) -> Self {
        let mut forwards = Vec::new();
        for rule in rules {
            if !rule.enabled {
                continue;
            }
            match listener_factory.bind(rule.proto, rule.external_port).await {
                Ok(listener) => {
                    let rule = rule.clone();
                    let upstream_factory = Arc::clone(&upstream_factory);
                    let rule_for_task = rule.clone();
                    let firewall = Arc::clone(&firewall);
                    let handle = tokio::spawn(Self::run_accept_loop(
                        listener,
                        rule_for_task,
                        upstream_factory,
                        firewall,
                    ));
                    debug!(
                        label = %rule.label,
                        external_port = rule.external_port,
                        proto = ?rule.proto,
                        "port forward listener bound"
                    );
                    forwards.push(ActiveForward {
                        rule,
                        accept_loop: handle.abort_handle(),
                    });
                }
                Err(e) => {
                    warn!(
                        label = %rule.label,
                        external_port = rule.external_port,
                        proto = ?rule.proto,
                        error = %e,
                        "failed to bind port forward listener, skipping"
                    );
                }
            }
        }
        PortForwarder { forwards }
    }

    pub fn snapshot(&self) -> Vec<PortForwardStatus> {
        self.forwards
            .iter()
            .map(|f| PortForwardStatus {
                label: f.rule.label.clone(),
                proto: f.rule.proto,
                external_port: f.rule.external_port,
                internal_ip: f.rule.internal_ip,
                internal_port: f.rule.internal_port,
                listening: true,
            })
            .collect()
    }

    /// Cancel every listener and every in-flight pipe. Idempotent.
    pub fn stop(&mut self) {
        for forward in self.forwards.drain(..) {
            forward.accept_loop.abort();
        }
    }

    async fn run_accept_loop(
        mut listener: Box<dyn crate::channel::PortListener>,
        rule: PortForwardRule,
        upstream_factory: Arc<dyn UpstreamSocketFactory>,
        firewall: Arc<FirewallPolicy>,
    ) {
        loop {
            let accepted = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(label = %rule.label, error = %e, "port forward listener failed");
                    return;
                }
            };
            let internal = SocketAddrV4::new(rule.internal_ip, rule.internal_port);
            if !Self::firewall_allows_inbound(&firewall, &rule, accepted.peer, internal) {
                debug!(
                    label = %rule.label,
                    peer = %accepted.peer,
                    internal = %internal,
                    "port forward connection blocked by firewall"
                );
                continue;
            }
            let companion = match upstream_factory.connect_tcp(internal).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(
                        label = %rule.label,
                        internal = %internal,
                        error = %e,
                        "port forward companion connection failed"
                    );
                    continue;
                }
            };
            debug!(label = %rule.label, peer = %accepted.peer, internal = %internal, "port forward connection established");
            tokio::spawn(Self::pipe(accepted, companion));
        }
    }

    /// Byte-pipe data in both directions between the accepted client
    /// connection and its companion internal connection until either
    /// side closes or errors, then cancel both. This is the "cleanup
    /// pair" step from spec §9: a single routine owns both handles so
    /// neither outlives the other.
    async fn pipe(accepted: AcceptedConnection, mut companion: Box<dyn UpstreamTcp>) {
        let mut client = accepted.stream;
        loop {
            tokio::select! {
                result = client.receive() => {
                    match result {
                        Ok(Recv::Data(bytes)) => {
                            if companion.send(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Ok(Recv::Eof) | Err(_) => break,
                    }
                }
                result = companion.receive() => {
                    match result {
                        Ok(Recv::Data(bytes)) => {
                            if client.send(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Ok(Recv::Eof) | Err(_) => break,
                    }
                }
            }
        }
        client.cancel();
        companion.cancel();
    }

    /// Evaluate a just-accepted external connection against the firewall
    /// before opening its companion connection, per spec §4.6's
    /// inbound direction. Externally-originated connections arrive with
    /// no Ethernet frame and thus no real MAC identity to filter on, so
    /// L2 rules see a placeholder all-zero address on both ends and the
    /// IPv4 ethertype (the only kind of traffic a port forward ever
    /// carries); L3 matching uses the peer's actual address and the
    /// rule's internal endpoint, which is all a `Redirect`-style port
    /// forward has to offer.
    fn firewall_allows_inbound(
        firewall: &FirewallPolicy,
        rule: &PortForwardRule,
        peer: std::net::SocketAddr,
        internal: SocketAddrV4,
    ) -> bool {
        let src_ip = match peer.ip() {
            std::net::IpAddr::V4(ip) => ip,
            std::net::IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };
        let proto = match rule.proto {
            L4Proto::Tcp => L3Proto::Tcp,
            L4Proto::Udp => L3Proto::Udp,
        };
        let l3 = L3Flow {
            proto,
            src_ip,
            dst_ip: *internal.ip(),
            src_port: Some(peer.port()),
            dst_port: Some(internal.port()),
        };
        let flow = FlowFlow {
            direction: Direction::Inbound,
            eth_src: Mac::ZERO,
            eth_dst: Mac::ZERO,
            ethertype: crate::packet::ETHERTYPE_IPV4,
            l3: Some(&l3),
        };
        firewall::evaluate(&firewall.rules, firewall.default, &firewall.aliases, &flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AcceptedConnection, PortListenerFactory};
    use crate::test_util::{MockPortListenerFactory, MockUpstreamSocketFactory};
    use std::net::Ipv4Addr;

    fn forward_rule() -> PortForwardRule {
        PortForwardRule {
            proto: L4Proto::Tcp,
            external_port: 8080,
            internal_ip: Ipv4Addr::new(10, 100, 0, 10),
            internal_port: 80,
            enabled: true,
            label: "web".into(),
        }
    }

    fn allow_all_firewall() -> Arc<FirewallPolicy> {
        Arc::new(FirewallPolicy {
            rules: Vec::new(),
            default: Policy::Allow,
            aliases: AliasTable::default(),
        })
    }

    #[tokio::test]
    async fn disabled_rule_never_binds() {
        let listener_factory = Arc::new(MockPortListenerFactory::new());
        let (upstream_factory, _inbox) = MockUpstreamSocketFactory::new();
        let mut rule = forward_rule();
        rule.enabled = false;
        let forwarder = PortForwarder::start(
            &[rule],
            listener_factory,
            Arc::new(upstream_factory),
            allow_all_firewall(),
        )
        .await;
        assert!(forwarder.snapshot().is_empty());
    }

    #[tokio::test]
    async fn enabled_rule_binds_and_reports_listening() {
        let listener_factory = Arc::new(MockPortListenerFactory::new());
        let (upstream_factory, _inbox) = MockUpstreamSocketFactory::new();
        let forwarder = PortForwarder::start(
            &[forward_rule()],
            listener_factory,
            Arc::new(upstream_factory),
            allow_all_firewall(),
        )
        .await;
        let snap = forwarder.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].external_port, 8080);
        assert!(snap[0].listening);
    }

    #[tokio::test]
    async fn stop_cancels_accept_loops() {
        let listener_factory = Arc::new(MockPortListenerFactory::new());
        let (upstream_factory, _inbox) = MockUpstreamSocketFactory::new();
        let mut forwarder = PortForwarder::start(
            &[forward_rule()],
            listener_factory,
            Arc::new(upstream_factory),
            allow_all_firewall(),
        )
        .await;
        forwarder.stop();
        assert!(forwarder.snapshot().is_empty());
    }

    #[tokio::test]
    async fn bind_failure_is_skipped_not_fatal() {
        struct FailingFactory;
        #[async_trait::async_trait]
        impl PortListenerFactory for FailingFactory {
            async fn bind(
                &self,
                _proto: L4Proto,
                _port: u16,
            ) -> std::io::Result<Box<dyn crate::channel::PortListener>> {
                Err(std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"))
            }
        }
        let (upstream_factory, _inbox) = MockUpstreamSocketFactory::new();
        let forwarder = PortForwarder::start(
            &[forward_rule()],
            Arc::new(FailingFactory),
            Arc::new(upstream_factory),
            allow_all_firewall(),
        )
        .await;
        assert!(forwarder.snapshot().is_empty());
    }

    #[tokio::test]
    async fn accepted_connection_pipes_bytes_to_companion() {
        let listener_factory = Arc::new(MockPortListenerFactory::new());
        let (upstream_factory, inbox) = MockUpstreamSocketFactory::new();
        let upstream_factory = Arc::new(upstream_factory);
        let forwarder = PortForwarder::start(
            &[forward_rule()],
            Arc::clone(&listener_factory),
            Arc::clone(&upstream_factory) as Arc<dyn UpstreamSocketFactory>,
            allow_all_firewall(),
        )
        .await;
        assert_eq!(forwarder.snapshot().len(), 1);

        // The "accepted client" leg is itself backed by the mock
        // factory, opened to an arbitrary address the test can push
        // client bytes into.
        let client_addr = SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 9999);
        let client_stream = upstream_factory.connect_tcp(client_addr).await.unwrap();
        listener_factory.push_connection(
            L4Proto::Tcp,
            8080,
            AcceptedConnection {
                peer: std::net::SocketAddr::V4(client_addr),
                stream: client_stream,
            },
        );

        // Give the accept loop a moment to pick up the connection and
        // open its companion to the internal endpoint, then simulate
        // the external client sending bytes.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        inbox.push(client_addr, b"hello-internal".to_vec());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let internal_addr = SocketAddrV4::new(Ipv4Addr::new(10, 100, 0, 10), 80);
        assert_eq!(inbox.sent(internal_addr), vec![b"hello-internal".to_vec()]);
    }

    #[tokio::test]
    async fn firewall_blocks_inbound_connection_before_companion_opens() {
        use crate::config::{CidrMatch, L2Match, L3Match};

        let listener_factory = Arc::new(MockPortListenerFactory::new());
        let (upstream_factory, inbox) = MockUpstreamSocketFactory::new();
        let upstream_factory = Arc::new(upstream_factory);
        let firewall = Arc::new(FirewallPolicy {
            rules: vec![FirewallRule {
                enabled: true,
                direction: Direction::Inbound,
                layer: crate::config::Layer::L3,
                action: crate::config::Action::Block,
                l2: L2Match::default(),
                l3: L3Match {
                    src: CidrMatch::Cidr("203.0.113.0/24".parse().unwrap()),
                    proto: L3Proto::Tcp,
                    ..Default::default()
                },
                label: "block-bogon-source".into(),
            }],
            default: Policy::Allow,
            aliases: AliasTable::default(),
        });
        let forwarder = PortForwarder::start(
            &[forward_rule()],
            Arc::clone(&listener_factory),
            Arc::clone(&upstream_factory) as Arc<dyn UpstreamSocketFactory>,
            firewall,
        )
        .await;
        assert_eq!(forwarder.snapshot().len(), 1);

        let client_addr = SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), 55000);
        let client_stream = upstream_factory.connect_tcp(client_addr).await.unwrap();
        listener_factory.push_connection(
            L4Proto::Tcp,
            8080,
            AcceptedConnection {
                peer: std::net::SocketAddr::V4(client_addr),
                stream: client_stream,
            },
        );

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        inbox.push(client_addr, b"should-never-arrive".to_vec());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let internal_addr = SocketAddrV4::new(Ipv4Addr::new(10, 100, 0, 10), 80);
        assert!(
            inbox.sent(internal_addr).is_empty(),
            "blocked connection must never reach the internal endpoint"
        );
    }
}
