//! Shared harness for the router's end-to-end tests.
//!
//! Every test here drives a real [`Router`] through its public `start`/
//! `stop`/`snapshot` API, over an in-memory [`LoopbackGuestChannel`] and
//! mocked upstream/listener factories — the same collaborator doubles
//! `src/test_util.rs` uses for the crate's own unit tests, standing in
//! for the vhost-user frontend the teacher's equivalent tests drove.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use mvirt_net::config::{DhcpConfig, DnsMode, LanConfig, Policy, RouterConfig};
use mvirt_net::orchestrator::Router;
use mvirt_net::test_util::{LoopbackGuestChannel, LoopbackGuestChannelHandle, MockPortListenerFactory, MockUpstreamSocketFactory, UpstreamInbox};

pub const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 100, 0, 1);

/// A bare-bones but valid config for a /24 guest LAN with DHCP enabled
/// over `10.100.0.10-10.100.0.254` and no firewall/port-forward rules.
/// Tests mutate the fields they care about before starting the router.
pub fn base_config() -> RouterConfig {
    let subnet = Ipv4Net::from_str("10.100.0.0/24").unwrap();
    RouterConfig {
        lan: LanConfig::new("e2e-test-net", GATEWAY, subnet),
        dhcp: DhcpConfig {
            enabled: true,
            pool_start: Ipv4Addr::new(10, 100, 0, 10),
            pool_end: Ipv4Addr::new(10, 100, 0, 254),
            lease_ttl: Duration::from_secs(3600),
            static_leases: Vec::new(),
        },
        dns: DnsMode::Passthrough,
        firewall_rules: Vec::new(),
        firewall_default: Policy::Allow,
        aliases: Default::default(),
        port_forwards: Vec::new(),
    }
}

/// Build and start a router against a fresh [`LoopbackGuestChannel`],
/// returning the handle tests use to inject guest frames and drain
/// replies, plus the upstream inbox for feeding "server" responses.
pub async fn start_router(
    config: RouterConfig,
) -> (Router, LoopbackGuestChannelHandle, UpstreamInbox) {
    let (upstream_factory, inbox) = MockUpstreamSocketFactory::new();
    let listener_factory = MockPortListenerFactory::new();
    let router = Router::new(config, Arc::new(upstream_factory), Arc::new(listener_factory));
    let (channel, handle) = LoopbackGuestChannel::new();
    router.start(Box::new(channel)).await.expect("router should start against a valid config");
    (router, handle, inbox)
}

/// Build and start a router with caller-supplied factories, for tests
/// that need to control listener/upstream behavior themselves (e.g. the
/// port-forward scenario, which pushes accepted connections). Returns
/// the upstream factory alongside the router so a test can open its own
/// "external client" leg through the very same mock instance the router
/// uses for its port-forward companion connections.
pub async fn start_router_with_listeners(
    config: RouterConfig,
    listener_factory: Arc<MockPortListenerFactory>,
) -> (
    Router,
    LoopbackGuestChannelHandle,
    UpstreamInbox,
    Arc<MockUpstreamSocketFactory>,
) {
    let (upstream_factory, inbox) = MockUpstreamSocketFactory::new();
    let upstream_factory = Arc::new(upstream_factory);
    let router = Router::new(
        config,
        Arc::clone(&upstream_factory) as _,
        listener_factory as _,
    );
    let (channel, handle) = LoopbackGuestChannel::new();
    router.start(Box::new(channel)).await.expect("router should start against a valid config");
    (router, handle, inbox, upstream_factory)
}

/// Wait up to one second for the next frame the router sends back to
/// the guest, panicking if none arrives.
pub async fn recv_reply(handle: &mut LoopbackGuestChannelHandle) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(1), handle.outbound_rx.recv())
        .await
        .expect("router should reply within 1s")
        .expect("guest channel should still be open")
}

/// Assert that no frame comes back to the guest within a short window —
/// used to prove a firewall drop or a blocked DNS query produced no reply.
pub async fn assert_no_reply(handle: &mut LoopbackGuestChannelHandle) {
    let outcome = tokio::time::timeout(Duration::from_millis(150), handle.outbound_rx.recv()).await;
    assert!(outcome.is_err(), "expected no reply, but one arrived");
}
