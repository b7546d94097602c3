//! The central coordinator: wires ARP, DHCP, DNS, NAT, firewall and
//! port-forwarding together around one guest channel, per spec §4.8.
//!
//! Shaped after the teacher's `reactor` module — one struct owning every
//! collaborator, a `start`/`stop` lifecycle spawning and cancelling
//! `tokio` tasks — generalized from a single fixed dispatch to the full
//! parser → {ARP, ICMP, DHCP, DNS, firewall+NAT} table this router
//! implements.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::address::Mac;
use crate::arp::{self, ArpTable};
use crate::channel::{GuestChannel, PortListenerFactory, UpstreamSocketFactory};
use crate::config::{Direction, L3Proto, RouterConfig};
use crate::dhcp::{DHCP_SERVER_PORT, DhcpServer, LeaseTable, LeaseView};
use crate::dns::{DNS_PORT, DnsForwarder};
use crate::error::RouterError;
use crate::firewall::{self, FlowFlow, L3Flow};
use crate::nat::NatEngine;
use crate::packet::{self, IcmpEcho, ParsedPacket, TcpSegment, UdpDatagram, build_icmp_echo_reply};
use crate::port_forward::{FirewallPolicy, PortForwardStatus, PortForwarder};

/// How often the NAT sweeper and lease-expiry pass run, per spec §4.8.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Read-only snapshot of everything observable about a running router,
/// per spec §4.9 — assembled from the same locked tables the hot path
/// uses, each lock held only long enough to clone its contents.
#[derive(Debug, Clone)]
pub struct RouterSnapshot {
    pub leases: Vec<LeaseView>,
    pub nat_entries: usize,
    pub port_forwards: Vec<PortForwardStatus>,
    pub arp_table: Vec<(Ipv4Addr, Mac)>,
    pub malformed_frames: u64,
    /// Set once the guest channel fails during steady state (spec §7's
    /// "channel error" class); `None` while running normally or before
    /// `start`.
    pub channel_failure: Option<String>,
}

enum Lifecycle {
    Idle,
    Running {
        ingress: AbortHandle,
        sweeper: AbortHandle,
    },
    Stopped,
    /// A fatal guest-channel error ended the ingress loop on its own,
    /// without a caller ever invoking `stop`. Terminal, same as `Stopped`,
    /// but distinguished so `RouterSnapshot::channel_failure` can explain
    /// why the router is no longer running.
    Failed,
}

struct RouterInner {
    config: RouterConfig,
    arp: Mutex<ArpTable>,
    leases: Mutex<LeaseTable>,
    nat: NatEngine,
    dns: DnsForwarder,
    port_forwarder: Mutex<Option<PortForwarder>>,
    upstream_factory: Arc<dyn UpstreamSocketFactory>,
    listener_factory: Arc<dyn PortListenerFactory>,
    egress_tx: mpsc::UnboundedSender<Vec<u8>>,
    egress_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    lifecycle: Mutex<Lifecycle>,
    /// Count of frames dropped at the parser for being malformed or
    /// unrecognized, per spec §7's "malformed-packet counter".
    malformed_frames: AtomicU64,
    /// The error that moved the router into `Lifecycle::Failed`, if any,
    /// kept as a rendered string since `RouterError` carries a non-`Clone`
    /// `std::io::Error` and this is read-only diagnostic state.
    failure: Mutex<Option<String>>,
}

/// The router core: one instance per guest. Cheap to clone — every
/// mutable field lives behind the shared `Arc<RouterInner>`, so spawned
/// tasks hold a `Router` the same way they'd hold any other shared handle.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    pub fn new(
        config: RouterConfig,
        upstream_factory: Arc<dyn UpstreamSocketFactory>,
        listener_factory: Arc<dyn PortListenerFactory>,
    ) -> Self {
        let (egress_tx, egress_rx) = mpsc::unbounded_channel();
        let gateway_mac = config.lan.gateway_mac;
        let nat = NatEngine::new(Arc::clone(&upstream_factory), egress_tx.clone(), gateway_mac);
        let dns = DnsForwarder::new(
            Arc::clone(&upstream_factory),
            egress_tx.clone(),
            config.lan.gateway,
            gateway_mac,
        );
        Router {
            inner: Arc::new(RouterInner {
                config,
                arp: Mutex::new(ArpTable::new()),
                leases: Mutex::new(LeaseTable::new()),
                nat,
                dns,
                port_forwarder: Mutex::new(None),
                upstream_factory,
                listener_factory,
                egress_tx,
                egress_rx: Mutex::new(Some(egress_rx)),
                lifecycle: Mutex::new(Lifecycle::Idle),
                malformed_frames: AtomicU64::new(0),
                failure: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Validate configuration, bind port-forward listeners, and start the
    /// ingress/egress loop and the NAT sweeper. Spec §4.8 "start".
    pub async fn start(&self, channel: Box<dyn GuestChannel>) -> Result<(), RouterError> {
        {
            let lifecycle = self.inner.lifecycle.lock().unwrap();
            match &*lifecycle {
                Lifecycle::Idle => {}
                Lifecycle::Running { .. } => return Err(RouterError::AlreadyStarted),
                Lifecycle::Stopped | Lifecycle::Failed => return Err(RouterError::AlreadyStopped),
            }
        }

        self.inner.config.validate()?;

        let egress_rx = self
            .inner
            .egress_rx
            .lock()
            .unwrap()
            .take()
            .expect("egress_rx is only taken once, guarded by the Idle check above");

        let firewall = Arc::new(FirewallPolicy {
            rules: self.inner.config.firewall_rules.clone(),
            default: self.inner.config.firewall_default,
            aliases: self.inner.config.aliases.clone(),
        });
        let forwarder = PortForwarder::start(
            &self.inner.config.port_forwards,
            Arc::clone(&self.inner.listener_factory),
            Arc::clone(&self.inner.upstream_factory),
            firewall,
        )
        .await;
        *self.inner.port_forwarder.lock().unwrap() = Some(forwarder);

        let ingress = tokio::spawn(self.clone().run_ingress(channel, egress_rx));

        let sweeper_router = self.clone();
        let sweeper = tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                sweeper_router.inner.nat.sweep(Instant::now());
                sweeper_router
                    .inner
                    .leases
                    .lock()
                    .unwrap()
                    .purge_expired(Instant::now());
            }
        });

        *self.inner.lifecycle.lock().unwrap() = Lifecycle::Running {
            ingress: ingress.abort_handle(),
            sweeper: sweeper.abort_handle(),
        };

        debug!(gateway = %self.inner.config.lan.gateway, "router started");
        Ok(())
    }

    /// Cancel every task, close every upstream handle, and clear
    /// observable state, per spec §5 "Cancellation". Terminal — a
    /// stopped router cannot be restarted.
    pub fn stop(&self) -> Result<(), RouterError> {
        {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            match &*lifecycle {
                Lifecycle::Running { ingress, sweeper } => {
                    ingress.abort();
                    sweeper.abort();
                }
                Lifecycle::Idle | Lifecycle::Stopped | Lifecycle::Failed => {
                    return Err(RouterError::AlreadyStopped);
                }
            }
            *lifecycle = Lifecycle::Stopped;
        }

        self.cleanup();
        debug!("router stopped");
        Ok(())
    }

    /// The teardown `stop` and a channel failure both need: close every
    /// NAT/DNS flow, every port-forward listener, and clear the
    /// observable ARP/lease tables. Assumes the lifecycle transition out
    /// of `Running` has already happened.
    fn cleanup(&self) {
        self.inner.nat.clear();
        self.inner.dns.clear();
        if let Some(mut forwarder) = self.inner.port_forwarder.lock().unwrap().take() {
            forwarder.stop();
        }
        self.inner.arp.lock().unwrap().clear();
        self.inner.leases.lock().unwrap().clear();
    }

    /// Move the router into `Lifecycle::Failed` and run the same cleanup
    /// `stop` does, per spec §7's "channel error" class: a fatal guest
    /// channel failure transitions the router to failed and runs stop's
    /// cleanup on its own, without waiting for a caller to notice and
    /// invoke `stop`. A no-op if the router isn't `Running` (e.g. `stop`
    /// already raced this call).
    fn fail(&self, err: RouterError) {
        {
            let mut lifecycle = self.inner.lifecycle.lock().unwrap();
            match &*lifecycle {
                Lifecycle::Running { sweeper, .. } => sweeper.abort(),
                Lifecycle::Idle | Lifecycle::Stopped | Lifecycle::Failed => return,
            }
            *lifecycle = Lifecycle::Failed;
        }

        self.cleanup();
        warn!(error = %err, "router failed, cleanup ran");
        *self.inner.failure.lock().unwrap() = Some(err.to_string());
    }

    /// A read-only view of every observable table, for diagnostics.
    pub fn snapshot(&self) -> RouterSnapshot {
        let now = Instant::now();
        RouterSnapshot {
            leases: self.inner.leases.lock().unwrap().snapshot(now),
            nat_entries: self.inner.nat.entry_count(),
            port_forwards: self
                .inner
                .port_forwarder
                .lock()
                .unwrap()
                .as_ref()
                .map(|f| f.snapshot())
                .unwrap_or_default(),
            arp_table: self.inner.arp.lock().unwrap().iter().collect(),
            malformed_frames: self.inner.malformed_frames.load(Ordering::Relaxed),
            channel_failure: self.inner.failure.lock().unwrap().clone(),
        }
    }

    /// The combined ingress-read / egress-write loop. It is the guest
    /// channel's sole owner for the router's running lifetime (spec §5):
    /// replies synthesized for a guest frame are enqueued onto
    /// `egress_tx` before this loop moves on to the next guest frame, and
    /// writing them out is interleaved here with the async components'
    /// own egress traffic (NAT readers, the DNS forwarder, port-forward
    /// pipes) rather than split into a second task, since `GuestChannel`
    /// exposes one `&mut self` surface for both directions.
    async fn run_ingress(
        self,
        mut channel: Box<dyn GuestChannel>,
        mut egress_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        loop {
            tokio::select! {
                frame = channel.recv() => {
                    match frame {
                        Ok(frame) => self.handle_ingress_frame(&frame).await,
                        Err(e) => {
                            self.fail(RouterError::Channel(e));
                            return;
                        }
                    }
                }
                out = egress_rx.recv() => {
                    match out {
                        Some(frame) => {
                            if let Err(e) = channel.send(&frame).await {
                                self.fail(RouterError::Channel(e));
                                return;
                            }
                        }
                        None => return,
                    }
                }
            }
        }
    }

    async fn handle_ingress_frame(&self, frame: &[u8]) {
        let Some(parsed) = packet::parse(frame) else {
            self.inner.malformed_frames.fetch_add(1, Ordering::Relaxed);
            trace!(len = frame.len(), "malformed frame dropped");
            return;
        };

        match parsed {
            ParsedPacket::Arp(msg) => {
                let reply = {
                    let mut table = self.inner.arp.lock().unwrap();
                    arp::handle_arp(&mut table, &self.inner.config.lan, msg)
                };
                if let Some(frame) = reply {
                    let _ = self.inner.egress_tx.send(frame);
                }
            }
            ParsedPacket::Udp {
                eth_src, datagram, ..
            } => {
                self.handle_udp(eth_src, datagram).await;
            }
            ParsedPacket::Tcp {
                eth_src, segment, ..
            } => {
                self.handle_tcp(eth_src, segment).await;
            }
            ParsedPacket::Icmp { eth_src, echo, .. } => {
                self.handle_icmp(eth_src, echo);
            }
            ParsedPacket::UnknownIpv4 { .. } | ParsedPacket::UnknownEther => {
                self.inner.malformed_frames.fetch_add(1, Ordering::Relaxed);
                trace!("unrecognized payload, dropped");
            }
        }
    }

    /// DHCP and DNS are local services the gateway answers itself and
    /// never reach the firewall or NAT (spec §4 control-flow diagram);
    /// everything else is an outbound flow, gated by the firewall before
    /// it ever reaches NAT.
    async fn handle_udp(&self, eth_src: Mac, datagram: UdpDatagram<'_>) {
        if datagram.dst_port == DHCP_SERVER_PORT {
            self.handle_dhcp(eth_src, &datagram);
            return;
        }

        if datagram.dst_port == DNS_PORT {
            self.inner
                .dns
                .handle_query(&self.inner.config.dns, eth_src, datagram)
                .await;
            return;
        }

        if !self.firewall_allows_outbound(eth_src, L3Proto::Udp, datagram.src_ip, datagram.dst_ip, Some(datagram.src_port), Some(datagram.dst_port)) {
            trace!(dst = %datagram.dst_ip, port = datagram.dst_port, "firewall dropped outbound UDP");
            return;
        }
        self.inner.nat.handle_udp(eth_src, datagram).await;
    }

    fn handle_dhcp(&self, eth_src: Mac, datagram: &UdpDatagram<'_>) {
        if !self.inner.config.dhcp.enabled {
            return;
        }
        let outcome = {
            let dhcp = DhcpServer::new(
                &self.inner.config.lan,
                &self.inner.config.dhcp,
                &self.inner.config.dns,
            );
            let mut leases = self.inner.leases.lock().unwrap();
            dhcp.handle(&mut leases, eth_src, datagram)
        };
        let Some(outcome) = outcome else { return };
        if let Some((ip, mac)) = outcome.arp_binding {
            self.inner.arp.lock().unwrap().learn(ip, mac);
        }
        let _ = self.inner.egress_tx.send(outcome.frame);
    }

    async fn handle_tcp(&self, eth_src: Mac, segment: TcpSegment<'_>) {
        if !self.firewall_allows_outbound(
            eth_src,
            L3Proto::Tcp,
            segment.src_ip,
            segment.dst_ip,
            Some(segment.src_port),
            Some(segment.dst_port),
        ) {
            trace!(dst = %segment.dst_ip, port = segment.dst_port, "firewall dropped outbound TCP");
            return;
        }
        if let Some(reply) = self.inner.nat.handle_tcp(eth_src, segment).await {
            let _ = self.inner.egress_tx.send(reply);
        }
    }

    /// ICMP echo to the gateway is answered directly by the orchestrator
    /// (spec §4.5); anything else ICMP-shaped (echo to a third party,
    /// non-echo types) is out of scope and dropped.
    fn handle_icmp(&self, eth_src: Mac, echo: IcmpEcho<'_>) {
        if !echo.is_request || echo.dst_ip != self.inner.config.lan.gateway {
            return;
        }
        let frame = build_icmp_echo_reply(
            self.inner.config.lan.gateway_mac,
            eth_src,
            echo.dst_ip,
            echo.src_ip,
            echo.ident,
            echo.seq_no,
            echo.data,
        );
        let _ = self.inner.egress_tx.send(frame);
    }

    #[allow(clippy::too_many_arguments)]
    fn firewall_allows_outbound(
        &self,
        eth_src: Mac,
        proto: L3Proto,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: Option<u16>,
        dst_port: Option<u16>,
    ) -> bool {
        let l3 = L3Flow {
            proto,
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        };
        let flow = FlowFlow {
            direction: Direction::Outbound,
            eth_src,
            eth_dst: self.inner.config.lan.gateway_mac,
            ethertype: packet::ETHERTYPE_IPV4,
            l3: Some(&l3),
        };
        firewall::evaluate(
            &self.inner.config.firewall_rules,
            self.inner.config.firewall_default,
            &self.inner.config.aliases,
            &flow,
        )
    }
}
