//! Stateful NAT: ephemeral-port translation for outbound TCP/UDP flows.
//!
//! Each flow gets a mapped port and an upstream socket; the NAT engine
//! owns that socket exclusively (spec §9 "ownership of upstream
//! handles"). A background task per flow (the "serial queue" from spec
//! §5, mapped here onto one `tokio` task per upstream socket) drains the
//! upstream socket and translates its bytes back into frames addressed
//! to the guest, writing them onto the shared egress channel the
//! orchestrator owns.
//!
//! Metadata (the forward/reverse index, per-flow activity timestamps)
//! lives behind one `std::sync::Mutex`, matching the teacher's
//! non-async-lock discipline for state only ever held across synchronous
//! operations. Socket I/O happens outside that lock, inside each flow's
//! task. Per-TCP-flow sequence-number bookkeeping is shared between the
//! ingress dispatch path and that flow's reader task via a small
//! dedicated `Arc<Mutex<..>>`, since both directions mutate it.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::address::Mac;
use crate::channel::{Recv, UpstreamSocketFactory};
use crate::config::L4Proto;
use crate::packet::{TcpFlags, TcpSegment, UdpDatagram, build_tcp_segment, build_udp_datagram};
use crate::ratelimit::LogGate;

/// Port pool NAT allocates mapped ports from, per spec §4.5.
pub const PORT_POOL_START: u16 = 10_000;
pub const PORT_POOL_END: u16 = 60_000;

const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const TCP_FIN_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP state observed on the guest-facing side of the flow, per spec §4.5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    SynSent,
    Established,
    FinWait,
    Closed,
}

/// The guest-facing sequence-number bookkeeping for one TCP flow. The
/// router terminates TCP toward the guest itself (spec §9's "strongly
/// preferred" option) rather than passing upstream bytes through under
/// the original 5-tuple without tracking sequence numbers: it picks its
/// own ISN, acks guest data immediately, and relays upstream bytes as
/// new guest-facing segments advancing its own sequence space. This is a
/// minimal relay — no retransmission timer, no window scaling, no SACK —
/// sufficient for the payload-passthrough contract this router promises
/// (see DESIGN.md OQ-2).
#[derive(Debug, Clone, Copy)]
struct TcpSeqState {
    /// Next sequence number this router will use when sending to the guest.
    router_next_seq: u32,
    /// Next byte expected from the guest; the ack number this router sends.
    guest_next_expected: u32,
    state: TcpState,
}

/// Identifies one flow by its guest-observed 5-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ForwardKey {
    pub proto: L4Proto,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
}

struct NatMeta {
    key: ForwardKey,
    mapped_port: u16,
    last_activity: Instant,
    tcp: Option<Arc<Mutex<TcpSeqState>>>,
    to_upstream: mpsc::UnboundedSender<Vec<u8>>,
    reader: AbortHandle,
}

/// A read-only view of one NAT entry for the observable-state snapshot.
#[derive(Debug, Clone)]
pub struct NatEntryView {
    pub proto: L4Proto,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub mapped_port: u16,
    pub tcp_state: Option<TcpState>,
}

/// Reverse index keyed by `(proto, mapped_port)`, per spec's NAT data
/// model: TCP and UDP flows allocate from the same port pool but never
/// collide with each other, since a mapped port is only reserved within
/// its own protocol's namespace.
#[derive(Default)]
struct NatTables {
    forward: HashMap<ForwardKey, u16>,
    entries: HashMap<(L4Proto, u16), NatMeta>,
    port_cursor: u16,
}

impl NatTables {
    fn allocate_port(&mut self, proto: L4Proto) -> Option<u16> {
        let span = (PORT_POOL_END - PORT_POOL_START) as u32 + 1;
        for _ in 0..span {
            let candidate = PORT_POOL_START
                + ((self.port_cursor as u32 - PORT_POOL_START as u32 + 1) % span) as u16;
            self.port_cursor = candidate;
            if !self.entries.contains_key(&(proto, candidate)) {
                return Some(candidate);
            }
        }
        None
    }

    fn remove(&mut self, proto: L4Proto, mapped_port: u16) -> Option<NatMeta> {
        let meta = self.entries.remove(&(proto, mapped_port))?;
        self.forward.remove(&meta.key);
        meta.reader.abort();
        Some(meta)
    }
}

/// Outbound-flow NAT engine. One instance per router.
pub struct NatEngine {
    tables: Mutex<NatTables>,
    factory: Arc<dyn UpstreamSocketFactory>,
    egress: mpsc::UnboundedSender<Vec<u8>>,
    gateway_mac: Mac,
    udp_pool_exhausted_gate: LogGate,
    tcp_pool_exhausted_gate: LogGate,
}

impl NatEngine {
    pub fn new(
        factory: Arc<dyn UpstreamSocketFactory>,
        egress: mpsc::UnboundedSender<Vec<u8>>,
        gateway_mac: Mac,
    ) -> Self {
        NatEngine {
            tables: Mutex::new(NatTables {
                port_cursor: PORT_POOL_START,
                ..Default::default()
            }),
            factory,
            egress,
            gateway_mac,
            udp_pool_exhausted_gate: LogGate::new(),
            tcp_pool_exhausted_gate: LogGate::new(),
        }
    }

    pub fn entry_count(&self) -> usize {
        self.tables.lock().unwrap().entries.len()
    }

    pub fn snapshot(&self) -> Vec<NatEntryView> {
        self.tables
            .lock()
            .unwrap()
            .entries
            .values()
            .map(|m| NatEntryView {
                proto: m.key.proto,
                src_ip: m.key.src_ip,
                src_port: m.key.src_port,
                dst_ip: m.key.dst_ip,
                dst_port: m.key.dst_port,
                mapped_port: m.mapped_port,
                tcp_state: m.tcp.as_ref().map(|s| s.lock().unwrap().state),
            })
            .collect()
    }

    /// Cancel every upstream handle and clear the tables. Called by the
    /// orchestrator on `stop`.
    pub fn clear(&self) {
        let mut tables = self.tables.lock().unwrap();
        for (_, meta) in tables.entries.drain() {
            meta.reader.abort();
        }
        tables.forward.clear();
    }

    /// Evict idle entries: UDP after 60s, `fin_wait`/`closed` TCP per
    /// spec §4.5. Invoked by the orchestrator's 30s sweeper.
    pub fn sweep(&self, now: Instant) {
        let mut tables = self.tables.lock().unwrap();
        let expired: Vec<(L4Proto, u16)> = tables
            .entries
            .values()
            .filter(|meta| match (meta.key.proto, &meta.tcp) {
                (L4Proto::Udp, _) => now.duration_since(meta.last_activity) >= UDP_IDLE_TIMEOUT,
                (L4Proto::Tcp, Some(seq)) => {
                    let state = seq.lock().unwrap().state;
                    match state {
                        TcpState::Closed => true,
                        TcpState::FinWait => {
                            now.duration_since(meta.last_activity) >= TCP_FIN_WAIT_TIMEOUT
                        }
                        _ => false,
                    }
                }
                (L4Proto::Tcp, None) => false,
            })
            .map(|meta| (meta.key.proto, meta.mapped_port))
            .collect();
        for (proto, port) in expired {
            if let Some(meta) = tables.remove(proto, port) {
                debug!(mapped_port = port, proto = ?meta.key.proto, "NAT entry evicted");
            }
        }
    }

    /// Handle one outbound UDP datagram from the guest.
    pub async fn handle_udp(&self, client_mac: Mac, datagram: UdpDatagram<'_>) {
        let key = ForwardKey {
            proto: L4Proto::Udp,
            src_ip: datagram.src_ip,
            src_port: datagram.src_port,
            dst_ip: datagram.dst_ip,
            dst_port: datagram.dst_port,
        };

        let existing = {
            let mut tables = self.tables.lock().unwrap();
            let port = tables.forward.get(&key).copied();
            port.and_then(|port| {
                tables.entries.get_mut(&(L4Proto::Udp, port)).map(|meta| {
                    meta.last_activity = Instant::now();
                    meta.to_upstream.clone()
                })
            })
        };

        if let Some(sender) = existing {
            let _ = sender.send(datagram.payload.to_vec());
            return;
        }

        let Some(mapped_port) = self.tables.lock().unwrap().allocate_port(L4Proto::Udp) else {
            if self.udp_pool_exhausted_gate.fire(Instant::now()) {
                warn!(proto = ?L4Proto::Udp, "NAT port pool exhausted, dropping flow");
            }
            return;
        };

        let remote = SocketAddrV4::new(datagram.dst_ip, datagram.dst_port);
        let socket = match self.factory.connect_udp(remote).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, remote = %remote, "failed to open upstream UDP socket");
                return;
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(Self::run_udp_reader(
            socket,
            rx,
            key,
            client_mac,
            self.gateway_mac,
            self.egress.clone(),
        ));

        {
            let mut tables = self.tables.lock().unwrap();
            tables.forward.insert(key, mapped_port);
            tables.entries.insert(
                (L4Proto::Udp, mapped_port),
                NatMeta {
                    key,
                    mapped_port,
                    last_activity: Instant::now(),
                    tcp: None,
                    to_upstream: tx.clone(),
                    reader: reader.abort_handle(),
                },
            );
        }
        let _ = tx.send(datagram.payload.to_vec());

        debug!(mapped_port, remote = %remote, "NAT UDP flow opened");
    }

    async fn run_udp_reader(
        mut socket: Box<dyn crate::channel::UpstreamUdp>,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
        key: ForwardKey,
        client_mac: Mac,
        gateway_mac: Mac,
        egress: mpsc::UnboundedSender<Vec<u8>>,
    ) {
        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(bytes) => {
                            if let Err(e) = socket.send(&bytes).await {
                                warn!(error = %e, "upstream UDP send failed");
                                return;
                            }
                        }
                        None => return,
                    }
                }
                incoming = socket.receive() => {
                    match incoming {
                        Ok(bytes) => {
                            let frame = build_udp_datagram(
                                gateway_mac,
                                client_mac,
                                key.dst_ip,
                                key.src_ip,
                                key.dst_port,
                                key.src_port,
                                &bytes,
                            );
                            trace!(len = bytes.len(), "NAT UDP upstream -> guest");
                            let _ = egress.send(frame);
                        }
                        Err(e) => {
                            warn!(error = %e, "upstream UDP socket failed");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Handle one outbound TCP segment from the guest. Returns any frame
    /// that should be sent back to the guest synchronously (SYN-ACK, or
    /// an ACK for received data); upstream bytes arrive asynchronously
    /// through the flow's reader task instead.
    pub async fn handle_tcp(&self, client_mac: Mac, segment: TcpSegment<'_>) -> Option<Vec<u8>> {
        let key = ForwardKey {
            proto: L4Proto::Tcp,
            src_ip: segment.src_ip,
            src_port: segment.src_port,
            dst_ip: segment.dst_ip,
            dst_port: segment.dst_port,
        };

        if segment.flags.rst {
            let mut tables = self.tables.lock().unwrap();
            if let Some(&port) = tables.forward.get(&key) {
                tables.remove(key.proto, port);
            }
            return None;
        }

        let existing = {
            let mut tables = self.tables.lock().unwrap();
            let port = tables.forward.get(&key).copied();
            port.and_then(|port| {
                tables.entries.get_mut(&(L4Proto::Tcp, port)).map(|meta| {
                    meta.last_activity = Instant::now();
                    (meta.to_upstream.clone(), meta.tcp.clone())
                })
            })
        };

        let Some((to_upstream, Some(seq_state))) = existing else {
            if segment.flags.syn {
                return self.open_tcp_flow(client_mac, key, segment).await;
            }
            return None;
        };

        let mut seq = seq_state.lock().unwrap();
        if seq.state == TcpState::SynSent && segment.flags.ack {
            seq.state = TcpState::Established;
            debug!("NAT TCP flow established");
        }

        if !segment.payload.is_empty() {
            seq.guest_next_expected = seq
                .guest_next_expected
                .wrapping_add(segment.payload.len() as u32);
            let _ = to_upstream.send(segment.payload.to_vec());
        }

        let reply = if segment.flags.fin {
            seq.guest_next_expected = seq.guest_next_expected.wrapping_add(1);
            seq.state = TcpState::FinWait;
            debug!("NAT TCP flow fin_wait");
            Some(Self::build_ack(self.gateway_mac, client_mac, &key, &seq))
        } else if !segment.payload.is_empty() {
            Some(Self::build_ack(self.gateway_mac, client_mac, &key, &seq))
        } else {
            None
        };
        drop(seq);
        reply
    }

    async fn open_tcp_flow(
        &self,
        client_mac: Mac,
        key: ForwardKey,
        segment: TcpSegment<'_>,
    ) -> Option<Vec<u8>> {
        let Some(mapped_port) = self.tables.lock().unwrap().allocate_port(L4Proto::Tcp) else {
            if self.tcp_pool_exhausted_gate.fire(Instant::now()) {
                warn!(proto = ?L4Proto::Tcp, "NAT port pool exhausted, dropping flow");
            }
            return None;
        };

        let remote = SocketAddrV4::new(key.dst_ip, key.dst_port);
        let socket = match self.factory.connect_tcp(remote).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, remote = %remote, "failed to open upstream TCP socket");
                return None;
            }
        };

        let router_isn = initial_sequence_number(&key, mapped_port);
        let seq_state = Arc::new(Mutex::new(TcpSeqState {
            router_next_seq: router_isn.wrapping_add(1),
            guest_next_expected: segment.seq.wrapping_add(1),
            state: TcpState::SynSent,
        }));

        let (tx, rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(Self::run_tcp_reader(
            socket,
            rx,
            key,
            client_mac,
            self.gateway_mac,
            self.egress.clone(),
            Arc::clone(&seq_state),
        ));

        {
            let mut tables = self.tables.lock().unwrap();
            tables.forward.insert(key, mapped_port);
            tables.entries.insert(
                (L4Proto::Tcp, mapped_port),
                NatMeta {
                    key,
                    mapped_port,
                    last_activity: Instant::now(),
                    tcp: Some(Arc::clone(&seq_state)),
                    to_upstream: tx,
                    reader: reader.abort_handle(),
                },
            );
        }

        debug!(mapped_port, remote = %remote, "NAT TCP flow opened (SYN-ACK)");

        let seq = seq_state.lock().unwrap();
        Some(build_tcp_segment(
            self.gateway_mac,
            client_mac,
            key.dst_ip,
            key.src_ip,
            key.dst_port,
            key.src_port,
            router_isn,
            Some(seq.guest_next_expected),
            TcpFlags {
                syn: true,
                ack: true,
                ..Default::default()
            },
            65535,
            &[],
        ))
    }

    fn build_ack(gateway_mac: Mac, client_mac: Mac, key: &ForwardKey, seq: &TcpSeqState) -> Vec<u8> {
        build_tcp_segment(
            gateway_mac,
            client_mac,
            key.dst_ip,
            key.src_ip,
            key.dst_port,
            key.src_port,
            seq.router_next_seq,
            Some(seq.guest_next_expected),
            TcpFlags {
                ack: true,
                ..Default::default()
            },
            65535,
            &[],
        )
    }

    async fn run_tcp_reader(
        mut socket: Box<dyn crate::channel::UpstreamTcp>,
        mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
        key: ForwardKey,
        client_mac: Mac,
        gateway_mac: Mac,
        egress: mpsc::UnboundedSender<Vec<u8>>,
        seq_state: Arc<Mutex<TcpSeqState>>,
    ) {
        loop {
            tokio::select! {
                outgoing = rx.recv() => {
                    match outgoing {
                        Some(bytes) => {
                            if let Err(e) = socket.send(&bytes).await {
                                warn!(error = %e, "upstream TCP send failed");
                                return;
                            }
                        }
                        None => return,
                    }
                }
                incoming = socket.receive() => {
                    match incoming {
                        Ok(Recv::Data(bytes)) => {
                            let frame = {
                                let mut seq = seq_state.lock().unwrap();
                                let frame = build_tcp_segment(
                                    gateway_mac,
                                    client_mac,
                                    key.dst_ip,
                                    key.src_ip,
                                    key.dst_port,
                                    key.src_port,
                                    seq.router_next_seq,
                                    Some(seq.guest_next_expected),
                                    TcpFlags {
                                        ack: true,
                                        ..Default::default()
                                    },
                                    65535,
                                    &bytes,
                                );
                                seq.router_next_seq =
                                    seq.router_next_seq.wrapping_add(bytes.len() as u32);
                                frame
                            };
                            trace!(len = bytes.len(), "NAT TCP upstream -> guest");
                            let _ = egress.send(frame);
                        }
                        Ok(Recv::Eof) => return,
                        Err(e) => {
                            warn!(error = %e, "upstream TCP socket failed");
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Deterministic-enough initial sequence number: distinct per flow and
/// per router instance without needing a random number generator
/// dependency the rest of this crate never reaches for.
fn initial_sequence_number(key: &ForwardKey, mapped_port: u16) -> u32 {
    let mut hash: u64 = 0xcbf29ce484222325;
    let mut mix = |b: u64| {
        hash ^= b;
        hash = hash.wrapping_mul(0x100000001b3);
    };
    mix(u32::from(key.src_ip) as u64);
    mix(u32::from(key.dst_ip) as u64);
    mix(key.src_port as u64);
    mix(key.dst_port as u64);
    mix(mapped_port as u64);
    mix(std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0));
    (hash >> 16) as u32
}
