//! Capability traits for the three collaborators this router consumes
//! from its host rather than implementing itself: the guest's framed
//! datagram channel, an outbound TCP/UDP socket factory, and a host-side
//! port-listener factory for inbound port forwards.
//!
//! Production implementations are `tokio`-backed; [`crate::test_util`]
//! provides in-memory doubles for integration tests, the same role
//! `mvirt-net`'s old vhost-user test harness played for virtqueue tests.

use std::net::SocketAddrV4;

use async_trait::async_trait;

use crate::config::L4Proto;

/// The guest's shared-memory datagram endpoint. Each [`recv`] yields
/// exactly one Ethernet frame; each [`send`] transmits one. Message
/// boundaries are preserved by the underlying transport — this router
/// never relies on a byte-stream framing here.
#[async_trait]
pub trait GuestChannel: Send {
    async fn recv(&mut self) -> std::io::Result<Vec<u8>>;
    async fn send(&mut self, frame: &[u8]) -> std::io::Result<()>;
}

/// Outcome of a `receive` call on an upstream socket.
pub enum Recv {
    Data(Vec<u8>),
    Eof,
}

/// A connected upstream TCP stream opened on behalf of one NAT flow.
#[async_trait]
pub trait UpstreamTcp: Send {
    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()>;
    async fn receive(&mut self) -> std::io::Result<Recv>;
    fn cancel(&mut self);
}

/// A connected upstream UDP socket opened on behalf of one NAT flow.
/// "Connected" here means the socket is bound to a single remote
/// `(dst_ip, dst_port)`, matching the teacher's one-flow-one-handle model.
#[async_trait]
pub trait UpstreamUdp: Send {
    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()>;
    async fn receive(&mut self) -> std::io::Result<Vec<u8>>;
    fn cancel(&mut self);
}

/// Capability to open outbound connections to the real internet.
#[async_trait]
pub trait UpstreamSocketFactory: Send + Sync {
    async fn connect_tcp(&self, addr: SocketAddrV4) -> std::io::Result<Box<dyn UpstreamTcp>>;
    async fn connect_udp(&self, addr: SocketAddrV4) -> std::io::Result<Box<dyn UpstreamUdp>>;
}

/// One accepted connection on a port-forward listener.
pub struct AcceptedConnection {
    pub peer: std::net::SocketAddr,
    pub stream: Box<dyn UpstreamTcp>,
}

/// A bound host-side listener for one port-forward rule.
#[async_trait]
pub trait PortListener: Send {
    /// Wait for and return the next accepted connection. For UDP rules,
    /// each "connection" represents a new client `(ip, port)` pair
    /// observed on the socket.
    async fn accept(&mut self) -> std::io::Result<AcceptedConnection>;
    fn cancel(&mut self);
}

/// Capability to bind host-side listeners for port-forward rules.
#[async_trait]
pub trait PortListenerFactory: Send + Sync {
    async fn bind(&self, proto: L4Proto, port: u16) -> std::io::Result<Box<dyn PortListener>>;
}

pub mod tokio_impl {
    //! `tokio`-backed production implementations of the channel traits.

    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream, UdpSocket};

    /// Maximum Ethernet frame this router will ever read or write, per
    /// the guest channel contract in spec §6.
    pub const MAX_FRAME_LEN: usize = 65_536;

    pub struct TokioUpstreamTcp {
        stream: TcpStream,
        cancelled: bool,
    }

    #[async_trait]
    impl UpstreamTcp for TokioUpstreamTcp {
        async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
            self.stream.write_all(bytes).await
        }

        async fn receive(&mut self) -> std::io::Result<Recv> {
            let mut buf = vec![0u8; 16 * 1024];
            let n = self.stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(Recv::Eof);
            }
            buf.truncate(n);
            Ok(Recv::Data(buf))
        }

        fn cancel(&mut self) {
            self.cancelled = true;
            let _ = self.stream.set_linger(Some(std::time::Duration::ZERO));
        }
    }

    pub struct TokioUpstreamUdp {
        socket: UdpSocket,
    }

    #[async_trait]
    impl UpstreamUdp for TokioUpstreamUdp {
        async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
            self.socket.send(bytes).await?;
            Ok(())
        }

        async fn receive(&mut self) -> std::io::Result<Vec<u8>> {
            let mut buf = vec![0u8; MAX_FRAME_LEN];
            let n = self.socket.recv(&mut buf).await?;
            buf.truncate(n);
            Ok(buf)
        }

        fn cancel(&mut self) {}
    }

    /// Default upstream socket factory: opens real TCP/UDP sockets to the
    /// real internet via the host's network stack.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct TokioUpstreamSocketFactory;

    #[async_trait]
    impl UpstreamSocketFactory for TokioUpstreamSocketFactory {
        async fn connect_tcp(&self, addr: SocketAddrV4) -> std::io::Result<Box<dyn UpstreamTcp>> {
            let stream = TcpStream::connect(addr).await?;
            Ok(Box::new(TokioUpstreamTcp {
                stream,
                cancelled: false,
            }))
        }

        async fn connect_udp(&self, addr: SocketAddrV4) -> std::io::Result<Box<dyn UpstreamUdp>> {
            let socket = UdpSocket::bind((std::net::Ipv4Addr::UNSPECIFIED, 0)).await?;
            socket.connect(addr).await?;
            Ok(Box::new(TokioUpstreamUdp { socket }))
        }
    }

    pub struct TokioTcpListener {
        listener: TcpListener,
    }

    #[async_trait]
    impl PortListener for TokioTcpListener {
        async fn accept(&mut self) -> std::io::Result<AcceptedConnection> {
            let (stream, peer) = self.listener.accept().await?;
            Ok(AcceptedConnection {
                peer,
                stream: Box::new(TokioUpstreamTcp {
                    stream,
                    cancelled: false,
                }),
            })
        }

        fn cancel(&mut self) {}
    }

    /// Default port-forward listener factory. Only TCP is wired up for
    /// host-side `accept`-style listening; UDP port forwards are rejected
    /// here (see spec §4.7 "unsupported protocols log and skip") since a
    /// UDP "listener" has no connection-oriented accept semantics to
    /// model through this trait.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct TokioPortListenerFactory;

    #[async_trait]
    impl PortListenerFactory for TokioPortListenerFactory {
        async fn bind(&self, proto: L4Proto, port: u16) -> std::io::Result<Box<dyn PortListener>> {
            match proto {
                L4Proto::Tcp => {
                    let listener =
                        TcpListener::bind((std::net::Ipv4Addr::UNSPECIFIED, port)).await?;
                    Ok(Box::new(TokioTcpListener { listener }))
                }
                L4Proto::Udp => Err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "UDP port-forward listeners are not supported",
                )),
            }
        }
    }
}
