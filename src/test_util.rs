//! In-memory test doubles for the collaborator traits in [`crate::channel`].
//!
//! These replace the teacher's vhost-user/virtqueue test harness: instead
//! of a shared-memory ring, tests drive the router through plain `tokio`
//! channels, and instead of real sockets, upstream I/O is backed by
//! in-process queues a test can inspect and feed directly.

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::address::Mac;
use crate::channel::{
    AcceptedConnection, GuestChannel, PortListener, PortListenerFactory, Recv, UpstreamSocketFactory,
    UpstreamTcp, UpstreamUdp,
};
use crate::config::L4Proto;

/// A MAC with a fixed OUI, convenient for building distinct test identities.
pub fn mac(last_octet: u8) -> Mac {
    Mac::new([0x02, 0x00, 0x00, 0x00, 0x00, last_octet])
}

/// An in-memory, bidirectional [`GuestChannel`]: frames pushed with
/// [`LoopbackGuestChannel::inject`] are returned from `recv`, and frames
/// sent by the router under test are captured for assertions.
pub struct LoopbackGuestChannel {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// The test-facing handle paired with a [`LoopbackGuestChannel`]: used to
/// inject frames as if from the guest, and to drain frames the router
/// sent back.
pub struct LoopbackGuestChannelHandle {
    pub inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    pub outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl LoopbackGuestChannel {
    pub fn new() -> (Self, LoopbackGuestChannelHandle) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            LoopbackGuestChannel {
                inbound: inbound_rx,
                outbound: outbound_tx,
            },
            LoopbackGuestChannelHandle {
                inbound_tx,
                outbound_rx,
            },
        )
    }
}

#[async_trait]
impl GuestChannel for LoopbackGuestChannel {
    async fn recv(&mut self) -> std::io::Result<Vec<u8>> {
        self.inbound.recv().await.ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "guest channel closed")
        })
    }

    async fn send(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.outbound
            .send(frame.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "test receiver dropped"))
    }
}

/// A queue of bytes a mock upstream socket will yield from `receive`,
/// shared with the test so it can push "server" responses.
type Inbox = Arc<Mutex<VecDeque<Vec<u8>>>>;

struct MockUpstreamTcp {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    inbox: Inbox,
    notify: Arc<tokio::sync::Notify>,
    cancelled: Arc<Mutex<bool>>,
}

#[async_trait]
impl UpstreamTcp for MockUpstreamTcp {
    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.sent.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    async fn receive(&mut self) -> std::io::Result<Recv> {
        loop {
            if let Some(bytes) = self.inbox.lock().unwrap().pop_front() {
                return Ok(Recv::Data(bytes));
            }
            if *self.cancelled.lock().unwrap() {
                return Ok(Recv::Eof);
            }
            self.notify.notified().await;
        }
    }

    fn cancel(&mut self) {
        *self.cancelled.lock().unwrap() = true;
        self.notify.notify_waiters();
    }
}

struct MockUpstreamUdp {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    inbox: Inbox,
    notify: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl UpstreamUdp for MockUpstreamUdp {
    async fn send(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.sent.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    async fn receive(&mut self) -> std::io::Result<Vec<u8>> {
        loop {
            if let Some(bytes) = self.inbox.lock().unwrap().pop_front() {
                return Ok(bytes);
            }
            self.notify.notified().await;
        }
    }

    fn cancel(&mut self) {}
}

/// A handle a test keeps to push bytes into a mock upstream socket as if
/// a real server had replied, keyed by the remote address it was opened
/// against.
struct UpstreamSlot {
    inbox: Inbox,
    notify: Arc<tokio::sync::Notify>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[derive(Clone)]
pub struct UpstreamInbox {
    inner: Arc<Mutex<std::collections::HashMap<SocketAddrV4, UpstreamSlot>>>,
}

impl UpstreamInbox {
    /// Push bytes that the next `receive()` call on the socket opened to
    /// `addr` will return. A no-op if no socket has been opened to `addr`
    /// yet.
    pub fn push(&self, addr: SocketAddrV4, bytes: Vec<u8>) {
        if let Some(slot) = self.inner.lock().unwrap().get(&addr) {
            slot.inbox.lock().unwrap().push_back(bytes);
            slot.notify.notify_waiters();
        }
    }

    /// Every payload sent on the socket opened to `addr`, oldest first.
    pub fn sent(&self, addr: SocketAddrV4) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .unwrap()
            .get(&addr)
            .map(|slot| slot.sent.lock().unwrap().clone())
            .unwrap_or_default()
    }
}

/// A mock [`UpstreamSocketFactory`] that never touches the real network:
/// every `connect_tcp`/`connect_udp` succeeds immediately and hands back
/// a socket backed by in-memory queues a test can feed via
/// [`UpstreamInbox`], unless the address was marked unreachable via
/// [`MockUpstreamSocketFactory::fail_connect`].
pub struct MockUpstreamSocketFactory {
    inbox: UpstreamInbox,
    unreachable: Arc<Mutex<std::collections::HashSet<SocketAddrV4>>>,
}

impl MockUpstreamSocketFactory {
    pub fn new() -> (Self, UpstreamInbox) {
        let inbox = UpstreamInbox {
            inner: Arc::new(Mutex::new(std::collections::HashMap::new())),
        };
        (
            MockUpstreamSocketFactory {
                inbox: inbox.clone(),
                unreachable: Arc::new(Mutex::new(std::collections::HashSet::new())),
            },
            inbox,
        )
    }

    /// Make every future `connect_tcp`/`connect_udp` to `addr` fail with
    /// `ConnectionRefused`, simulating an unreachable upstream.
    pub fn fail_connect(&self, addr: SocketAddrV4) {
        self.unreachable.lock().unwrap().insert(addr);
    }
}

#[async_trait]
impl UpstreamSocketFactory for MockUpstreamSocketFactory {
    async fn connect_tcp(&self, addr: SocketAddrV4) -> std::io::Result<Box<dyn UpstreamTcp>> {
        if self.unreachable.lock().unwrap().contains(&addr) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock upstream marked unreachable",
            ));
        }
        let inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(tokio::sync::Notify::new());
        let sent = Arc::new(Mutex::new(Vec::new()));
        self.inbox.inner.lock().unwrap().insert(
            addr,
            UpstreamSlot {
                inbox: inbox.clone(),
                notify: notify.clone(),
                sent: sent.clone(),
            },
        );
        Ok(Box::new(MockUpstreamTcp {
            sent,
            inbox,
            notify,
            cancelled: Arc::new(Mutex::new(false)),
        }))
    }

    async fn connect_udp(&self, addr: SocketAddrV4) -> std::io::Result<Box<dyn UpstreamUdp>> {
        if self.unreachable.lock().unwrap().contains(&addr) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock upstream marked unreachable",
            ));
        }
        let inbox: Inbox = Arc::new(Mutex::new(VecDeque::new()));
        let notify = Arc::new(tokio::sync::Notify::new());
        let sent = Arc::new(Mutex::new(Vec::new()));
        self.inbox.inner.lock().unwrap().insert(
            addr,
            UpstreamSlot {
                inbox: inbox.clone(),
                notify: notify.clone(),
                sent: sent.clone(),
            },
        );
        Ok(Box::new(MockUpstreamUdp { sent, inbox, notify }))
    }
}

/// A mock [`PortListenerFactory`] whose listeners never accept anything
/// on their own; tests that need an inbound connection push one directly
/// via [`MockPortListenerHandle::push_connection`].
pub struct MockPortListenerFactory {
    pending: Arc<Mutex<std::collections::HashMap<(L4Proto, u16), VecDeque<AcceptedConnection>>>>,
    notify: Arc<tokio::sync::Notify>,
}

pub struct MockPortListener {
    key: (L4Proto, u16),
    pending: Arc<Mutex<std::collections::HashMap<(L4Proto, u16), VecDeque<AcceptedConnection>>>>,
    notify: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl PortListener for MockPortListener {
    async fn accept(&mut self) -> std::io::Result<AcceptedConnection> {
        loop {
            if let Some(conn) = self
                .pending
                .lock()
                .unwrap()
                .get_mut(&self.key)
                .and_then(|q| q.pop_front())
            {
                return Ok(conn);
            }
            self.notify.notified().await;
        }
    }

    fn cancel(&mut self) {}
}

impl MockPortListenerFactory {
    pub fn new() -> Self {
        MockPortListenerFactory {
            pending: Arc::new(Mutex::new(std::collections::HashMap::new())),
            notify: Arc::new(tokio::sync::Notify::new()),
        }
    }

    /// Queue an accepted connection for the listener bound to `(proto, port)`.
    pub fn push_connection(&self, proto: L4Proto, port: u16, conn: AcceptedConnection) {
        self.pending
            .lock()
            .unwrap()
            .entry((proto, port))
            .or_default()
            .push_back(conn);
        self.notify.notify_waiters();
    }
}

impl Default for MockPortListenerFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PortListenerFactory for MockPortListenerFactory {
    async fn bind(&self, proto: L4Proto, port: u16) -> std::io::Result<Box<dyn PortListener>> {
        self.pending
            .lock()
            .unwrap()
            .entry((proto, port))
            .or_default();
        Ok(Box::new(MockPortListener {
            key: (proto, port),
            pending: self.pending.clone(),
            notify: self.notify.clone(),
        }))
    }
}
