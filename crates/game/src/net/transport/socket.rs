//! TCP + UDP transport running on a tokio runtime.
//!
//! The reliable channel is one TCP stream per peer. The unreliable channel is
//! a UDP socket: clients own one each, the server shares one across all
//! connections and routes datagrams by source address.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};

use super::framing::StreamFramer;
use super::{Connector, InboundQueue, Listener, PeerAddr, RawFrame, Transport, TransportError};
use crate::net::protocol::{Channel, MAX_DATAGRAM_SIZE, split_frames};

const READ_BUFFER_SIZE: usize = 4096;
/// Pause after a failed accept so a persistent failure cannot spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum Outbound {
    Frame(Bytes),
    Shutdown,
}

/// Source address to connection queue table for the server's shared socket.
#[derive(Debug, Default)]
struct UdpRoutes {
    routes: Mutex<HashMap<SocketAddr, Arc<InboundQueue>>>,
}

impl UdpRoutes {
    fn bind(&self, addr: SocketAddr, queue: Arc<InboundQueue>) {
        self.routes.lock().insert(addr, queue);
    }

    fn unbind(&self, addr: SocketAddr) {
        self.routes.lock().remove(&addr);
    }

    fn lookup(&self, addr: &SocketAddr) -> Option<Arc<InboundQueue>> {
        self.routes.lock().get(addr).cloned()
    }
}

fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, TransportError> {
    let socket = std::net::UdpSocket::bind(addr)?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket)?)
}

pub struct SocketTransport {
    remote: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
    udp: Arc<UdpSocket>,
    unreliable_remote: Option<SocketAddr>,
    routes: Option<Arc<UdpRoutes>>,
    inbound: Arc<InboundQueue>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl SocketTransport {
    /// Wraps an accepted or connected stream. Must run inside the runtime.
    fn spawn(
        stream: TcpStream,
        remote: SocketAddr,
        udp: Arc<UdpSocket>,
        routes: Option<Arc<UdpRoutes>>,
    ) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("Could not disable Nagle for {remote}: {e}");
        }
        let (reader, writer) = stream.into_split();
        let inbound = Arc::new(InboundQueue::new());
        let (outbound, rx) = mpsc::unbounded_channel();

        let mut tasks = vec![tokio::spawn(read_stream(reader, Arc::clone(&inbound)))];
        tokio::spawn(write_stream(writer, rx, Arc::clone(&inbound)));

        // Client sockets are private to this connection.
        if routes.is_none() {
            tasks.push(tokio::spawn(read_datagrams(
                Arc::clone(&udp),
                DatagramSink::Connection(Arc::clone(&inbound)),
            )));
        }

        Self {
            remote,
            outbound,
            udp,
            unreliable_remote: None,
            routes,
            inbound,
            tasks,
            closed: false,
        }
    }

    fn send_datagram(&self, addr: SocketAddr, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > MAX_DATAGRAM_SIZE {
            return Err(TransportError::DatagramTooLarge(frame.len()));
        }
        match self.udp.try_send_to(frame, addr) {
            Ok(_) => Ok(()),
            // Unreliable by contract; a full send buffer is a dropped datagram.
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Transport for SocketTransport {
    fn send(&mut self, channel: Channel, frame: Bytes) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match channel {
            Channel::Reliable => self
                .outbound
                .send(Outbound::Frame(frame))
                .map_err(|_| TransportError::Closed),
            Channel::Unreliable => {
                let addr = self
                    .unreliable_remote
                    .ok_or(TransportError::NoUnreliableEndpoint)?;
                self.send_datagram(addr, &frame)
            }
        }
    }

    fn drain_frames(&mut self) -> Vec<RawFrame> {
        self.inbound.drain_frames()
    }

    fn drain_errors(&mut self) -> Vec<TransportError> {
        self.inbound.drain_errors()
    }

    fn remote_addr(&self) -> PeerAddr {
        PeerAddr::Socket(self.remote)
    }

    fn needs_udp_handshake(&self) -> bool {
        true
    }

    fn send_datagram_to(&mut self, addr: SocketAddr, frame: Bytes) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.send_datagram(addr, &frame)
    }

    fn set_unreliable_remote(&mut self, addr: SocketAddr) {
        if let Some(routes) = &self.routes {
            if let Some(old) = self.unreliable_remote {
                routes.unbind(old);
            }
            routes.bind(addr, Arc::clone(&self.inbound));
        }
        self.unreliable_remote = Some(addr);
    }

    fn unreliable_remote(&self) -> Option<SocketAddr> {
        self.unreliable_remote
    }

    fn local_udp_port(&self) -> u16 {
        self.udp.local_addr().map(|addr| addr.port()).unwrap_or(0)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.outbound.send(Outbound::Shutdown);
        if let (Some(routes), Some(addr)) = (&self.routes, self.unreliable_remote) {
            routes.unbind(addr);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_stream(mut reader: OwnedReadHalf, inbound: Arc<InboundQueue>) {
    let mut framer = StreamFramer::new(READ_BUFFER_SIZE);
    loop {
        framer.buf_mut().reserve(READ_BUFFER_SIZE);
        match reader.read_buf(framer.buf_mut()).await {
            Ok(0) => {
                inbound.push_error(TransportError::Closed);
                break;
            }
            Ok(_) => {
                for frame in framer.drain_frames() {
                    inbound.push_frame(RawFrame::new(Channel::Reliable, frame, None));
                }
            }
            Err(e) => {
                inbound.push_error(e.into());
                break;
            }
        }
    }
}

async fn write_stream(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    inbound: Arc<InboundQueue>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Outbound::Frame(frame) => {
                if let Err(e) = writer.write_all(&frame).await {
                    inbound.push_error(e.into());
                    break;
                }
            }
            Outbound::Shutdown => break,
        }
    }
    let _ = writer.shutdown().await;
}

enum DatagramSink {
    Connection(Arc<InboundQueue>),
    Routed {
        routes: Arc<UdpRoutes>,
        unrouted: Arc<InboundQueue>,
    },
}

impl DatagramSink {
    fn queue_for(&self, source: &SocketAddr) -> Arc<InboundQueue> {
        match self {
            DatagramSink::Connection(queue) => Arc::clone(queue),
            DatagramSink::Routed { routes, unrouted } => routes
                .lookup(source)
                .unwrap_or_else(|| Arc::clone(unrouted)),
        }
    }
}

async fn read_datagrams(socket: Arc<UdpSocket>, sink: DatagramSink) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, source) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                // ICMP port unreachable shows up here on some platforms.
                log::debug!("UDP receive error: {e}");
                continue;
            }
        };
        let queue = sink.queue_for(&source);
        match split_frames(&buf[..len]) {
            Ok(frames) => {
                for frame in frames {
                    queue.push_frame(RawFrame::new(
                        Channel::Unreliable,
                        Bytes::copy_from_slice(frame),
                        Some(PeerAddr::Socket(source)),
                    ));
                }
            }
            Err(e) => queue.push_error(e.into()),
        }
    }
}

/// Accepts TCP connections and owns the shared server UDP socket.
pub struct SocketListener {
    local_addr: SocketAddr,
    accepted: Arc<Mutex<VecDeque<SocketTransport>>>,
    unrouted: Arc<InboundQueue>,
    tasks: Vec<JoinHandle<()>>,
}

impl SocketListener {
    /// Binds the TCP listener and the UDP socket on the same address.
    pub fn bind(handle: &Handle, addr: SocketAddr) -> Result<Self, TransportError> {
        let _guard = handle.enter();

        let std_listener = std::net::TcpListener::bind(addr)?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        let udp = Arc::new(bind_udp(local_addr)?);
        let routes = Arc::new(UdpRoutes::default());
        let unrouted = Arc::new(InboundQueue::new());
        let accepted = Arc::new(Mutex::new(VecDeque::new()));

        let accept_task = handle.spawn(accept_loop(
            listener,
            Arc::clone(&udp),
            Arc::clone(&routes),
            Arc::clone(&accepted),
            Arc::clone(&unrouted),
        ));
        let udp_task = handle.spawn(read_datagrams(
            udp,
            DatagramSink::Routed {
                routes,
                unrouted: Arc::clone(&unrouted),
            },
        ));

        log::info!("Listening on {local_addr} (tcp + udp)");
        Ok(Self {
            local_addr,
            accepted,
            unrouted,
            tasks: vec![accept_task, udp_task],
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(
    listener: TcpListener,
    udp: Arc<UdpSocket>,
    routes: Arc<UdpRoutes>,
    accepted: Arc<Mutex<VecDeque<SocketTransport>>>,
    errors: Arc<InboundQueue>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                let transport =
                    SocketTransport::spawn(stream, remote, Arc::clone(&udp), Some(Arc::clone(&routes)));
                accepted.lock().push_back(transport);
            }
            Err(e) => {
                log::warn!("Accept failed: {e}");
                errors.push_error(e.into());
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

impl Listener for SocketListener {
    fn poll_accept(&mut self) -> Vec<Box<dyn Transport>> {
        self.accepted
            .lock()
            .drain(..)
            .map(|transport| Box::new(transport) as Box<dyn Transport>)
            .collect()
    }

    fn drain_unrouted(&mut self) -> Vec<RawFrame> {
        self.unrouted.drain_frames()
    }

    fn drain_errors(&mut self) -> Vec<TransportError> {
        self.unrouted.drain_errors()
    }

    fn local_addr(&self) -> PeerAddr {
        PeerAddr::Socket(self.local_addr)
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Races TCP connects to every candidate; the first to succeed wins.
pub struct SocketConnector {
    result: Option<oneshot::Receiver<Result<SocketTransport, TransportError>>>,
}

impl SocketConnector {
    /// `udp_bind` is the local address for the client's datagram socket.
    pub fn start(
        handle: &Handle,
        candidates: Vec<SocketAddr>,
        udp_bind: SocketAddr,
    ) -> Result<Self, TransportError> {
        let udp = {
            let _guard = handle.enter();
            Arc::new(bind_udp(udp_bind)?)
        };
        let (tx, rx) = oneshot::channel();

        handle.spawn(async move {
            let result = connect_first(candidates)
                .await
                .map(|(stream, remote)| SocketTransport::spawn(stream, remote, udp, None));
            let _ = tx.send(result);
        });

        Ok(Self { result: Some(rx) })
    }
}

async fn connect_first(candidates: Vec<SocketAddr>) -> Result<(TcpStream, SocketAddr), TransportError> {
    let total = candidates.len();
    let mut attempts = JoinSet::new();
    for addr in candidates {
        attempts.spawn(async move { TcpStream::connect(addr).await.map(|stream| (stream, addr)) });
    }

    // Dropping the set aborts the attempts still in flight.
    while let Some(joined) = attempts.join_next().await {
        match joined {
            Ok(Ok(connected)) => return Ok(connected),
            Ok(Err(e)) => log::debug!("Connect candidate failed: {e}"),
            Err(e) => log::debug!("Connect attempt aborted: {e}"),
        }
    }
    Err(TransportError::CandidatesExhausted(total))
}

impl Connector for SocketConnector {
    fn poll(&mut self) -> Option<Result<Box<dyn Transport>, TransportError>> {
        let rx = self.result.as_mut()?;
        let outcome = match rx.try_recv() {
            Ok(result) => result.map(|transport| Box::new(transport) as Box<dyn Transport>),
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(TransportError::Closed),
        };
        self.result = None;
        Some(outcome)
    }
}
