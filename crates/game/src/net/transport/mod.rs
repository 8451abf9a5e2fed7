//! Pluggable reliable + unreliable channel pairs.
//!
//! Transports run their I/O wherever they like but hand received frames and
//! errors to the tick thread only through an [`InboundQueue`].

mod framing;
mod relay;
mod socket;

pub use framing::StreamFramer;
pub use relay::{
    LocalRelayHub, LocalRelayLink, RelayConnector, RelayLink, RelayListener, RelayPeerId,
    RelayTransport,
};
pub use socket::{SocketConnector, SocketListener, SocketTransport};

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use super::protocol::{Channel, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("handshake not completed within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("all {0} connect candidates failed")]
    CandidatesExhausted(usize),
    #[error("no unreliable endpoint known for peer")]
    NoUnreliableEndpoint,
    #[error("datagram of {0} bytes exceeds the size limit")]
    DatagramTooLarge(usize),
    #[error("{0} pings went unanswered")]
    PingTimeout(usize),
    #[error("unknown relay peer {0}")]
    UnknownRelayPeer(RelayPeerId),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Where a peer can be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    Socket(SocketAddr),
    Relay(RelayPeerId),
}

impl PeerAddr {
    pub fn socket(&self) -> Option<SocketAddr> {
        match self {
            PeerAddr::Socket(addr) => Some(*addr),
            PeerAddr::Relay(_) => None,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Socket(addr) => write!(f, "{addr}"),
            PeerAddr::Relay(peer) => write!(f, "relay:{peer}"),
        }
    }
}

/// One undecoded frame as it came off a channel.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub channel: Channel,
    pub bytes: Bytes,
    pub source: Option<PeerAddr>,
    pub received_at: Instant,
}

impl RawFrame {
    pub fn new(channel: Channel, bytes: Bytes, source: Option<PeerAddr>) -> Self {
        Self {
            channel,
            bytes,
            source,
            received_at: Instant::now(),
        }
    }
}

/// Producer/consumer queue between transport I/O and the tick thread.
#[derive(Debug, Default)]
pub struct InboundQueue {
    frames: Mutex<VecDeque<RawFrame>>,
    errors: Mutex<VecDeque<TransportError>>,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_frame(&self, frame: RawFrame) {
        self.frames.lock().push_back(frame);
    }

    pub fn push_error(&self, error: TransportError) {
        self.errors.lock().push_back(error);
    }

    pub fn drain_frames(&self) -> Vec<RawFrame> {
        self.frames.lock().drain(..).collect()
    }

    pub fn drain_errors(&self) -> Vec<TransportError> {
        self.errors.lock().drain(..).collect()
    }

    pub fn pending_frames(&self) -> usize {
        self.frames.lock().len()
    }
}

/// A connected reliable + unreliable channel pair to one peer.
///
/// Sends never block. Receives are polled once per tick.
pub trait Transport: Send {
    fn send(&mut self, channel: Channel, frame: Bytes) -> Result<(), TransportError>;

    fn drain_frames(&mut self) -> Vec<RawFrame>;

    fn drain_errors(&mut self) -> Vec<TransportError>;

    fn remote_addr(&self) -> PeerAddr;

    /// True when the unreliable path has to be confirmed with datagram
    /// handshakes before use.
    fn needs_udp_handshake(&self) -> bool;

    /// Sends one unreliable frame to an explicit address, for hole punching.
    fn send_datagram_to(&mut self, addr: SocketAddr, frame: Bytes) -> Result<(), TransportError>;

    fn set_unreliable_remote(&mut self, addr: SocketAddr);

    fn unreliable_remote(&self) -> Option<SocketAddr>;

    /// Local port of the datagram socket, 0 when the transport has none.
    fn local_udp_port(&self) -> u16;

    /// Flushes queued reliable frames and then shuts the transport down.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

/// Server side source of inbound transports.
pub trait Listener: Send {
    fn poll_accept(&mut self) -> Vec<Box<dyn Transport>>;

    /// Datagrams from addresses not yet bound to a connection.
    fn drain_unrouted(&mut self) -> Vec<RawFrame>;

    fn drain_errors(&mut self) -> Vec<TransportError>;

    fn local_addr(&self) -> PeerAddr;
}

/// Client side connection attempt over several candidate endpoints.
pub trait Connector: Send {
    /// `None` while attempts are still running. Yields the outcome once.
    fn poll(&mut self) -> Option<Result<Box<dyn Transport>, TransportError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbound_queue_drains_in_order() {
        let queue = InboundQueue::new();
        queue.push_frame(RawFrame::new(Channel::Reliable, Bytes::from_static(&[1]), None));
        queue.push_frame(RawFrame::new(Channel::Unreliable, Bytes::from_static(&[2]), None));
        queue.push_error(TransportError::Closed);

        let frames = queue.drain_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].bytes[0], 1);
        assert_eq!(frames[1].channel, Channel::Unreliable);
        assert!(queue.drain_frames().is_empty());
        assert!(matches!(queue.drain_errors()[..], [TransportError::Closed]));
    }

    #[test]
    fn test_peer_addr_display() {
        let addr: SocketAddr = "127.0.0.1:16727".parse().unwrap();
        assert_eq!(PeerAddr::Socket(addr).to_string(), "127.0.0.1:16727");
        assert_eq!(PeerAddr::Relay(4).to_string(), "relay:4");
        assert_eq!(PeerAddr::Relay(4).socket(), None);
    }
}
