//! Relay transport: one connection-oriented link per peer through a relay
//! service, with the relay's own reliable and unreliable send modes.
//!
//! [`LocalRelayHub`] is an in-process relay used by tests and local play.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

use super::{Connector, Listener, PeerAddr, RawFrame, Transport, TransportError};
use crate::net::protocol::Channel;

pub type RelayPeerId = u64;

/// A link to one peer provided by a relay service.
pub trait RelayLink: Send {
    fn local_peer(&self) -> RelayPeerId;

    fn remote_peer(&self) -> RelayPeerId;

    fn send(&self, channel: Channel, frame: Bytes) -> Result<(), TransportError>;

    fn receive(&self) -> Vec<(Channel, Bytes)>;

    fn is_open(&self) -> bool;

    fn close(&self);
}

#[derive(Debug, Default)]
struct Pipe {
    frames: Mutex<VecDeque<(Channel, Bytes)>>,
}

/// One end of an in-process link.
#[derive(Debug)]
pub struct LocalRelayLink {
    local: RelayPeerId,
    remote: RelayPeerId,
    outgoing: Arc<Pipe>,
    incoming: Arc<Pipe>,
    open: Arc<AtomicBool>,
    drop_unreliable: Arc<AtomicBool>,
}

impl LocalRelayLink {
    fn pair(
        a: RelayPeerId,
        b: RelayPeerId,
        drop_unreliable: Arc<AtomicBool>,
    ) -> (LocalRelayLink, LocalRelayLink) {
        let a_to_b = Arc::new(Pipe::default());
        let b_to_a = Arc::new(Pipe::default());
        let open = Arc::new(AtomicBool::new(true));
        (
            LocalRelayLink {
                local: a,
                remote: b,
                outgoing: Arc::clone(&a_to_b),
                incoming: Arc::clone(&b_to_a),
                open: Arc::clone(&open),
                drop_unreliable: Arc::clone(&drop_unreliable),
            },
            LocalRelayLink {
                local: b,
                remote: a,
                outgoing: b_to_a,
                incoming: a_to_b,
                open,
                drop_unreliable,
            },
        )
    }
}

impl RelayLink for LocalRelayLink {
    fn local_peer(&self) -> RelayPeerId {
        self.local
    }

    fn remote_peer(&self) -> RelayPeerId {
        self.remote
    }

    fn send(&self, channel: Channel, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::Closed);
        }
        if channel == Channel::Unreliable && self.drop_unreliable.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.outgoing.frames.lock().push_back((channel, frame));
        Ok(())
    }

    fn receive(&self) -> Vec<(Channel, Bytes)> {
        self.incoming.frames.lock().drain(..).collect()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

type AcceptQueue = Arc<Mutex<VecDeque<LocalRelayLink>>>;

#[derive(Debug, Default)]
struct HubState {
    next_peer: RelayPeerId,
    listeners: HashMap<RelayPeerId, AcceptQueue>,
}

/// In-process relay. Cloning shares the same hub.
#[derive(Debug, Clone, Default)]
pub struct LocalRelayHub {
    state: Arc<Mutex<HubState>>,
    drop_unreliable: Arc<AtomicBool>,
}

impl LocalRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_peer(state: &mut HubState) -> RelayPeerId {
        state.next_peer += 1;
        state.next_peer
    }

    pub fn listen(&self) -> RelayListener {
        let mut state = self.state.lock();
        let id = Self::allocate_peer(&mut state);
        let pending: AcceptQueue = Arc::default();
        state.listeners.insert(id, Arc::clone(&pending));
        RelayListener {
            hub: self.clone(),
            id,
            pending,
        }
    }

    /// Opens a raw link to the first candidate that is listening.
    pub fn connect_link(&self, candidates: &[RelayPeerId]) -> Result<LocalRelayLink, TransportError> {
        let mut state = self.state.lock();
        let Some((target, queue)) = candidates
            .iter()
            .find_map(|id| state.listeners.get(id).map(|queue| (*id, Arc::clone(queue))))
        else {
            return Err(TransportError::CandidatesExhausted(candidates.len()));
        };
        let local = Self::allocate_peer(&mut state);
        let (client_end, server_end) =
            LocalRelayLink::pair(local, target, Arc::clone(&self.drop_unreliable));
        queue.lock().push_back(server_end);
        Ok(client_end)
    }

    pub fn connect(&self, candidates: Vec<RelayPeerId>) -> RelayConnector {
        RelayConnector {
            outcome: Some(self.connect_link(&candidates).map(RelayTransport::new)),
        }
    }

    /// Simulates total loss on the unreliable channel of every link.
    pub fn set_drop_unreliable(&self, drop: bool) {
        self.drop_unreliable.store(drop, Ordering::Relaxed);
    }

    fn unlisten(&self, id: RelayPeerId) {
        self.state.lock().listeners.remove(&id);
    }
}

pub struct RelayListener {
    hub: LocalRelayHub,
    id: RelayPeerId,
    pending: AcceptQueue,
}

impl RelayListener {
    pub fn peer_id(&self) -> RelayPeerId {
        self.id
    }
}

impl Listener for RelayListener {
    fn poll_accept(&mut self) -> Vec<Box<dyn Transport>> {
        self.pending
            .lock()
            .drain(..)
            .map(|link| Box::new(RelayTransport::new(link)) as Box<dyn Transport>)
            .collect()
    }

    fn drain_unrouted(&mut self) -> Vec<RawFrame> {
        Vec::new()
    }

    fn drain_errors(&mut self) -> Vec<TransportError> {
        Vec::new()
    }

    fn local_addr(&self) -> PeerAddr {
        PeerAddr::Relay(self.id)
    }
}

impl Drop for RelayListener {
    fn drop(&mut self) {
        self.hub.unlisten(self.id);
    }
}

pub struct RelayConnector {
    outcome: Option<Result<RelayTransport<LocalRelayLink>, TransportError>>,
}

impl Connector for RelayConnector {
    fn poll(&mut self) -> Option<Result<Box<dyn Transport>, TransportError>> {
        self.outcome
            .take()
            .map(|result| result.map(|transport| Box::new(transport) as Box<dyn Transport>))
    }
}

/// Maps both logical channels onto one relay link.
pub struct RelayTransport<L: RelayLink> {
    link: L,
    closed: bool,
    peer_closed_reported: bool,
}

impl<L: RelayLink> RelayTransport<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            closed: false,
            peer_closed_reported: false,
        }
    }

    pub fn link(&self) -> &L {
        &self.link
    }
}

impl<L: RelayLink> Transport for RelayTransport<L> {
    fn send(&mut self, channel: Channel, frame: Bytes) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.link.send(channel, frame)
    }

    fn drain_frames(&mut self) -> Vec<RawFrame> {
        let source = Some(PeerAddr::Relay(self.link.remote_peer()));
        self.link
            .receive()
            .into_iter()
            .map(|(channel, bytes)| RawFrame::new(channel, bytes, source))
            .collect()
    }

    fn drain_errors(&mut self) -> Vec<TransportError> {
        if !self.closed && !self.link.is_open() && !self.peer_closed_reported {
            self.peer_closed_reported = true;
            return vec![TransportError::Closed];
        }
        Vec::new()
    }

    fn remote_addr(&self) -> PeerAddr {
        PeerAddr::Relay(self.link.remote_peer())
    }

    fn needs_udp_handshake(&self) -> bool {
        false
    }

    fn send_datagram_to(&mut self, _addr: SocketAddr, _frame: Bytes) -> Result<(), TransportError> {
        Err(TransportError::NoUnreliableEndpoint)
    }

    fn set_unreliable_remote(&mut self, _addr: SocketAddr) {}

    fn unreliable_remote(&self) -> Option<SocketAddr> {
        None
    }

    fn local_udp_port(&self) -> u16 {
        0
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.link.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_delivers_both_channels_in_order() {
        let hub = LocalRelayHub::new();
        let mut listener = hub.listen();
        let mut client = hub.connect_link(&[listener.peer_id()]).map(RelayTransport::new).unwrap();
        let mut accepted = listener.poll_accept();
        assert_eq!(accepted.len(), 1);

        client.send(Channel::Reliable, Bytes::from_static(b"a")).unwrap();
        client.send(Channel::Unreliable, Bytes::from_static(b"b")).unwrap();

        let frames = accepted[0].drain_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].channel, Channel::Reliable);
        assert_eq!(&frames[1].bytes[..], b"b");
        assert_eq!(frames[0].source, Some(PeerAddr::Relay(client.link().local_peer())));
        assert_eq!(accepted[0].remote_addr(), PeerAddr::Relay(client.link().local_peer()));
    }

    #[test]
    fn test_connect_picks_first_listening_candidate() {
        let hub = LocalRelayHub::new();
        let listener = hub.listen();
        let link = hub.connect_link(&[999, listener.peer_id()]).unwrap();
        assert_eq!(link.remote_peer(), listener.peer_id());

        assert!(matches!(
            hub.connect_link(&[998, 999]),
            Err(TransportError::CandidatesExhausted(2))
        ));
    }

    #[test]
    fn test_peer_close_is_reported_once() {
        let hub = LocalRelayHub::new();
        let mut listener = hub.listen();
        let mut client = RelayTransport::new(hub.connect_link(&[listener.peer_id()]).unwrap());
        let mut server_side = listener.poll_accept().remove(0);

        client.close();
        assert!(client.send(Channel::Reliable, Bytes::new()).is_err());
        assert_eq!(server_side.drain_errors().len(), 1);
        assert!(server_side.drain_errors().is_empty());
    }

    #[test]
    fn test_dropped_unreliable_channel() {
        let hub = LocalRelayHub::new();
        let mut listener = hub.listen();
        let mut client = RelayTransport::new(hub.connect_link(&[listener.peer_id()]).unwrap());
        let mut server_side = listener.poll_accept().remove(0);

        hub.set_drop_unreliable(true);
        client.send(Channel::Unreliable, Bytes::from_static(b"x")).unwrap();
        client.send(Channel::Reliable, Bytes::from_static(b"y")).unwrap();

        let frames = server_side.drain_frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel, Channel::Reliable);
    }
}
