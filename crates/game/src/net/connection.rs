use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;

use super::canonical::CanonicalString;
use super::config::NetConfig;
use super::events::DropReason;
use super::message::{ConnectionId, Message};
use super::messages::{ConnectionClosing, MessageBody};
use super::ping::PingInfo;
use super::protocol::{Channel, ProtocolError};
use super::registry::MessageRegistry;
use super::transport::{PeerAddr, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Transport is up, nothing exchanged yet.
    Connected,
    /// Handshake request answered, waiting for the unreliable path.
    AwaitingHandshake,
    Handshaken,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalState {
    Active,
    PendingRemoval,
    Removed,
}

/// Arena lifecycle of one client as observed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArenaState {
    #[default]
    NotPlaying,
    Starting,
    Playing,
    Finished,
}

/// A frame that decoded cleanly, with where it came from.
#[derive(Debug)]
pub struct Received {
    pub message: Message,
    pub channel: Channel,
    pub source: Option<PeerAddr>,
}

/// One peer link: transport, handshake progress, ping and teardown state.
pub struct Connection {
    id: ConnectionId,
    transport: Box<dyn Transport>,
    handshake: HandshakeState,
    removal: RemovalState,
    drop_reason: Option<DropReason>,
    pub ping: PingInfo,
    challenge: u32,
    created_at: Instant,
    last_handshake_send: Option<Instant>,
    protocol_errors: u32,
    close_notice_sent: bool,
}

impl Connection {
    pub fn new(id: ConnectionId, transport: Box<dyn Transport>, config: &NetConfig, now: Instant) -> Self {
        Self {
            id,
            transport,
            handshake: HandshakeState::Connected,
            removal: RemovalState::Active,
            drop_reason: None,
            ping: PingInfo::new(config, now),
            challenge: random_challenge(),
            created_at: now,
            last_handshake_send: None,
            protocol_errors: 0,
            close_notice_sent: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The client learns its id from the handshake reply.
    pub fn set_id(&mut self, id: ConnectionId) {
        self.id = id;
    }

    pub fn remote_addr(&self) -> PeerAddr {
        self.transport.remote_addr()
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    pub fn challenge(&self) -> u32 {
        self.challenge
    }

    pub fn set_challenge(&mut self, challenge: u32) {
        self.challenge = challenge;
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake
    }

    pub fn set_handshake_state(&mut self, state: HandshakeState) {
        if self.handshake != state {
            log::debug!("Connection {} handshake {:?} -> {:?}", self.id, self.handshake, state);
            self.handshake = state;
        }
    }

    pub fn is_handshaken(&self) -> bool {
        self.handshake == HandshakeState::Handshaken
    }

    pub fn removal_state(&self) -> RemovalState {
        self.removal
    }

    pub fn is_active(&self) -> bool {
        self.removal == RemovalState::Active
    }

    pub fn drop_reason(&self) -> Option<&DropReason> {
        self.drop_reason.as_ref()
    }

    /// Queues the connection for the next sweep. Returns `false` if it was
    /// already queued, in which case nothing changes.
    pub fn mark_for_removal(&mut self, reason: DropReason) -> bool {
        if self.removal != RemovalState::Active {
            return false;
        }
        log::debug!("Connection {} marked for removal: {reason}", self.id);
        self.removal = RemovalState::PendingRemoval;
        self.drop_reason = Some(reason);
        true
    }

    /// Sends the close notice if one is due, then shuts the transport down.
    pub fn finish_removal(&mut self) {
        if self.removal == RemovalState::Removed {
            return;
        }
        if let Some(text) = self.drop_reason.as_ref().and_then(DropReason::close_notice) {
            self.send_close_notice(text);
        }
        self.transport.close();
        self.handshake = HandshakeState::Dropped;
        self.removal = RemovalState::Removed;
    }

    pub fn send_close_notice(&mut self, reason: impl Into<String>) {
        if self.close_notice_sent {
            return;
        }
        self.close_notice_sent = true;
        let notice = MessageBody::from(ConnectionClosing {
            reason: reason.into(),
        });
        if let Err(e) = self.send(&notice) {
            log::debug!("Close notice to connection {} not sent: {e}", self.id);
        }
    }

    pub fn send(&mut self, body: &MessageBody) -> Result<(), TransportError> {
        let frame = body.encode_frame()?;
        self.transport.send(body.channel(), frame)
    }

    /// Sends an already encoded frame, for fan-out of one message.
    pub fn send_frame(&mut self, channel: Channel, frame: Bytes) -> Result<(), TransportError> {
        self.transport.send(channel, frame)
    }

    pub fn send_datagram_to(&mut self, addr: SocketAddr, body: &MessageBody) -> Result<(), TransportError> {
        let frame: Bytes = body.encode_frame()?;
        self.transport.send_datagram_to(addr, frame)
    }

    pub fn handshake_elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn handshake_retry_due(&self, now: Instant, retry: Duration) -> bool {
        self.last_handshake_send
            .is_none_or(|sent| now.saturating_duration_since(sent) >= retry)
    }

    pub fn note_handshake_sent(&mut self, now: Instant) {
        self.last_handshake_send = Some(now);
    }

    /// Counts a malformed message. Returns `true` once the limit is reached.
    pub fn record_protocol_error(&mut self, error: &ProtocolError, limit: u32) -> bool {
        self.protocol_errors += 1;
        log::warn!(
            "Protocol error on connection {} ({}/{limit}): {error}",
            self.id,
            self.protocol_errors
        );
        self.protocol_errors >= limit
    }

    pub fn protocol_errors(&self) -> u32 {
        self.protocol_errors
    }

    /// Decodes everything the transport has received since the last tick.
    pub fn receive(&mut self, registry: &MessageRegistry) -> Vec<Result<Received, ProtocolError>> {
        self.transport
            .drain_frames()
            .into_iter()
            .map(|frame| {
                registry
                    .decode(&frame.bytes, self.id, frame.received_at)
                    .map(|message| Received {
                        message,
                        channel: frame.channel,
                        source: frame.source,
                    })
            })
            .collect()
    }

    pub fn drain_errors(&mut self) -> Vec<TransportError> {
        self.transport.drain_errors()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote", &self.remote_addr())
            .field("handshake", &self.handshake)
            .field("removal", &self.removal)
            .field("drop_reason", &self.drop_reason)
            .finish()
    }
}

/// Server's view of one client.
#[derive(Debug)]
pub struct GameClientConnection {
    pub connection: Connection,
    pub arena_state: ArenaState,
    /// Last value the client reported.
    pub is_running_arena: bool,
    pub current_arena: Option<CanonicalString>,
    /// Client IP with the UDP port it reported; hole-punch probes start here.
    pub udp_probe_base: Option<SocketAddr>,
}

impl GameClientConnection {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            arena_state: ArenaState::NotPlaying,
            is_running_arena: false,
            current_arena: None,
            udp_probe_base: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }
}

/// Client's view of the server.
#[derive(Debug)]
pub struct GameServerConnection {
    pub connection: Connection,
    /// Arena the server most recently started.
    pub current_arena: Option<CanonicalString>,
    pub has_game_settings: bool,
    /// `(local_id, player_id)` assignments confirmed by the server.
    pub registered_players: Vec<(u8, u8)>,
}

impl GameServerConnection {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            current_arena: None,
            has_game_settings: false,
            registered_players: Vec::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.connection.id()
    }
}

fn random_challenge() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u128(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default(),
    );
    hasher.finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::transport::{LocalRelayHub, Listener};

    fn relay_pair() -> (Connection, Box<dyn Transport>) {
        let hub = LocalRelayHub::new();
        let mut listener = hub.listen();
        let mut connector = hub.connect(vec![listener.peer_id()]);
        let client = crate::net::transport::Connector::poll(&mut connector)
            .unwrap()
            .unwrap();
        let server_side = listener.poll_accept().remove(0);
        let connection = Connection::new(1, server_side, &NetConfig::default(), Instant::now());
        (connection, client)
    }

    #[test]
    fn test_mark_for_removal_is_idempotent() {
        let (mut connection, _client) = relay_pair();
        assert!(connection.mark_for_removal(DropReason::Kicked));
        assert!(!connection.mark_for_removal(DropReason::PingTimeout));
        assert_eq!(connection.drop_reason(), Some(&DropReason::Kicked));
        assert_eq!(connection.removal_state(), RemovalState::PendingRemoval);
    }

    #[test]
    fn test_finish_removal_sends_one_notice() {
        let (mut connection, mut client) = relay_pair();
        connection.mark_for_removal(DropReason::HandshakeTimeout);
        connection.finish_removal();
        connection.finish_removal();

        let frames = client.drain_frames();
        assert_eq!(frames.len(), 1);
        let registry = MessageRegistry::standard().unwrap();
        let message = registry.decode(&frames[0].bytes, 0, Instant::now()).unwrap();
        assert_eq!(
            message.get::<ConnectionClosing>().map(|m| m.reason.as_str()),
            Some("Handshake timed out")
        );
        assert_eq!(connection.handshake_state(), HandshakeState::Dropped);
        assert!(connection.transport().is_closed());
    }

    #[test]
    fn test_protocol_error_limit() {
        let (mut connection, _client) = relay_pair();
        assert!(!connection.record_protocol_error(&ProtocolError::TooShort, 2));
        assert!(connection.record_protocol_error(&ProtocolError::TooShort, 2));
        assert_eq!(connection.protocol_errors(), 2);
    }
}
