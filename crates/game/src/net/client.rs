//! Client side session: one connection to a game server.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::config::NetConfig;
use super::connection::{Connection, GameServerConnection, HandshakeState, RemovalState};
use super::events::{DropReason, SessionEvent};
use super::handlers::{MessageHandlers, Outbox};
use super::message::{ConnectionId, Message};
use super::messages::{ArenaStatus, HandshakeRequest, MessageBody, UdpHandshake};
use super::ping::PingInfo;
use super::protocol::PROTOCOL_VERSION;
use super::registry::MessageRegistry;
use super::transport::{Connector, PeerAddr, Transport, TransportError};

/// Game state the client session reads each tick.
pub trait ClientGameState {
    fn frame_number(&self) -> u32;

    fn is_running_arena(&self) -> bool;
}

/// Called once when a connection attempt resolves.
pub type ConnectCallback = Box<dyn FnOnce(Result<PeerAddr, &TransportError>) + Send>;

struct PendingConnect {
    connector: Box<dyn Connector>,
    callback: Option<ConnectCallback>,
}

pub struct ClientSession<G> {
    config: NetConfig,
    registry: Arc<MessageRegistry>,
    pending: Option<PendingConnect>,
    server: Option<GameServerConnection>,
    reported_running_arena: Option<bool>,
    handlers: MessageHandlers<G>,
    outbox: Outbox,
    events: VecDeque<SessionEvent>,
}

impl<G: ClientGameState> ClientSession<G> {
    pub fn new(config: NetConfig, registry: Arc<MessageRegistry>) -> Self {
        Self {
            config,
            registry,
            pending: None,
            server: None,
            reported_running_arena: None,
            handlers: MessageHandlers::new(),
            outbox: Outbox::default(),
            events: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn handlers_mut(&mut self) -> &mut MessageHandlers<G> {
        &mut self.handlers
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.events.drain(..)
    }

    /// Starts connecting. A previous server connection is closed first.
    pub fn connect(&mut self, connector: Box<dyn Connector>, callback: Option<ConnectCallback>) {
        if self.server.is_some() {
            self.disconnect();
        }
        self.pending = Some(PendingConnect { connector, callback });
    }

    pub fn is_connecting(&self) -> bool {
        self.pending.is_some()
    }

    /// Handshake finished and the connection is still up.
    pub fn is_connected(&self) -> bool {
        self.server
            .as_ref()
            .is_some_and(|server| server.connection.is_active() && server.connection.is_handshaken())
    }

    pub fn server(&self) -> Option<&GameServerConnection> {
        self.server.as_ref()
    }

    pub fn server_mut(&mut self) -> Option<&mut GameServerConnection> {
        self.server.as_mut()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.server
            .as_ref()
            .filter(|server| server.connection.handshake_state() != HandshakeState::Connected)
            .map(GameServerConnection::id)
    }

    pub fn ping_time(&self) -> Option<Duration> {
        self.server.as_ref().map(|server| server.connection.ping.ping_time())
    }

    pub fn lag(&self) -> Option<Duration> {
        self.server.as_ref().map(|server| server.connection.ping.lag())
    }

    pub fn frames_ago(&self, message_frame: u32, local_frame: u32) -> Option<f32> {
        self.server
            .as_ref()
            .map(|server| server.connection.ping.frames_ago(message_frame, local_frame))
    }

    /// Queues a message to the server. Dropped silently when not connected.
    pub fn send(&mut self, body: impl Into<MessageBody>) {
        let body = body.into();
        let Some(server) = self.server.as_mut() else {
            log::debug!("Not connected, dropping {}", body.name());
            return;
        };
        if !server.connection.is_active() {
            return;
        }
        if let Err(e) = server.connection.send(&body) {
            log::debug!("Sending {} failed: {e}", body.name());
        }
    }

    /// Closes the server connection immediately with a close notice.
    pub fn disconnect(&mut self) {
        self.pending = None;
        if let Some(server) = self.server.as_mut() {
            server.connection.mark_for_removal(DropReason::Shutdown);
        }
        self.sweep();
    }

    pub fn tick(&mut self, game: &mut G, now: Instant) {
        self.poll_connector(now);

        let inbound = self.receive(game, now);
        if !inbound.is_empty() {
            self.handlers.dispatch(&inbound, game, &mut self.outbox);
        }
        self.flush_outbox();

        self.advance_handshake(now);
        self.send_ping(game, now);
        self.report_arena_status(game);
        self.sweep();
    }

    fn poll_connector(&mut self, now: Instant) {
        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        let Some(result) = pending.connector.poll() else {
            return;
        };
        let callback = pending.callback.take();
        self.pending = None;

        match result {
            Ok(transport) => {
                let addr = transport.remote_addr();
                log::info!("Connected to {addr}");
                if let Some(callback) = callback {
                    callback(Ok(addr));
                }
                self.start_handshake(transport, now);
                self.events.push_back(SessionEvent::Connected { addr });
            }
            Err(error) => {
                log::warn!("Connecting failed: {error}");
                if let Some(callback) = callback {
                    callback(Err(&error));
                }
                self.events.push_back(SessionEvent::ConnectFailed {
                    error: error.to_string(),
                });
            }
        }
    }

    fn start_handshake(&mut self, transport: Box<dyn Transport>, now: Instant) {
        let udp_port = transport.local_udp_port();
        let mut connection = Connection::new(0, transport, &self.config, now);
        let request = MessageBody::from(HandshakeRequest {
            protocol_version: PROTOCOL_VERSION,
            udp_port,
        });
        // A failed send surfaces again through the transport's error queue.
        if let Err(e) = connection.send(&request) {
            log::warn!("Handshake request failed: {e}");
        }
        self.reported_running_arena = None;
        self.server = Some(GameServerConnection::new(connection));
    }

    fn receive(&mut self, game: &G, now: Instant) -> Vec<(Message, f32)> {
        let mut inbound = Vec::new();
        let Some(server) = self.server.as_mut() else {
            return inbound;
        };
        let connection = &mut server.connection;
        if !connection.is_active() {
            return inbound;
        }

        let local_frame = game.frame_number();
        for result in connection.receive(&self.registry) {
            if !connection.is_active() {
                break;
            }
            let received = match result {
                Ok(received) => received,
                Err(e) => {
                    if connection.record_protocol_error(&e, self.config.max_protocol_errors) {
                        connection.mark_for_removal(DropReason::ProtocolErrors);
                    }
                    continue;
                }
            };
            let source = received.source.and_then(|source| source.socket());

            match &received.message.body {
                MessageBody::HandshakeReply(reply) => {
                    if connection.handshake_state() != HandshakeState::Connected {
                        continue;
                    }
                    connection.set_id(reply.connection_id);
                    connection.set_challenge(reply.challenge);
                    log::info!("Assigned connection id {}", reply.connection_id);
                    if !connection.transport().needs_udp_handshake() {
                        continue;
                    }
                    if let PeerAddr::Socket(server_addr) = connection.remote_addr() {
                        let udp_addr = SocketAddr::new(server_addr.ip(), reply.udp_port);
                        connection.transport_mut().set_unreliable_remote(udp_addr);
                    }
                    connection.set_handshake_state(HandshakeState::AwaitingHandshake);
                    send_udp_handshake(connection, now);
                }
                MessageBody::UdpHandshake(probe) => {
                    // Server probes punch our NAT; answering from here opens the path.
                    if probe.connection_id != connection.id() || probe.challenge != connection.challenge() {
                        continue;
                    }
                    if let Some(source) = source {
                        let answer = MessageBody::from(probe.clone());
                        if let Err(e) = connection.send_datagram_to(source, &answer) {
                            log::debug!("Answering UDP probe from {source} failed: {e}");
                        }
                    }
                }
                MessageBody::HandshakeComplete(complete) => {
                    if connection.is_handshaken() {
                        continue;
                    }
                    connection.set_id(complete.connection_id);
                    connection.set_handshake_state(HandshakeState::Handshaken);
                    log::info!("Handshake with server complete");
                    self.events.push_back(SessionEvent::HandshakeCompleted {
                        connection_id: complete.connection_id,
                    });
                }
                MessageBody::ConnectionClosing(closing) => {
                    log::info!("Server closed the connection: {}", closing.reason);
                    connection.mark_for_removal(DropReason::ClosedByPeer(Some(closing.reason.clone())));
                }
                MessageBody::Ping(ping) => {
                    let reply = MessageBody::from(PingInfo::reply_to(ping, local_frame));
                    if let Err(e) = connection.send(&reply) {
                        log::debug!("Ping reply failed: {e}");
                    }
                }
                MessageBody::PingReply(reply) => connection.ping.on_reply(reply, now, local_frame),
                body if body.is_connection_control() => {
                    log::debug!("Ignoring {} from server", body.name());
                }
                body => {
                    if !connection.is_handshaken() {
                        log::debug!("Dropping {} before handshake", body.name());
                        continue;
                    }
                    match body {
                        MessageBody::GameSettings(_) => server.has_game_settings = true,
                        MessageBody::ArenaStart(start) => server.current_arena = Some(start.arena_name),
                        MessageBody::PlayerSettingsReply(reply) => {
                            server.registered_players.extend(reply.assignments.iter().copied())
                        }
                        _ => {}
                    }
                    let frames_ago = received
                        .message
                        .frame_number()
                        .map(|frame| connection.ping.frames_ago(frame, local_frame))
                        .unwrap_or(0.0);
                    inbound.push((received.message, frames_ago));
                }
            }
        }

        for error in connection.drain_errors() {
            let reason = match error {
                TransportError::Closed => DropReason::ClosedByPeer(None),
                other => {
                    log::warn!("Transport error: {other}");
                    DropReason::TransportFailure(other.to_string())
                }
            };
            connection.mark_for_removal(reason);
        }
        inbound
    }

    /// Everything a client handler queues goes to the server.
    fn flush_outbox(&mut self) {
        for (_, body) in self.outbox.take() {
            self.send(body);
        }
    }

    fn advance_handshake(&mut self, now: Instant) {
        let Some(server) = self.server.as_mut() else {
            return;
        };
        let connection = &mut server.connection;
        if !connection.is_active() || connection.is_handshaken() {
            return;
        }
        let timeout = self.config.handshake_timeout();
        if connection.handshake_elapsed(now) > timeout {
            log::warn!("{}", TransportError::HandshakeTimeout(timeout));
            connection.mark_for_removal(DropReason::HandshakeTimeout);
            return;
        }
        if connection.handshake_state() == HandshakeState::AwaitingHandshake
            && connection.handshake_retry_due(now, self.config.handshake_retry())
        {
            send_udp_handshake(connection, now);
        }
    }

    fn send_ping(&mut self, game: &G, now: Instant) {
        let Some(server) = self.server.as_mut() else {
            return;
        };
        let connection = &mut server.connection;
        if !connection.is_active() || !connection.is_handshaken() {
            return;
        }
        if connection.ping.is_silently_dead() {
            log::warn!("{}", TransportError::PingTimeout(connection.ping.outstanding()));
            connection.mark_for_removal(DropReason::PingTimeout);
            return;
        }
        if connection.ping.is_due(now) {
            let ping = MessageBody::from(connection.ping.make_ping(now, game.frame_number()));
            if let Err(e) = connection.send(&ping) {
                log::debug!("Ping failed: {e}");
            }
        }
    }

    fn report_arena_status(&mut self, game: &G) {
        if !self.is_connected() {
            return;
        }
        let running = game.is_running_arena();
        if self.reported_running_arena == Some(running) {
            return;
        }
        self.reported_running_arena = Some(running);
        self.send(ArenaStatus {
            is_running_arena: running,
        });
    }

    fn sweep(&mut self) {
        let pending = self
            .server
            .as_ref()
            .is_some_and(|server| server.connection.removal_state() == RemovalState::PendingRemoval);
        if !pending {
            return;
        }
        let Some(mut server) = self.server.take() else {
            return;
        };
        let reason = server
            .connection
            .drop_reason()
            .cloned()
            .unwrap_or(DropReason::Shutdown);
        server.connection.finish_removal();
        log::info!("Disconnected from server: {reason}");
        self.events.push_back(SessionEvent::ConnectionDropped {
            connection_id: server.id(),
            reason,
        });
    }
}

fn send_udp_handshake(connection: &mut Connection, now: Instant) {
    let handshake = MessageBody::from(UdpHandshake {
        connection_id: connection.id(),
        challenge: connection.challenge(),
    });
    if let Err(e) = connection.send(&handshake) {
        log::debug!("UDP handshake send failed: {e}");
    }
    connection.note_handshake_sent(now);
}
