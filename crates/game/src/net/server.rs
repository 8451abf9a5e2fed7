//! Server side connection and session manager.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::config::NetConfig;
use super::connection::{ArenaState, Connection, GameClientConnection, HandshakeState, RemovalState};
use super::events::{DropReason, SessionEvent};
use super::handlers::{MessageHandlers, Outbox, Target};
use super::message::{ConnectionId, Message};
use super::messages::{
    ArenaFinish, ArenaStart, HandshakeComplete, HandshakeReply, MessageBody, PlayerDeletion,
    UdpHandshake,
};
use super::ping::PingInfo;
use super::protocol::PROTOCOL_VERSION;
use super::registry::MessageRegistry;
use super::transport::{Listener, PeerAddr, Transport, TransportError};

/// Game state the server session consults at connection lifecycle points.
pub trait ServerGameState {
    fn frame_number(&self) -> u32;

    fn is_arena_active(&self) -> bool;

    /// Whether the client's player settings are known, so it may start an arena.
    fn has_player_settings(&self, connection_id: ConnectionId) -> bool;

    /// Start notice for the running arena with its remaining time budget.
    fn arena_start(&self) -> Option<ArenaStart>;

    fn arena_finish(&self) -> Option<ArenaFinish>;

    /// Messages for a client that just completed its handshake.
    fn welcome(&mut self, connection_id: ConnectionId) -> Vec<MessageBody>;

    /// Marks the connection's players disconnected and returns their ids.
    fn disconnect_players(&mut self, connection_id: ConnectionId) -> Vec<u8>;
}

/// Decides whether an inbound connection is admitted, given the number of
/// currently active connections. `Err` carries the reason sent to the peer.
pub type AdmissionFn = Box<dyn FnMut(&PeerAddr, usize) -> Result<(), String> + Send>;

enum Inbound {
    Consumed,
    Handshaken,
    Gameplay(Message, f32),
}

pub struct ServerSession<G> {
    config: NetConfig,
    registry: Arc<MessageRegistry>,
    listener: Box<dyn Listener>,
    connections: BTreeMap<ConnectionId, GameClientConnection>,
    next_connection_id: ConnectionId,
    admission: AdmissionFn,
    handlers: MessageHandlers<G>,
    outbox: Outbox,
    events: VecDeque<SessionEvent>,
}

impl<G: ServerGameState> ServerSession<G> {
    pub fn new(config: NetConfig, registry: Arc<MessageRegistry>, listener: Box<dyn Listener>) -> Self {
        Self {
            config,
            registry,
            listener,
            connections: BTreeMap::new(),
            next_connection_id: 1,
            admission: Box::new(|_, _| Ok(())),
            handlers: MessageHandlers::new(),
            outbox: Outbox::default(),
            events: VecDeque::new(),
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.admission = Box::new(move |_, active| {
            if active < max {
                Ok(())
            } else {
                Err("Server full".to_string())
            }
        });
        self
    }

    pub fn set_admission(&mut self, admission: AdmissionFn) {
        self.admission = admission;
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn local_addr(&self) -> PeerAddr {
        self.listener.local_addr()
    }

    pub fn handlers_mut(&mut self) -> &mut MessageHandlers<G> {
        &mut self.handlers
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.events.drain(..)
    }

    /// One update pass. Never blocks on network I/O.
    pub fn tick(&mut self, game: &mut G, now: Instant) {
        self.accept_connections(now);
        self.route_unrouted(game);

        let inbound = self.receive(game, now);
        if !inbound.is_empty() {
            self.handlers.dispatch(&inbound, game, &mut self.outbox);
        }
        self.flush_outbox();

        self.advance_handshakes(now);
        self.send_pings(game, now);
        self.update_arena_states(game);
        self.sweep(game);
    }

    fn allocate_id(&mut self) -> ConnectionId {
        loop {
            let id = self.next_connection_id;
            self.next_connection_id = self.next_connection_id.wrapping_add(1).max(1);
            if !self.connections.contains_key(&id) {
                return id;
            }
        }
    }

    fn accept_connections(&mut self, now: Instant) {
        for transport in self.listener.poll_accept() {
            let addr = transport.remote_addr();
            let active = self.active_count();
            if let Err(reason) = (self.admission)(&addr, active) {
                log::info!("Rejected connection from {addr}: {reason}");
                let mut rejected = Connection::new(0, transport, &self.config, now);
                rejected.mark_for_removal(DropReason::Rejected(reason.clone()));
                rejected.finish_removal();
                self.events.push_back(SessionEvent::ConnectionRejected { addr, reason });
                continue;
            }

            let id = self.allocate_id();
            log::info!("Accepted connection {id} from {addr}");
            let connection = Connection::new(id, transport, &self.config, now);
            self.connections.insert(id, GameClientConnection::new(connection));
            self.events.push_back(SessionEvent::ConnectionAccepted {
                connection_id: id,
                addr,
            });
        }

        for error in self.listener.drain_errors() {
            log::warn!("Listener error: {error}");
        }
    }

    /// Datagrams from unknown addresses can only be UDP handshakes.
    fn route_unrouted(&mut self, game: &mut G) {
        for frame in self.listener.drain_unrouted() {
            let Some(PeerAddr::Socket(source)) = frame.source else {
                continue;
            };
            let message = match self.registry.decode(&frame.bytes, 0, frame.received_at) {
                Ok(message) => message,
                Err(e) => {
                    log::debug!("Dropping datagram from {source}: {e}");
                    continue;
                }
            };
            let Some(handshake) = message.get::<UdpHandshake>() else {
                log::debug!("Dropping {} from unbound address {source}", message.body.name());
                continue;
            };
            if self.bind_unreliable(handshake, source) {
                self.finish_handshake(handshake.connection_id, game);
            }
        }
    }

    fn bind_unreliable(&mut self, handshake: &UdpHandshake, source: SocketAddr) -> bool {
        let Some(client) = self.connections.get_mut(&handshake.connection_id) else {
            log::debug!("UDP handshake for unknown connection {}", handshake.connection_id);
            return false;
        };
        let connection = &mut client.connection;
        if !connection.is_active()
            || connection.handshake_state() != HandshakeState::AwaitingHandshake
            || connection.challenge() != handshake.challenge
        {
            log::debug!("Ignoring UDP handshake for connection {}", handshake.connection_id);
            return false;
        }
        connection.transport_mut().set_unreliable_remote(source);
        true
    }

    fn finish_handshake(&mut self, id: ConnectionId, game: &mut G) {
        let welcome = game.welcome(id);
        let Some(client) = self.connections.get_mut(&id) else {
            return;
        };
        let connection = &mut client.connection;
        connection.set_handshake_state(HandshakeState::Handshaken);
        log::info!("Connection {id} handshake complete");

        let complete = MessageBody::from(HandshakeComplete { connection_id: id });
        for body in std::iter::once(complete).chain(welcome) {
            if let Err(e) = connection.send(&body) {
                log::warn!("Sending {} to connection {id} failed: {e}", body.name());
            }
        }
        self.events.push_back(SessionEvent::HandshakeCompleted { connection_id: id });
    }

    fn receive(&mut self, game: &mut G, now: Instant) -> Vec<(Message, f32)> {
        let local_frame = game.frame_number();
        let mut inbound = Vec::new();
        let mut handshaken = Vec::new();

        for client in self.connections.values_mut() {
            if !client.connection.is_active() {
                continue;
            }
            for result in client.connection.receive(&self.registry) {
                if !client.connection.is_active() {
                    break;
                }
                let received = match result {
                    Ok(received) => received.message,
                    Err(e) => {
                        if client
                            .connection
                            .record_protocol_error(&e, self.config.max_protocol_errors)
                        {
                            client.connection.mark_for_removal(DropReason::ProtocolErrors);
                        }
                        continue;
                    }
                };
                match handle_connection_message(client, received, local_frame, now) {
                    Inbound::Consumed => {}
                    Inbound::Handshaken => handshaken.push(client.id()),
                    Inbound::Gameplay(message, frames_ago) => inbound.push((message, frames_ago)),
                }
            }

            // After frames, so a close notice queued before the error is seen.
            for error in client.connection.drain_errors() {
                let reason = match error {
                    TransportError::Closed => DropReason::ClosedByPeer(None),
                    other => {
                        log::warn!("Transport error on connection {}: {other}", client.id());
                        DropReason::TransportFailure(other.to_string())
                    }
                };
                client.connection.mark_for_removal(reason);
            }
        }

        for id in handshaken {
            self.finish_handshake(id, game);
        }
        inbound
    }

    fn flush_outbox(&mut self) {
        for (target, body) in self.outbox.take() {
            self.deliver(target, &body);
        }
    }

    fn deliver(&mut self, target: Target, body: &MessageBody) {
        let frame = match body.encode_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Cannot encode {}: {e}", body.name());
                return;
            }
        };
        let channel = body.channel();
        for client in self.connections.values_mut() {
            let id = client.id();
            let selected = match target {
                Target::One(target_id) => id == target_id,
                Target::All => true,
                Target::AllExcept(excluded) => id != excluded,
            };
            if !selected || !client.connection.is_active() || !client.connection.is_handshaken() {
                continue;
            }
            if let Err(e) = client.connection.send_frame(channel, frame.clone()) {
                log::debug!("Sending {} to connection {id} failed: {e}", body.name());
            }
        }
    }

    fn advance_handshakes(&mut self, now: Instant) {
        let timeout = self.config.handshake_timeout();
        let retry = self.config.handshake_retry();
        let probe_ports = self.config.nat_probe_ports;

        for client in self.connections.values_mut() {
            let connection = &mut client.connection;
            if !connection.is_active() || connection.is_handshaken() {
                continue;
            }
            let id = connection.id();
            if connection.handshake_elapsed(now) > timeout {
                log::warn!("Connection {id} did not complete its handshake in {timeout:?}");
                connection.mark_for_removal(DropReason::HandshakeTimeout);
                continue;
            }
            if connection.handshake_state() != HandshakeState::AwaitingHandshake
                || !connection.transport().needs_udp_handshake()
                || !connection.handshake_retry_due(now, retry)
            {
                continue;
            }
            let Some(base) = client.udp_probe_base.filter(|base| base.port() != 0) else {
                continue;
            };
            let probe = MessageBody::from(UdpHandshake {
                connection_id: id,
                challenge: connection.challenge(),
            });
            for port in (0..probe_ports).filter_map(|offset| base.port().checked_add(offset)) {
                let addr = SocketAddr::new(base.ip(), port);
                if let Err(e) = connection.send_datagram_to(addr, &probe) {
                    log::debug!("UDP probe to {addr} failed: {e}");
                }
            }
            connection.note_handshake_sent(now);
        }
    }

    fn send_pings(&mut self, game: &G, now: Instant) {
        let local_frame = game.frame_number();
        for client in self.connections.values_mut() {
            let connection = &mut client.connection;
            if !connection.is_active() || !connection.is_handshaken() {
                continue;
            }
            if connection.ping.is_silently_dead() {
                let missed = connection.ping.outstanding();
                log::warn!(
                    "Connection {}: {}",
                    connection.id(),
                    TransportError::PingTimeout(missed)
                );
                connection.mark_for_removal(DropReason::PingTimeout);
                continue;
            }
            if connection.ping.is_due(now) {
                let ping = MessageBody::from(connection.ping.make_ping(now, local_frame));
                if let Err(e) = connection.send(&ping) {
                    log::debug!("Ping to connection {} failed: {e}", connection.id());
                }
            }
        }
    }

    fn update_arena_states(&mut self, game: &G) {
        let arena_active = game.is_arena_active();
        for client in self.connections.values_mut() {
            if !client.connection.is_active() || !client.connection.is_handshaken() {
                continue;
            }
            let id = client.id();
            let next = match (client.arena_state, arena_active, client.is_running_arena) {
                (ArenaState::NotPlaying, true, _) if game.has_player_settings(id) => {
                    game.arena_start().map(|start| {
                        client.current_arena = Some(start.arena_name);
                        if let Err(e) = client.connection.send(&start.into()) {
                            log::warn!("Arena start to connection {id} failed: {e}");
                        }
                        ArenaState::Starting
                    })
                }
                (ArenaState::Starting, true, true) => Some(ArenaState::Playing),
                (ArenaState::Starting, false, _) => Some(ArenaState::NotPlaying),
                (ArenaState::Playing, false, _) => {
                    if let Some(finish) = game.arena_finish() {
                        if let Err(e) = client.connection.send(&finish.into()) {
                            log::warn!("Arena finish to connection {id} failed: {e}");
                        }
                    }
                    Some(ArenaState::Finished)
                }
                (ArenaState::Finished, _, false) => Some(ArenaState::NotPlaying),
                _ => None,
            };
            if let Some(state) = next {
                log::info!("Connection {id} arena {:?} -> {state:?}", client.arena_state);
                client.arena_state = state;
                self.events.push_back(SessionEvent::ArenaStateChanged {
                    connection_id: id,
                    state,
                });
            }
        }
    }

    /// Removes every connection marked for removal. Only runs at tick end.
    fn sweep(&mut self, game: &mut G) {
        let pending: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|client| client.connection.removal_state() == RemovalState::PendingRemoval)
            .map(GameClientConnection::id)
            .collect();

        for id in pending {
            let Some(mut client) = self.connections.remove(&id) else {
                continue;
            };
            let reason = client
                .connection
                .drop_reason()
                .cloned()
                .unwrap_or(DropReason::Kicked);

            for player_id in game.disconnect_players(id) {
                self.deliver(Target::All, &PlayerDeletion { player_id }.into());
            }
            client.connection.finish_removal();

            log::info!("Connection {id} {reason}");
            self.events.push_back(SessionEvent::ConnectionDropped {
                connection_id: id,
                reason,
            });
        }
    }

    /// Queues a client for removal. Does nothing if it is already queued.
    pub fn drop_client(&mut self, id: ConnectionId, reason: DropReason) -> bool {
        self.connections
            .get_mut(&id)
            .is_some_and(|client| client.connection.mark_for_removal(reason))
    }

    pub fn shutdown(&mut self, game: &mut G) {
        for client in self.connections.values_mut() {
            client.connection.mark_for_removal(DropReason::Shutdown);
        }
        self.sweep(game);
    }

    pub fn send_to(&mut self, id: ConnectionId, body: impl Into<MessageBody>) {
        self.deliver(Target::One(id), &body.into());
    }

    /// Sends to every handshaken client.
    pub fn broadcast(&mut self, body: impl Into<MessageBody>) {
        self.deliver(Target::All, &body.into());
    }

    pub fn broadcast_except(&mut self, excluded: ConnectionId, body: impl Into<MessageBody>) {
        self.deliver(Target::AllExcept(excluded), &body.into());
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&GameClientConnection> {
        self.connections.get(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &GameClientConnection> {
        self.connections.values()
    }

    pub fn active_count(&self) -> usize {
        self.connections
            .values()
            .filter(|client| client.connection.is_active())
            .count()
    }

    pub fn handshaken_count(&self) -> usize {
        self.connections
            .values()
            .filter(|client| client.connection.is_active() && client.connection.is_handshaken())
            .count()
    }

    pub fn ping_time(&self, id: ConnectionId) -> Option<Duration> {
        self.connections.get(&id).map(|client| client.connection.ping.ping_time())
    }

    pub fn lag(&self, id: ConnectionId) -> Option<Duration> {
        self.connections.get(&id).map(|client| client.connection.ping.lag())
    }

    /// Age in frames of a message from `id` stamped with `message_frame`.
    pub fn frames_ago(&self, id: ConnectionId, message_frame: u32, local_frame: u32) -> Option<f32> {
        self.connections
            .get(&id)
            .map(|client| client.connection.ping.frames_ago(message_frame, local_frame))
    }

    pub fn elapsed_since(&self, id: ConnectionId, message_frame: u32, local_frame: u32) -> Option<Duration> {
        self.connections.get(&id).map(|client| {
            let ping = &client.connection.ping;
            ping.frames_to_duration(ping.frames_ago(message_frame, local_frame))
        })
    }
}

fn handle_connection_message(
    client: &mut GameClientConnection,
    message: Message,
    local_frame: u32,
    now: Instant,
) -> Inbound {
    let id = client.id();
    let connection = &mut client.connection;

    match &message.body {
        MessageBody::HandshakeRequest(request) => {
            if connection.is_handshaken() {
                return Inbound::Consumed;
            }
            if request.protocol_version != PROTOCOL_VERSION {
                log::warn!(
                    "Connection {id} speaks protocol {}, expected {PROTOCOL_VERSION}",
                    request.protocol_version
                );
                connection.mark_for_removal(DropReason::VersionMismatch);
                return Inbound::Consumed;
            }
            let reply = MessageBody::from(HandshakeReply {
                connection_id: id,
                challenge: connection.challenge(),
                udp_port: connection.transport().local_udp_port(),
            });
            if let Err(e) = connection.send(&reply) {
                log::warn!("Handshake reply to connection {id} failed: {e}");
                return Inbound::Consumed;
            }
            if !connection.transport().needs_udp_handshake() {
                return Inbound::Handshaken;
            }
            if let PeerAddr::Socket(remote) = connection.remote_addr() {
                client.udp_probe_base = Some(SocketAddr::new(remote.ip(), request.udp_port));
            }
            connection.set_handshake_state(HandshakeState::AwaitingHandshake);
            Inbound::Consumed
        }
        MessageBody::ConnectionClosing(closing) => {
            log::info!("Connection {id} closing: {}", closing.reason);
            connection.mark_for_removal(DropReason::ClosedByPeer(Some(closing.reason.clone())));
            Inbound::Consumed
        }
        MessageBody::Ping(ping) => {
            let reply = MessageBody::from(PingInfo::reply_to(ping, local_frame));
            if let Err(e) = connection.send(&reply) {
                log::debug!("Ping reply to connection {id} failed: {e}");
            }
            Inbound::Consumed
        }
        MessageBody::PingReply(reply) => {
            connection.ping.on_reply(reply, now, local_frame);
            Inbound::Consumed
        }
        MessageBody::ArenaStatus(status) => {
            client.is_running_arena = status.is_running_arena;
            Inbound::Consumed
        }
        body if body.is_connection_control() => {
            log::debug!("Ignoring {} from connection {id}", body.name());
            Inbound::Consumed
        }
        _ => gameplay(connection, message, local_frame),
    }
}

fn gameplay(connection: &Connection, message: Message, local_frame: u32) -> Inbound {
    if !connection.is_handshaken() {
        log::debug!(
            "Dropping {} from connection {} before handshake",
            message.body.name(),
            connection.id()
        );
        return Inbound::Consumed;
    }
    let frames_ago = message
        .frame_number()
        .map(|frame| connection.ping.frames_ago(frame, local_frame))
        .unwrap_or(0.0);
    Inbound::Gameplay(message, frames_ago)
}
