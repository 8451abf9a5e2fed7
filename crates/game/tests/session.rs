use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::Vec2;
use skirmish::game::{
    register_client_handlers, register_server_handlers, Arena, Control, ControlState, Controls,
    GameState, Gob, Player,
};
use skirmish::net::{
    ArenaState, ClientSession, ConnectionId, Connector, DropReason, GobUpdate, LocalRelayHub,
    MessageRegistry, NetConfig, PlayerControls, RelayPeerId, SerializationModeFlags,
    ServerSession, SessionEvent, Transport,
};

fn registry() -> Arc<MessageRegistry> {
    Arc::new(MessageRegistry::standard().unwrap())
}

struct Peer {
    session: ClientSession<GameState>,
    game: GameState,
}

struct Harness {
    hub: LocalRelayHub,
    server_peer: RelayPeerId,
    server: ServerSession<GameState>,
    server_game: GameState,
    now: Instant,
}

impl Harness {
    fn new() -> Self {
        let hub = LocalRelayHub::new();
        let listener = hub.listen();
        let server_peer = listener.peer_id();
        let mut server = ServerSession::new(NetConfig::default(), registry(), Box::new(listener));
        register_server_handlers(server.handlers_mut());

        let mut server_game = GameState::default();
        let eris = server_game.strings.get("Eris").unwrap();
        server_game.settings.arena_playlist = vec![eris];
        server_game.settings.time_limit_secs = 120;

        Self {
            hub,
            server_peer,
            server,
            server_game,
            now: Instant::now(),
        }
    }

    fn connect(&mut self) -> Peer {
        let mut session = ClientSession::new(NetConfig::default(), registry());
        register_client_handlers(session.handlers_mut());
        session.connect(Box::new(self.hub.connect(vec![self.server_peer])), None);
        let mut peer = Peer {
            session,
            game: GameState::default(),
        };
        self.pump(&mut [&mut peer], 4);
        peer
    }

    fn pump(&mut self, peers: &mut [&mut Peer], rounds: usize) {
        for _ in 0..rounds {
            self.server.tick(&mut self.server_game, self.now);
            for peer in peers.iter_mut() {
                peer.session.tick(&mut peer.game, self.now);
            }
            self.now += Duration::from_millis(16);
        }
    }

    fn register_player(&mut self, peer: &mut Peer, name: &str) -> u8 {
        let request = peer
            .game
            .request_local_player(0, name, Default::default(), Default::default());
        peer.session.send(request);
        self.pump(&mut [&mut *peer], 3);
        peer.game.local_player_ids()[0]
    }
}

fn id_of(peer: &Peer) -> ConnectionId {
    peer.session.connection_id().unwrap()
}

#[test]
fn test_relay_handshake_delivers_settings() {
    let mut harness = Harness::new();
    let mut peer = harness.connect();

    assert!(peer.session.is_connected());
    assert_eq!(harness.server.handshaken_count(), 1);
    assert_eq!(peer.game.settings, harness.server_game.settings);

    let server_events: Vec<_> = harness.server.drain_events().collect();
    assert!(matches!(server_events[0], SessionEvent::ConnectionAccepted { .. }));
    assert!(server_events.contains(&SessionEvent::HandshakeCompleted {
        connection_id: id_of(&peer),
    }));
    let client_events: Vec<_> = peer.session.drain_events().collect();
    assert!(matches!(client_events[0], SessionEvent::Connected { .. }));
    assert!(matches!(client_events[1], SessionEvent::HandshakeCompleted { .. }));
}

#[test]
fn test_controls_reach_server_player() {
    let mut harness = Harness::new();
    for id in 0..3 {
        let mut other = Player::new(id, format!("bot{id}"));
        other.connection_id = Some(999);
        harness.server_game.insert_player(other);
    }
    let mut peer = harness.connect();
    let player_id = harness.register_player(&mut peer, "pilot");
    assert_eq!(player_id, 3);

    let controls = Controls::default().with(Control::Left, ControlState::new(1.0, false));
    peer.session.send(PlayerControls {
        frame_number: peer.game.frame_number,
        player_id,
        controls,
    });
    harness.pump(&mut [&mut peer], 2);

    let left = harness
        .server_game
        .player(3)
        .map(|player| player.controls.get(Control::Left).force);
    assert_eq!(left, Some(1.0));
}

#[test]
fn test_update_batch_stops_at_missing_gob() {
    let mut harness = Harness::new();
    let mut peer = harness.connect();
    let name = harness.server_game.settings.arena_playlist[0];

    let mut server_arena = Arena::new(Some(1), name);
    server_arena.insert(Gob::ship(5, 0, Vec2::new(12.0, 34.0)));
    server_arena.insert(Gob::ship(7, 1, Vec2::new(-1.0, -1.0)));
    let update = server_arena
        .update_message(0, SerializationModeFlags::VARYING_FROM_SERVER)
        .unwrap();
    assert_eq!(update.batch.ids, vec![5, 7]);

    let mut client_arena = Arena::new(Some(1), name);
    client_arena.insert(Gob::ship(5, 0, Vec2::ZERO));
    peer.game.arena = Some(client_arena);

    harness.server.broadcast(update);
    harness.pump(&mut [&mut peer], 2);

    let arena = peer.game.arena.as_ref().unwrap();
    assert_eq!(arena.get(5).map(|gob| gob.position), Some(Vec2::new(12.0, 34.0)));
    assert!(arena.get(7).is_none());

    // Nothing after the missing id is applied either.
    server_arena.insert(Gob::ship(9, 2, Vec2::new(50.0, 50.0)));
    let update: GobUpdate = server_arena
        .update_message(0, SerializationModeFlags::VARYING_FROM_SERVER)
        .unwrap();
    if let Some(arena) = peer.game.arena.as_mut() {
        arena.insert(Gob::ship(9, 2, Vec2::ZERO));
    }
    harness.server.broadcast(update);
    harness.pump(&mut [&mut peer], 2);

    let arena = peer.game.arena.as_ref().unwrap();
    assert_eq!(arena.get(9).map(|gob| gob.position), Some(Vec2::ZERO));
}

#[test]
fn test_handshake_timeout_drops_once_with_one_notice() {
    let hub = LocalRelayHub::new();
    let listener = hub.listen();
    let peer = listener.peer_id();
    let mut server: ServerSession<GameState> =
        ServerSession::new(NetConfig::default(), registry(), Box::new(listener));
    let mut game = GameState::default();

    // A peer that opens the link but never speaks.
    let mut silent: Box<dyn Transport> = hub.connect(vec![peer]).poll().unwrap().unwrap();

    let start = Instant::now();
    server.tick(&mut game, start);
    assert_eq!(server.active_count(), 1);
    for seconds in [5, 11, 12, 30] {
        server.tick(&mut game, start + Duration::from_secs(seconds));
    }

    let dropped: Vec<_> = server
        .drain_events()
        .filter_map(|event| match event {
            SessionEvent::ConnectionDropped { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(dropped, vec![DropReason::HandshakeTimeout]);
    assert_eq!(server.active_count(), 0);

    let frames = silent.drain_frames();
    assert_eq!(frames.len(), 1);
    let notice = registry().decode(&frames[0].bytes, 0, Instant::now()).unwrap();
    assert_eq!(notice.body.name(), "ConnectionClosing");
}

#[test]
fn test_drop_client_notifies_remaining_peers() {
    let mut harness = Harness::new();
    let mut leaving = harness.connect();
    let mut staying = harness.connect();
    let player_id = harness.register_player(&mut leaving, "leaver");
    harness.pump(&mut [&mut leaving, &mut staying], 2);
    assert!(staying.game.player(player_id).is_some());

    let leaving_id = id_of(&leaving);
    assert!(harness.server.drop_client(leaving_id, DropReason::Kicked));
    assert!(!harness.server.drop_client(leaving_id, DropReason::Kicked));
    harness.pump(&mut [&mut leaving, &mut staying], 2);

    assert!(staying.game.player(player_id).is_none());
    assert!(
        harness
            .server_game
            .player(player_id)
            .is_some_and(|player| player.is_disconnected)
    );
    assert!(!leaving.session.is_connected());
    let reasons: Vec<_> = leaving
        .session
        .drain_events()
        .filter_map(|event| match event {
            SessionEvent::ConnectionDropped { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec![DropReason::ClosedByPeer(Some("Kicked".into()))]);
}

#[test]
fn test_full_server_rejects_with_reason() {
    let mut harness = Harness::new();
    let listener = harness.hub.listen();
    harness.server_peer = listener.peer_id();
    harness.server =
        ServerSession::new(NetConfig::default(), registry(), Box::new(listener)).with_max_connections(1);

    let _first = harness.connect();
    let mut second = harness.connect();

    assert!(!second.session.is_connected());
    let rejected = harness
        .server
        .drain_events()
        .any(|event| matches!(event, SessionEvent::ConnectionRejected { .. }));
    assert!(rejected);
    assert!(second.session.drain_events().any(|event| {
        event
            == SessionEvent::ConnectionDropped {
                connection_id: 0,
                reason: DropReason::ClosedByPeer(Some("Server full".into())),
            }
    }));
}

#[test]
fn test_arena_lifecycle_follows_client_status() {
    let mut harness = Harness::new();
    let mut peer = harness.connect();
    harness.register_player(&mut peer, "pilot");
    let name = harness.server_game.settings.arena_playlist[0];
    harness.server_game.start_arena(name);
    harness.pump(&mut [&mut peer], 4);

    assert!(peer.game.running_arena);
    assert_eq!(peer.game.arena.as_ref().map(|arena| arena.name), Some(name));

    harness.server_game.finish_arena();
    harness.pump(&mut [&mut peer], 4);
    assert!(!peer.game.running_arena);

    let states: Vec<ArenaState> = harness
        .server
        .drain_events()
        .filter_map(|event| match event {
            SessionEvent::ArenaStateChanged { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            ArenaState::Starting,
            ArenaState::Playing,
            ArenaState::Finished,
            ArenaState::NotPlaying,
        ]
    );
}
