use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use glam::Vec2;
use tokio::runtime::Handle;

use skirmish::game::register_server_handlers;
use skirmish::net::transport::SocketListener;
use skirmish::net::{
    ArenaState, CanonicalString, ConnectionId, GobDeletion, Listener, MessageRegistry, PeerAddr,
    SerializationModeFlags, ServerSession, SessionEvent,
};
use skirmish::{Controls, GameState, GobKind};

use crate::config::ServerConfig;

const WALL_SIZE: Vec2 = Vec2::new(40.0, 40.0);
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

pub struct GameServer {
    session: ServerSession<GameState>,
    game: GameState,
    config: ServerConfig,
    playlist: Vec<CanonicalString>,
    next_arena: usize,
    /// Frame before which no new arena starts.
    intermission_until: u32,
    /// Ship gobs clients currently know about.
    known_ships: BTreeSet<u16>,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    running: Arc<AtomicBool>,
}

impl GameServer {
    pub fn bind(handle: &Handle, config: ServerConfig, registry: Arc<MessageRegistry>) -> Result<Self> {
        let listener = SocketListener::bind(handle, config.bind)
            .with_context(|| format!("binding {}", config.bind))?;
        Self::with_listener(config, registry, Box::new(listener))
    }

    pub fn with_listener(
        config: ServerConfig,
        registry: Arc<MessageRegistry>,
        listener: Box<dyn Listener>,
    ) -> Result<Self> {
        let mut game = GameState::default();
        game.frame_rate = config.tick_rate;
        game.settings.time_limit_secs = config.time_limit_secs;

        let playlist = config
            .arena_playlist
            .iter()
            .map(|name| {
                game.strings
                    .get(name)
                    .with_context(|| format!("unknown arena '{name}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        if playlist.is_empty() {
            anyhow::bail!("arena playlist is empty");
        }
        game.settings.arena_playlist = playlist.clone();

        let net = skirmish::NetConfig {
            frame_rate: config.tick_rate,
            ..config.net.clone()
        };
        let mut session = ServerSession::new(net, registry, listener).with_max_connections(config.max_clients);
        register_server_handlers(session.handlers_mut());

        Ok(Self {
            session,
            game,
            playlist,
            next_arena: 0,
            intermission_until: 0,
            known_ships: BTreeSet::new(),
            tick_duration: config.tick_duration(),
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
            running: Arc::new(AtomicBool::new(true)),
            config,
        })
    }

    pub fn local_addr(&self) -> PeerAddr {
        self.session.local_addr()
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn run(&mut self) {
        let mut last_status = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            let now = Instant::now();
            self.tick_once(now);
            if now.duration_since(last_status) >= STATUS_INTERVAL {
                last_status = now;
                self.log_status();
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown();
    }

    fn log_status(&self) {
        let arena = match self.game.arena.as_ref() {
            Some(arena) if self.game.arena_active => self.game.strings.resolve(arena.name).unwrap_or("?"),
            _ => "none",
        };
        log::info!(
            "{} client(s), {} in game, arena {}, {:?} left",
            self.session.active_count(),
            self.session.handshaken_count(),
            arena,
            self.game.time_left().unwrap_or_default()
        );
    }

    pub fn shutdown(&mut self) {
        log::info!("Closing {} connection(s)", self.session.active_count());
        self.session.shutdown(&mut self.game);
    }

    /// Runs every whole tick that has elapsed since the last call.
    pub fn tick_once(&mut self, now: Instant) {
        self.accumulator += now.saturating_duration_since(self.last_tick_time);
        self.last_tick_time = now;

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick(now);
        }
    }

    pub fn tick(&mut self, now: Instant) {
        self.game.advance_frame();
        self.session.tick(&mut self.game, now);

        let events: Vec<SessionEvent> = self.session.drain_events().collect();
        for event in events {
            self.handle_event(event);
        }

        self.update_arena();
        self.announce_removed_ships();
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ArenaStateChanged {
                connection_id,
                state: ArenaState::Starting,
            } => self.send_arena_contents(connection_id),
            SessionEvent::ConnectionDropped {
                connection_id,
                reason,
            } => log::info!("Client {connection_id} left: {reason}"),
            SessionEvent::ConnectionRejected { addr, reason } => {
                log::info!("Turned away {addr}: {reason}");
            }
            other => log::debug!("{other:?}"),
        }
    }

    fn send_arena_contents(&mut self, connection_id: ConnectionId) {
        let Some(arena) = self.game.arena.as_ref() else {
            return;
        };
        match arena.creation_message(self.game.frame_number, None, &self.game.strings) {
            Ok(creation) => self.session.send_to(connection_id, creation),
            Err(e) => log::error!("Cannot describe arena to client {connection_id}: {e}"),
        }
    }

    fn has_pilots(&self) -> bool {
        self.game.players().any(|player| !player.is_disconnected)
    }

    fn update_arena(&mut self) {
        if !self.game.arena_active {
            if self.has_pilots() && self.game.frame_number >= self.intermission_until {
                self.start_next_arena();
            }
            return;
        }

        if self.game.is_time_up() {
            self.game.finish_arena();
            self.known_ships.clear();
            self.intermission_until = self
                .game
                .frame_number
                .wrapping_add(self.config.intermission_secs * self.config.tick_rate);
            log::info!("Arena over, standings: {:?}", self.game.standings);
            return;
        }

        self.spawn_missing_ships();
        self.fly_ships();
        self.broadcast_state();
    }

    fn start_next_arena(&mut self) {
        let name = self.playlist[self.next_arena % self.playlist.len()];
        self.next_arena += 1;

        let size = self.config.arena_size;
        let wall_count = self.config.wall_count;
        let arena = self.game.start_arena(name);
        for i in 0..wall_count {
            let angle = f32::from(i) / f32::from(wall_count) * std::f32::consts::TAU;
            arena.spawn_wall(Vec2::from_angle(angle) * size * 0.4, WALL_SIZE);
        }
        log::info!(
            "Starting arena {} ({} walls)",
            self.game.strings.resolve(name).unwrap_or("?"),
            wall_count
        );
        self.spawn_missing_ships();
    }

    /// Gives every connected player without one a ship and tells clients.
    fn spawn_missing_ships(&mut self) {
        let pilots: Vec<u8> = self
            .game
            .players()
            .filter(|player| !player.is_disconnected)
            .map(|player| player.id)
            .collect();
        let Some(arena) = self.game.arena.as_mut() else {
            return;
        };

        let mut spawned = Vec::new();
        for player_id in pilots {
            if arena.ship_of(player_id).is_some() {
                continue;
            }
            let angle = f32::from(player_id) * 2.4;
            let position = Vec2::from_angle(angle) * self.config.arena_size * 0.2;
            spawned.push(arena.spawn_ship(player_id, position));
        }
        if spawned.is_empty() {
            return;
        }

        self.known_ships.extend(&spawned);
        match arena.creation_message(self.game.frame_number, Some(&spawned), &self.game.strings) {
            Ok(creation) => self.session.broadcast(creation),
            Err(e) => log::error!("Cannot announce new ships: {e}"),
        }
    }

    fn fly_ships(&mut self) {
        let pilots: Vec<(u8, Controls)> = self
            .game
            .players()
            .filter(|player| !player.is_disconnected)
            .map(|player| (player.id, player.controls))
            .collect();
        let dt = self.tick_duration.as_secs_f32();
        let size = self.config.arena_size;
        let physics = self.config.physics;

        if let Some(arena) = self.game.arena.as_mut() {
            for (player_id, controls) in pilots {
                let Some(ship_id) = arena.ship_of(player_id).map(|ship| ship.id) else {
                    continue;
                };
                if let Some(ship) = arena.get_mut(ship_id) {
                    ship.steer(&controls, &physics, dt);
                    ship.position = wrap(ship.position, size);
                }
            }
        }
        for player in self.game.players_mut() {
            player.controls.clear_pulses();
        }
    }

    fn broadcast_state(&mut self) {
        let frame = self.game.frame_number;
        if let Some(arena) = self.game.arena.as_ref() {
            match arena.update_message(frame, SerializationModeFlags::VARYING_FROM_SERVER) {
                Ok(update) if !update.batch.ids.is_empty() => self.session.broadcast(update),
                Ok(_) => {}
                Err(e) => log::error!("Cannot encode gob update: {e}"),
            }
        }

        if frame % self.config.player_update_interval.max(1) == 0 {
            let updates: Vec<_> = self
                .game
                .players()
                .filter(|player| !player.is_disconnected)
                .map(|player| player.update_message(frame))
                .collect();
            for update in updates {
                self.session.broadcast(update);
            }
        }
    }

    /// Tells clients about ships that vanished with their pilots.
    fn announce_removed_ships(&mut self) {
        let current: BTreeSet<u16> = self
            .game
            .arena
            .as_ref()
            .map(|arena| {
                arena
                    .gobs()
                    .filter(|gob| gob.kind == GobKind::Ship)
                    .map(|gob| gob.id)
                    .collect()
            })
            .unwrap_or_default();
        let removed: Vec<u16> = self.known_ships.difference(&current).copied().collect();
        if removed.is_empty() {
            return;
        }
        self.known_ships.retain(|id| current.contains(id));
        self.session.broadcast(GobDeletion {
            frame_number: self.game.frame_number,
            gob_ids: removed,
        });
    }
}

/// Keeps a position inside the square of side `size` centred on the origin.
fn wrap(position: Vec2, size: f32) -> Vec2 {
    if size <= 0.0 {
        return position;
    }
    let half = size / 2.0;
    Vec2::new(
        (position.x + half).rem_euclid(size) - half,
        (position.y + half).rem_euclid(size) - half,
    )
}

#[cfg(test)]
mod tests {
    use skirmish::game::register_client_handlers;
    use skirmish::net::{ClientSession, LocalRelayHub, NetConfig, RelayPeerId};
    use skirmish::net::PlayerControls;
    use skirmish::{Control, ControlState, DropReason};

    use super::*;

    struct Pilot {
        session: ClientSession<GameState>,
        game: GameState,
    }

    struct Setup {
        hub: LocalRelayHub,
        peer: RelayPeerId,
        registry: Arc<MessageRegistry>,
        server: GameServer,
        now: Instant,
    }

    impl Setup {
        fn new(config: ServerConfig) -> Self {
            let registry = Arc::new(MessageRegistry::standard().unwrap());
            let hub = LocalRelayHub::new();
            let listener = hub.listen();
            let peer = listener.peer_id();
            let server = GameServer::with_listener(config, Arc::clone(&registry), Box::new(listener)).unwrap();
            Self {
                hub,
                peer,
                registry,
                server,
                now: Instant::now(),
            }
        }

        fn join(&mut self, name: &str) -> Pilot {
            let mut session = ClientSession::new(NetConfig::default(), Arc::clone(&self.registry));
            register_client_handlers(session.handlers_mut());
            session.connect(Box::new(self.hub.connect(vec![self.peer])), None);
            let mut pilot = Pilot {
                session,
                game: GameState::default(),
            };
            self.run(&mut [&mut pilot], 4);

            let request = pilot
                .game
                .request_local_player(0, name, Default::default(), Default::default());
            pilot.session.send(request);
            self.run(&mut [&mut pilot], 3);
            pilot
        }

        fn run(&mut self, pilots: &mut [&mut Pilot], ticks: usize) {
            for _ in 0..ticks {
                self.server.tick(self.now);
                for pilot in pilots.iter_mut() {
                    pilot.game.advance_frame();
                    pilot.session.tick(&mut pilot.game, self.now);
                }
                self.now += self.server.tick_duration;
            }
        }
    }

    fn quick_config() -> ServerConfig {
        ServerConfig {
            time_limit_secs: 1,
            intermission_secs: 0,
            wall_count: 4,
            ..Default::default()
        }
    }

    #[test]
    fn test_rejects_unknown_arena() {
        let config = ServerConfig {
            arena_playlist: vec!["Atlantis".into()],
            ..Default::default()
        };
        let hub = LocalRelayHub::new();
        let registry = Arc::new(MessageRegistry::standard().unwrap());
        assert!(GameServer::with_listener(config, registry, Box::new(hub.listen())).is_err());
    }

    #[test]
    fn test_first_pilot_starts_arena_with_contents() {
        let mut setup = Setup::new(quick_config());
        let mut pilot = setup.join("ace");
        setup.run(&mut [&mut pilot], 6);

        assert!(setup.server.game.arena_active);
        assert!(pilot.game.running_arena);
        let arena = pilot.game.arena.as_ref().unwrap();
        assert_eq!(arena.wall_count(), 4);
        assert!(arena.ship_of(0).is_some());
        assert_eq!(arena.id, setup.server.game.arena.as_ref().unwrap().id);
    }

    #[test]
    fn test_thrust_moves_ship_everywhere() {
        let mut setup = Setup::new(quick_config());
        let mut pilot = setup.join("ace");
        setup.run(&mut [&mut pilot], 6);
        let start = pilot.game.arena.as_ref().and_then(|arena| arena.ship_of(0)).unwrap().position;

        for _ in 0..10 {
            pilot.session.send(PlayerControls {
                frame_number: pilot.game.frame_number,
                player_id: 0,
                controls: Controls::default().with(Control::Thrust, ControlState::new(1.0, false)),
            });
            setup.run(&mut [&mut pilot], 1);
        }
        setup.run(&mut [&mut pilot], 2);

        let server_ship = setup.server.game.arena.as_ref().and_then(|arena| arena.ship_of(0)).unwrap();
        assert!(server_ship.velocity.length() > 0.0);
        let client_ship = pilot.game.arena.as_ref().and_then(|arena| arena.ship_of(0)).unwrap();
        assert!(client_ship.position.distance(start) > 0.0);
    }

    #[test]
    fn test_time_limit_rotates_playlist() {
        let mut setup = Setup::new(quick_config());
        let mut pilot = setup.join("ace");
        let first = setup.server.game.arena.as_ref().map(|arena| arena.name);

        setup.run(&mut [&mut pilot], 70);

        let second = setup.server.game.arena.as_ref().map(|arena| arena.name);
        assert_ne!(first, second);
        assert_eq!(second, setup.server.game.strings.get("Amazonas"));
        assert!(setup.server.game.arena_active);
    }

    #[test]
    fn test_leaving_pilot_ship_is_deleted_for_others() {
        let mut setup = Setup::new(quick_config());
        let mut leaving = setup.join("leaver");
        let mut staying = setup.join("stayer");
        setup.run(&mut [&mut leaving, &mut staying], 6);
        let ship_id = staying
            .game
            .arena
            .as_ref()
            .and_then(|arena| arena.ship_of(0))
            .map(|ship| ship.id)
            .unwrap();

        let connection_id = leaving.session.connection_id().unwrap();
        assert!(setup.server.session.drop_client(connection_id, DropReason::Kicked));
        setup.run(&mut [&mut leaving, &mut staying], 3);

        let arena = staying.game.arena.as_ref().unwrap();
        assert!(arena.get(ship_id).is_none());
        assert!(arena.ship_of(1).is_some());
    }

    #[test]
    fn test_wrap_keeps_ships_in_bounds() {
        assert_eq!(wrap(Vec2::new(1100.0, -1100.0), 2000.0), Vec2::new(-900.0, 900.0));
        assert_eq!(wrap(Vec2::new(10.0, 20.0), 2000.0), Vec2::new(10.0, 20.0));
    }
}
